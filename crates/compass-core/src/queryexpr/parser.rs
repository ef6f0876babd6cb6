//! Precedence-climbing parser producing [`Node`] trees.

use super::ast::{BinaryOp, Node, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use super::ExprError;

const UNARY_PRECEDENCE: u8 = 50;

/// Parse a complete expression. Trailing tokens are an error.
pub fn parse_expression(input: &str) -> Result<Node, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, cursor: 0 };
    if parser.at_eof() {
        return Err(ExprError::parse(0, "unexpected end of expression"));
    }
    let node = parser.expression(0)?;
    if !parser.at_eof() {
        let token = parser.current();
        return Err(ExprError::parse(
            token.pos,
            format!("unexpected token {}", describe(&token.kind)),
        ));
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // tokenize always terminates with Eof, so the last token is a safe fallback
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, offset: usize) -> &TokenKind {
        let idx = (self.cursor + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn at_eof(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Punct(p) if *p == punct)
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ExprError> {
        if self.is_punct(punct) {
            self.advance();
            Ok(())
        } else {
            let token = self.current();
            Err(ExprError::parse(
                token.pos,
                format!("expected {punct:?}, found {}", describe(&token.kind)),
            ))
        }
    }

    /// Binary operator at the cursor and how many tokens it spans.
    fn binary_operator(&self) -> Option<(BinaryOp, usize)> {
        let op = match self.peek_kind(0) {
            TokenKind::Punct(p) => match *p {
                "||" => BinaryOp::Or,
                "&&" => BinaryOp::And,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "%" => BinaryOp::Mod,
                _ => return None,
            },
            TokenKind::Identifier(word) => match word.as_str() {
                "or" => BinaryOp::Or,
                "and" => BinaryOp::And,
                "in" => BinaryOp::In,
                "contains" => BinaryOp::Contains,
                "startsWith" => BinaryOp::StartsWith,
                "endsWith" => BinaryOp::EndsWith,
                "not" => match self.peek_kind(1) {
                    TokenKind::Identifier(next) if next == "in" => return Some((BinaryOp::NotIn, 2)),
                    _ => return None,
                },
                _ => return None,
            },
            _ => return None,
        };
        Some((op, 1))
    }

    fn expression(&mut self, min_precedence: u8) -> Result<Node, ExprError> {
        let mut left = self.unary()?;

        while let Some((op, width)) = self.binary_operator() {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            for _ in 0..width {
                self.advance();
            }
            let right = self.expression(precedence + 1)?;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        let op = match self.peek_kind(0) {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Negate),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Identifier(word) if word == "not" => Some(UnaryOp::Not),
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let operand = self.expression(UNARY_PRECEDENCE)?;
                Ok(Node::Unary {
                    op,
                    node: Box::new(operand),
                })
            }
            None => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.primary()?;
        loop {
            if self.is_punct(".") {
                self.advance();
                let token = self.advance();
                match token.kind {
                    TokenKind::Identifier(property) => {
                        node = Node::Member {
                            node: Box::new(node),
                            property,
                        };
                    }
                    other => {
                        return Err(ExprError::parse(
                            token.pos,
                            format!("expected property name, found {}", describe(&other)),
                        ))
                    }
                }
            } else if self.is_punct("[") {
                self.advance();
                let index = self.expression(0)?;
                self.expect_punct("]")?;
                node = Node::Index {
                    node: Box::new(node),
                    index: Box::new(index),
                };
            } else {
                return Ok(node);
            }
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Integer(v) => Ok(Node::Integer(v)),
            TokenKind::Float(v) => Ok(Node::Float(v)),
            TokenKind::String(v) => Ok(Node::String(v)),
            TokenKind::Identifier(name) => match name.as_str() {
                "true" => Ok(Node::Bool(true)),
                "false" => Ok(Node::Bool(false)),
                "nil" | "null" => Ok(Node::Nil),
                _ if self.is_punct("(") => self.call(name),
                _ => Ok(Node::Identifier(name)),
            },
            TokenKind::Punct("#") => Ok(Node::Pointer),
            TokenKind::Punct("(") => {
                let inner = self.expression(0)?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            TokenKind::Punct("[") => {
                let items = self.list("]")?;
                Ok(Node::Array(items))
            }
            other => Err(ExprError::parse(
                token.pos,
                format!("unexpected token {}", describe(&other)),
            )),
        }
    }

    fn call(&mut self, name: String) -> Result<Node, ExprError> {
        self.expect_punct("(")?;
        let args = self.list(")")?;
        Ok(Node::Call { name, args })
    }

    /// Comma separated expressions up to and including `close`.
    fn list(&mut self, close: &str) -> Result<Vec<Node>, ExprError> {
        let mut items = Vec::new();
        if self.is_punct(close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.expression(0)?);
            if self.is_punct(",") {
                self.advance();
                // trailing comma
                if self.is_punct(close) {
                    self.advance();
                    return Ok(items);
                }
                continue;
            }
            self.expect_punct(close)?;
            return Ok(items);
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Integer(v) => format!("integer {v}"),
        TokenKind::Float(v) => format!("float {v}"),
        TokenKind::String(v) => format!("string {v:?}"),
        TokenKind::Identifier(v) => format!("identifier {v:?}"),
        TokenKind::Punct(p) => format!("{p:?}"),
        TokenKind::Eof => "end of expression".to_string(),
    }
}
