//! Tokenizer for the query-expression language.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    Float(f64),
    String(String),
    Identifier(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character of the token.
    pub pos: usize,
}

// Longest operators first so that `<=` wins over `<`.
const PUNCTUATION: &[&str] = &[
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[",
    "]", ",", ".", "#",
];

/// Split an expression into tokens, always terminated by [`TokenKind::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut lexer = Lexer {
        input,
        chars: input.char_indices().collect(),
        cursor: 0,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    chars: Vec<(usize, char)>,
    cursor: usize,
}

impl Lexer<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.cursor).map(|(_, c)| *c)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.cursor + offset).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.cursor)
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len())
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.cursor += 1;
        }

        let pos = self.offset();
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos,
            });
        };

        let kind = if c.is_ascii_digit() {
            self.number(pos)?
        } else if c == '\'' || c == '"' {
            self.string(c, pos)?
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            self.identifier()
        } else {
            self.punct(pos)?
        };

        Ok(Token { kind, pos })
    }

    fn number(&mut self, pos: usize) -> Result<TokenKind, ExprError> {
        let mut literal = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                literal.push(c);
            } else if c == '_' {
                // digit separator
            } else if c == '.' && !is_float && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit())
            {
                is_float = true;
                literal.push(c);
            } else if (c == 'e' || c == 'E')
                && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit() || d == '-' || d == '+')
            {
                is_float = true;
                literal.push(c);
                self.cursor += 1;
                if let Some(sign) = self.peek().filter(|s| *s == '-' || *s == '+') {
                    literal.push(sign);
                    self.cursor += 1;
                }
                continue;
            } else {
                break;
            }
            self.cursor += 1;
        }

        if is_float {
            literal
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|e| ExprError::parse(pos, format!("invalid float literal {literal:?}: {e}")))
        } else {
            literal.parse::<i64>().map(TokenKind::Integer).map_err(|e| {
                ExprError::parse(pos, format!("invalid integer literal {literal:?}: {e}"))
            })
        }
    }

    fn string(&mut self, quote: char, pos: usize) -> Result<TokenKind, ExprError> {
        self.cursor += 1;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ExprError::parse(pos, "literal not terminated"));
            };
            self.cursor += 1;
            match c {
                c if c == quote => return Ok(TokenKind::String(value)),
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(ExprError::parse(pos, "literal not terminated"));
                    };
                    self.cursor += 1;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                }
                other => value.push(other),
            }
        }
    }

    fn identifier(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                name.push(c);
                self.cursor += 1;
            } else {
                break;
            }
        }
        TokenKind::Identifier(name)
    }

    fn punct(&mut self, pos: usize) -> Result<TokenKind, ExprError> {
        let rest = &self.input[pos..];
        for candidate in PUNCTUATION {
            if rest.starts_with(candidate) {
                self.cursor += candidate.chars().count();
                return Ok(TokenKind::Punct(candidate));
            }
        }
        let c = self.peek().unwrap_or_default();
        Err(ExprError::parse(pos, format!("unexpected character {c:?}")))
    }
}
