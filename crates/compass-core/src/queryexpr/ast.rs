//! Syntax tree of the query-expression language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Identifier(String),
    /// `#`, the current element inside a list predicate.
    Pointer,
    Member {
        node: Box<Node>,
        property: String,
    },
    Index {
        node: Box<Node>,
        index: Box<Node>,
    },
    Array(Vec<Node>),
    Unary {
        op: UnaryOp,
        node: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Call {
        name: String,
        args: Vec<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Operator as written in the canonical expression syntax.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::Contains => "contains",
            BinaryOp::StartsWith => "startsWith",
            BinaryOp::EndsWith => "endsWith",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, BinaryOp::In | BinaryOp::NotIn)
    }

    /// Mirror a comparison so that `a < b` reads as `b > a`.
    pub fn flipped(&self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => *other,
        }
    }

    /// Binding power used by the parser. Higher binds tighter.
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 10,
            BinaryOp::And => 15,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::In
            | BinaryOp::NotIn
            | BinaryOp::Contains
            | BinaryOp::StartsWith
            | BinaryOp::EndsWith => 20,
            BinaryOp::Add | BinaryOp::Sub => 30,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 60,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Node {
    /// Whether any identifier reference occurs in this subtree.
    ///
    /// Subtrees without identifiers are folded into literals by the emitters.
    pub fn has_identifier(&self) -> bool {
        match self {
            Node::Identifier(_) => true,
            Node::Nil
            | Node::Bool(_)
            | Node::Integer(_)
            | Node::Float(_)
            | Node::String(_)
            | Node::Pointer => false,
            Node::Member { node, .. } | Node::Unary { node, .. } => node.has_identifier(),
            Node::Index { node, index } => node.has_identifier() || index.has_identifier(),
            Node::Array(items) => items.iter().any(Node::has_identifier),
            Node::Binary { left, right, .. } => left.has_identifier() || right.has_identifier(),
            Node::Call { args, .. } => args.iter().any(Node::has_identifier),
        }
    }

    /// Segments of an identifier or a member chain rooted at an identifier.
    ///
    /// `data.owner.name` yields `["data", "owner", "name"]`.
    pub fn field_path(&self) -> Option<Vec<String>> {
        match self {
            Node::Identifier(name) => Some(vec![name.clone()]),
            Node::Member { node, property } => {
                let mut path = node.field_path()?;
                path.push(property.clone());
                Some(path)
            }
            Node::Index { node, index } => match index.as_ref() {
                Node::String(key) => {
                    let mut path = node.field_path()?;
                    path.push(key.clone());
                    Some(path)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Short name of the node kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Nil => "NilNode",
            Node::Bool(_) => "BoolNode",
            Node::Integer(_) => "IntegerNode",
            Node::Float(_) => "FloatNode",
            Node::String(_) => "StringNode",
            Node::Identifier(_) => "IdentifierNode",
            Node::Pointer => "PointerNode",
            Node::Member { .. } => "MemberNode",
            Node::Index { .. } => "IndexNode",
            Node::Array(_) => "ArrayNode",
            Node::Unary { .. } => "UnaryNode",
            Node::Binary { .. } => "BinaryNode",
            Node::Call { .. } => "CallNode",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Nil => f.write_str("nil"),
            Node::Bool(b) => write!(f, "{b}"),
            Node::Integer(i) => write!(f, "{i}"),
            Node::Float(v) => write!(f, "{v}"),
            Node::String(s) => write!(f, "{s:?}"),
            Node::Identifier(name) => f.write_str(name),
            Node::Pointer => f.write_str("#"),
            Node::Member { node, property } => write!(f, "{node}.{property}"),
            Node::Index { node, index } => write!(f, "{node}[{index}]"),
            Node::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Node::Unary { op, node } => {
                let symbol = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Negate => "-",
                    UnaryOp::Plus => "+",
                };
                match node.as_ref() {
                    Node::Binary { .. } => write!(f, "{symbol}({node})"),
                    _ => write!(f, "{symbol}{node}"),
                }
            }
            Node::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
            Node::Call { name, args } => {
                write!(f, "{name}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Node]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
