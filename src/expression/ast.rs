//! Owned expression tree.
//!
//! oxc's AST borrows from an arena that lives only as long as the parse, so
//! template expressions are lowered once into this self-contained form and
//! kept on the directive that evaluates them.

use std::rc::Rc;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    TypeOf,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    In,
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Coalesce,
}

/// Plain `=` or a compound form carrying its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Compound(BinaryOp),
    Logical(LogicalOp),
}

#[derive(Debug, Clone)]
pub enum MemberKey {
    Static(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Target {
    Identifier(String),
    Member { object: Box<Expr>, property: MemberKey },
}

#[derive(Debug, Clone)]
pub enum Element {
    Item(Expr),
    Spread(Expr),
    Hole,
}

#[derive(Debug, Clone)]
pub enum PropertyName {
    Static(String),
    Computed(Expr),
}

#[derive(Debug, Clone)]
pub enum Property {
    Entry { key: PropertyName, value: Expr },
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Identifier(String),
    Array(Vec<Option<Pattern>>),
    Object(Vec<(String, Pattern)>),
    Default(Box<Pattern>, Box<Expr>),
}

impl Pattern {
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            Pattern::Identifier(name) => out.push(name.clone()),
            Pattern::Array(items) => items.iter().flatten().for_each(|p| p.names(out)),
            Pattern::Object(props) => props.iter().for_each(|(_, p)| p.names(out)),
            Pattern::Default(inner, _) => inner.names(out),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Statement {
    Let(Pattern, Option<Expr>),
    Expr(Expr),
    Return(Option<Expr>),
    If {
        test: Expr,
        consequent: Vec<Statement>,
        alternate: Vec<Statement>,
    },
    Block(Vec<Statement>),
}

#[derive(Debug, Clone)]
pub enum ArrowBody {
    Expr(Box<Expr>),
    Block(Vec<Statement>),
}

#[derive(Debug)]
pub struct Arrow {
    pub params: Vec<Pattern>,
    pub body: ArrowBody,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Identifier(String),
    Template {
        quasis: Vec<String>,
        expressions: Vec<Expr>,
    },
    Array(Vec<Element>),
    Object(Vec<Property>),
    Member {
        object: Box<Expr>,
        property: MemberKey,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<Element>,
        optional: bool,
    },
    New {
        constructor: String,
        arguments: Vec<Element>,
    },
    Unary {
        op: UnaryOp,
        argument: Box<Expr>,
    },
    Delete(Box<Target>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Target>,
        value: Box<Expr>,
    },
    Update {
        increment: bool,
        prefix: bool,
        target: Box<Target>,
    },
    Sequence(Vec<Expr>),
    Arrow(Rc<Arrow>),
}
