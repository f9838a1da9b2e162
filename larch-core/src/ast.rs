//! Surface syntax tree produced by the parser.
//!
//! Nodes are untyped; the semantic processor wraps them into typed IR
//! without mutating them. Every node carries its source position for
//! diagnostics.

use crate::span::Pos;

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// `-`
    Neg,
    /// `!`
    Not,
    /// `~`
    BitNot,
}

impl UnOp {
    /// Method-name convention for operator overloading on user and
    /// host types.
    pub fn method_name(self) -> &'static str {
        match self {
            UnOp::Neg => "negate",
            UnOp::Not => "logicNot",
            UnOp::BitNot => "not",
        }
    }
}

/// Infix operators, ordered by the precedence table in [`BinOp::precedence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    UShr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
    Assign,
}

impl BinOp {
    pub fn from_str(text: &str) -> Option<BinOp> {
        let op = match text {
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Rem,
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "<<" => BinOp::Shl,
            ">>" => BinOp::Shr,
            ">>>" => BinOp::UShr,
            "<" => BinOp::Lt,
            ">" => BinOp::Gt,
            "<=" => BinOp::Le,
            ">=" => BinOp::Ge,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            "&" => BinOp::BitAnd,
            "^" => BinOp::BitXor,
            "|" => BinOp::BitOr,
            "&&" => BinOp::And,
            "||" => BinOp::Or,
            "=" => BinOp::Assign,
            _ => return None,
        };
        Some(op)
    }

    /// Binding power, tighter binds higher. Total order over the table.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Mul | BinOp::Div | BinOp::Rem => 110,
            BinOp::Add | BinOp::Sub => 100,
            BinOp::Shl | BinOp::Shr | BinOp::UShr => 90,
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => 80,
            BinOp::Eq | BinOp::Ne => 70,
            BinOp::BitAnd => 60,
            BinOp::BitXor => 50,
            BinOp::BitOr => 40,
            BinOp::And => 30,
            BinOp::Or => 20,
            BinOp::Assign => 10,
        }
    }

    /// Assignment is the only right-associative entry.
    pub fn right_assoc(self) -> bool {
        matches!(self, BinOp::Assign)
    }

    /// Method-name convention for operator overloading.
    pub fn method_name(self) -> Option<&'static str> {
        let name = match self {
            BinOp::Add => "add",
            BinOp::Sub => "subtract",
            BinOp::Mul => "multiply",
            BinOp::Div => "divide",
            BinOp::Rem => "remainder",
            BinOp::Shl => "shiftLeft",
            BinOp::Shr => "shiftRight",
            BinOp::UShr => "unsignedShiftRight",
            BinOp::Gt => "gt",
            BinOp::Lt => "lt",
            BinOp::Ge => "ge",
            BinOp::Le => "le",
            BinOp::Eq => "equal",
            BinOp::Ne => "notEqual",
            BinOp::BitAnd => "and",
            BinOp::BitOr => "or",
            BinOp::BitXor => "xor",
            BinOp::And | BinOp::Or | BinOp::Assign => return None,
        };
        Some(name)
    }
}

/// Reference to a type, resolved during semantic analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub kind: TypeRefKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRefKind {
    /// Named type: a primitive, a declared type or a host type.
    Name(String),
    /// Function type `fn(T1, T2): R`; missing result means unit.
    Fn {
        params: Vec<TypeRef>,
        ret: Option<Box<TypeRef>>,
    },
}

impl TypeRef {
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TypeRefKind::Name(name) => Some(name),
            TypeRefKind::Fn { .. } => None,
        }
    }
}

/// Parameter of a method, constructor or lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Missing on lambda parameters whose type is inferred from the
    /// target function type.
    pub ty: Option<TypeRef>,
    /// `T...` final parameter.
    pub variadic: bool,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    /// `L`-suffixed integer literal.
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Str(String),
    Char(char),
    Regex(String),
    Ident(String),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        target: Box<Expr>,
        name: String,
    },
    Lambda {
        params: Vec<Param>,
        body: Vec<Stmt>,
    },
    /// Hole left by syntax-error recovery. The surrounding partial
    /// structure (for example a binary operator that lost its right
    /// operand) is kept node-for-node.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Class(ClassDecl),
    Interface(InterfaceDecl),
    Fn(FnDecl),
    Let {
        name: String,
        ty: Option<TypeRef>,
        init: Option<Expr>,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        elifs: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Expr(Expr),
}

/// `class Name(params) [: Super, Iface...]` plus an indented body of
/// fields and methods. The parameter list doubles as the constructor
/// signature; each constructor parameter becomes a field.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub supers: Vec<TypeRef>,
    pub members: Vec<Member>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Field {
        name: String,
        ty: TypeRef,
        init: Option<Expr>,
        pos: Pos,
    },
    Method(FnDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDecl {
    pub name: String,
    pub supers: Vec<TypeRef>,
    /// Signatures only; bodies are `None`.
    pub methods: Vec<FnDecl>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<TypeRef>,
    pub body: Option<Vec<Stmt>>,
    pub is_static: bool,
    pub pos: Pos,
}
