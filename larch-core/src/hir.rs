//! Typed intermediate representation.
//!
//! The semantic processor lowers the untyped AST into this form: every
//! expression carries its resolved [`Type`], names are resolved to
//! local slots, field indices or mangled method names, overloads are
//! picked, implicit conversions are explicit nodes, `elif` chains are
//! desugared into nested `If`, and lambdas are lifted into synthetic
//! static methods with their captures made explicit. Code generation
//! consumes this form without consulting any symbol table.

use crate::ast::{BinOp, UnOp};
use crate::span::Pos;
use crate::types::Type;

/// Index into a method's local slots. Parameters (including the
/// receiver and a lifted lambda's environment pointer) occupy the
/// leading slots in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct HProgram {
    /// Declaration order; emission sorts by FQN for determinism.
    pub types: Vec<TypeDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDefKind {
    Class,
    Interface,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub fqn: String,
    pub kind: TypeDefKind,
    pub supers: Vec<String>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub pos: Pos,
}

impl TypeDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub ty: Type,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalDef {
    pub name: String,
    pub ty: Type,
    /// Assigned-to from inside a lambda; lives in a heap cell and
    /// every access goes through `CellGet`/`CellSet`.
    pub boxed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub name: String,
    /// Export/import field name including the signature codes.
    pub mangled: String,
    pub params: Vec<ParamDef>,
    /// Element type of a trailing `T...` parameter.
    pub variadic: Option<Type>,
    pub ret: Type,
    pub is_static: bool,
    /// `None` on interface signatures.
    pub body: Option<Vec<HStmt>>,
    /// All locals, parameters first. Slots beyond the parameters are
    /// declared in the wasm function header.
    pub locals: Vec<LocalDef>,
    /// Set on lifted lambda bodies; the environment pointer is then
    /// the first parameter and `Env` reads index into it.
    pub is_lambda: bool,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HExpr {
    pub kind: HExprKind,
    pub ty: Type,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HExprKind {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Unit,

    Local(LocalId),
    /// Receiver of an instance method; local slot 0.
    This,
    /// Read of a captured variable out of the environment record.
    Env { index: usize },
    /// Heap-cell read/write for boxed captured locals.
    CellGet { cell: Box<HExpr> },
    CellSet { cell: Box<HExpr>, value: Box<HExpr> },

    SetLocal { local: LocalId, value: Box<HExpr> },
    GetField {
        target: Box<HExpr>,
        type_fqn: String,
        index: usize,
    },
    SetField {
        target: Box<HExpr>,
        type_fqn: String,
        index: usize,
        value: Box<HExpr>,
    },

    /// Primitive widening; the target type is the node's `ty`.
    Convert { value: Box<HExpr> },
    /// Box a value into `any`.
    BoxAny { value: Box<HExpr> },
    /// Recover a known type out of `any`; dispatch resolution proved
    /// the target type statically.
    UnboxAny { value: Box<HExpr> },

    Unary {
        op: UnOp,
        operand: Box<HExpr>,
    },
    /// Primitive binary op; the operand type picks the instruction.
    Binary {
        op: BinOp,
        lhs: Box<HExpr>,
        rhs: Box<HExpr>,
    },
    /// `&&` and `||` with short-circuit evaluation.
    Logic {
        and: bool,
        lhs: Box<HExpr>,
        rhs: Box<HExpr>,
    },

    /// Zeroed allocation of a type's field record; only appears inside
    /// the synthetic constructor body.
    AllocRecord { type_fqn: String },
    /// Constructor call; lowers to a call of the type's synthetic
    /// `new` method.
    New {
        type_fqn: String,
        args: Vec<HExpr>,
    },
    /// Statically-dispatched call on a declared type.
    CallMethod {
        /// `None` for static methods.
        target: Option<Box<HExpr>>,
        type_fqn: String,
        mangled: String,
        args: Vec<HExpr>,
    },
    /// Call into the host universe; lowers to a wasm import.
    CallHost {
        type_fqn: String,
        mangled: String,
        args: Vec<HExpr>,
    },
    /// Invoke a function value through the indirect-call table.
    CallClosure {
        target: Box<HExpr>,
        args: Vec<HExpr>,
    },
    /// Build a closure over a lifted lambda method.
    MakeClosure {
        type_fqn: String,
        mangled: String,
        captures: Vec<HExpr>,
    },
    /// Collect trailing arguments of a variadic call into a counted
    /// heap record.
    MakePack {
        elem: Type,
        args: Vec<HExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HStmt {
    pub kind: HStmtKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HStmtKind {
    Let {
        local: LocalId,
        init: Option<HExpr>,
    },
    Expr(HExpr),
    If {
        cond: HExpr,
        then_body: Vec<HStmt>,
        else_body: Vec<HStmt>,
    },
    While {
        cond: HExpr,
        body: Vec<HStmt>,
    },
    Return(Option<HExpr>),
    Break,
    Continue,
}

impl HExpr {
    pub fn unit(pos: Pos) -> HExpr {
        HExpr {
            kind: HExprKind::Unit,
            ty: Type::Unit,
            pos,
        }
    }
}

/// Mangled name for a method with the given signature, shared by
/// declaration emission and call sites.
pub fn mangle(name: &str, params: &[Type], variadic: Option<&Type>) -> String {
    let mut out = String::from(name);
    out.push_str("__");
    for p in params {
        out.push_str(&p.mangle_code());
    }
    if let Some(elem) = variadic {
        out.push_str(&Type::Pack(Box::new(elem.clone())).mangle_code());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangling_matches_signature() {
        assert_eq!(mangle("add", &[Type::Int, Type::Int], None), "add__ii");
        assert_eq!(mangle("println", &[], None), "println__");
        assert_eq!(
            mangle("maxOf", &[], Some(&Type::Int)),
            "maxOf__vi"
        );
        assert_eq!(
            mangle("tag", &[Type::Named(String::from("Point"))], None),
            "tag__o"
        );
    }
}
