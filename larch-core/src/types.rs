//! Type system for Larch.
//!
//! Primitives map directly onto wasm value types; declared and host
//! types are named references into the compilation's type registry.
//! Function types use a single variadic-capable representation rather
//! than one interface per arity, while call sites still get strict
//! compile-time arity checking.

use wasm_encoder::ValType;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    Long,
    Float,
    Double,
    Bool,
    Char,
    Str,
    Unit,
    /// Top type for interop; any value converts to it (boxing rank)
    /// and method calls on it go through the dynamic dispatch table.
    Any,
    /// Declared class/interface or host type, by fully-qualified name.
    Named(String),
    /// First-class function value.
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    /// Variadic argument pack `T...`; only valid as a final parameter.
    Pack(Box<Type>),
}

impl Type {
    pub fn from_name(name: &str) -> Option<Type> {
        let ty = match name {
            "int" => Type::Int,
            "long" => Type::Long,
            "float" => Type::Float,
            "double" => Type::Double,
            "bool" => Type::Bool,
            "char" => Type::Char,
            "str" => Type::Str,
            "unit" => Type::Unit,
            "any" => Type::Any,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Long | Type::Float | Type::Double | Type::Char)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int | Type::Long | Type::Char)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Type::Named(_) | Type::Any | Type::Function { .. })
    }

    /// Numeric promotion order; higher absorbs lower.
    fn numeric_rank(&self) -> Option<u8> {
        match self {
            Type::Char => Some(0),
            Type::Int => Some(1),
            Type::Long => Some(2),
            Type::Float => Some(3),
            Type::Double => Some(4),
            _ => None,
        }
    }

    /// The wasm value type carrying this Larch type, if it is
    /// representable as a single value. `Unit` carries nothing.
    pub fn val_type(&self) -> Option<ValType> {
        match self {
            Type::Int | Type::Bool | Type::Char => Some(ValType::I32),
            Type::Long => Some(ValType::I64),
            Type::Float => Some(ValType::F32),
            Type::Double => Some(ValType::F64),
            // Strings pack pointer and length into one i64.
            Type::Str => Some(ValType::I64),
            // Objects, closures and boxed values are linear-memory
            // pointers.
            Type::Named(_) | Type::Any | Type::Function { .. } => Some(ValType::I32),
            Type::Pack(_) => Some(ValType::I32),
            Type::Unit => None,
        }
    }

    /// Short code used in mangled overload names.
    pub fn mangle_code(&self) -> String {
        match self {
            Type::Int => "i".into(),
            Type::Long => "l".into(),
            Type::Float => "f".into(),
            Type::Double => "d".into(),
            Type::Bool => "z".into(),
            Type::Char => "c".into(),
            Type::Str => "s".into(),
            Type::Unit => "u".into(),
            Type::Any => "a".into(),
            Type::Named(_) => "o".into(),
            Type::Function { .. } => "p".into(),
            Type::Pack(inner) => format!("v{}", inner.mangle_code()),
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Long => write!(f, "long"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Bool => write!(f, "bool"),
            Type::Char => write!(f, "char"),
            Type::Str => write!(f, "str"),
            Type::Unit => write!(f, "unit"),
            Type::Any => write!(f, "any"),
            Type::Named(name) => write!(f, "{}", name),
            Type::Function { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, "): {}", ret)
            }
            Type::Pack(inner) => write!(f, "{}...", inner),
        }
    }
}

/// How well an argument type matches a parameter type. The order is
/// the overload-resolution ranking: exact match beats primitive
/// widening beats interop boxing beats a variable-arity match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Exact = 0,
    Widening = 1,
    Boxing = 2,
    Variadic = 3,
}

/// Rank the conversion from `from` to `to`, or `None` when no
/// implicit conversion exists.
pub fn conversion_rank(from: &Type, to: &Type) -> Option<Rank> {
    if from == to {
        return Some(Rank::Exact);
    }
    if widens_to(from, to) {
        return Some(Rank::Widening);
    }
    // Everything boxes into `any` for interop.
    if matches!(to, Type::Any) && !matches!(from, Type::Unit) {
        return Some(Rank::Boxing);
    }
    None
}

/// Primitive widening per the numeric promotion order, plus
/// char-to-int.
pub fn widens_to(from: &Type, to: &Type) -> bool {
    match (from.numeric_rank(), to.numeric_rank()) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Whether `from` may be implicitly used where `to` is expected.
pub fn assignable(from: &Type, to: &Type) -> bool {
    conversion_rank(from, to).is_some()
}

/// Least common numeric type for a binary operation.
pub fn promote(a: &Type, b: &Type) -> Option<Type> {
    let ra = a.numeric_rank()?;
    let rb = b.numeric_rank()?;
    let winner = if ra >= rb { a } else { b };
    // Char arithmetic happens in int.
    if matches!(winner, Type::Char) {
        Some(Type::Int)
    } else {
        Some(winner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_widening_beats_boxing() {
        assert_eq!(conversion_rank(&Type::Int, &Type::Int), Some(Rank::Exact));
        assert_eq!(
            conversion_rank(&Type::Int, &Type::Double),
            Some(Rank::Widening)
        );
        assert_eq!(conversion_rank(&Type::Int, &Type::Any), Some(Rank::Boxing));
        assert_eq!(conversion_rank(&Type::Double, &Type::Int), None);
        assert!(Rank::Exact < Rank::Widening);
        assert!(Rank::Widening < Rank::Boxing);
        assert!(Rank::Boxing < Rank::Variadic);
    }

    #[test]
    fn promotion_picks_wider_operand() {
        assert_eq!(promote(&Type::Int, &Type::Long), Some(Type::Long));
        assert_eq!(promote(&Type::Int, &Type::Double), Some(Type::Double));
        assert_eq!(promote(&Type::Char, &Type::Char), Some(Type::Int));
        assert_eq!(promote(&Type::Int, &Type::Bool), None);
    }

    #[test]
    fn named_types_only_match_themselves_or_any() {
        let point = Type::Named(String::from("Point"));
        assert_eq!(conversion_rank(&point, &point), Some(Rank::Exact));
        assert_eq!(conversion_rank(&point, &Type::Any), Some(Rank::Boxing));
        assert_eq!(
            conversion_rank(&point, &Type::Named(String::from("Other"))),
            None
        );
    }
}
