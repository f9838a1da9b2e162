//! Host class universe.
//!
//! The universe is the closed set of host-provided types visible at
//! the Larch level. It only carries descriptors; code generation maps
//! a resolved host call to a wasm import (module = the host type's
//! fully-qualified name, field = the mangled method name) and the
//! runtime links the actual implementation.

use crate::types::Type;

/// Metadata about a single host method overload.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMethod {
    pub name: String,
    pub params: Vec<Type>,
    /// Element type of a trailing `T...` parameter, if any.
    pub variadic: Option<Type>,
    pub ret: Type,
}

impl HostMethod {
    /// Mangled import field name, shared with declared-method
    /// mangling so the runtime linker sees one convention.
    pub fn mangled_name(&self) -> String {
        crate::hir::mangle(&self.name, &self.params, self.variadic.as_ref())
    }
}

/// A host type and its static method overloads, kept in declaration
/// order so overload resolution and import emission stay stable.
#[derive(Debug, Clone, PartialEq)]
pub struct HostType {
    pub fqn: String,
    pub methods: Vec<HostMethod>,
}

impl HostType {
    pub fn overloads(&self, name: &str) -> impl Iterator<Item = &HostMethod> {
        self.methods.iter().filter(move |m| m.name == name)
    }
}

/// The closed world of host types for one compilation.
#[derive(Debug, Clone, Default)]
pub struct HostUniverse {
    types: Vec<HostType>,
}

impl HostUniverse {
    pub fn new(types: Vec<HostType>) -> HostUniverse {
        HostUniverse { types }
    }

    pub fn types(&self) -> &[HostType] {
        &self.types
    }

    /// Linear search; universes are small.
    pub fn find(&self, fqn: &str) -> Option<&HostType> {
        self.types.iter().find(|t| t.fqn == fqn)
    }

    /// Resolve a simple name against the universe. Simple names are
    /// the last path segment of the FQN; ambiguity is impossible in
    /// the default universe and a duplicate simple name resolves to
    /// the first entry.
    pub fn find_simple(&self, name: &str) -> Option<&HostType> {
        self.types
            .iter()
            .find(|t| t.fqn.rsplit('.').next() == Some(name))
    }
}

fn method(name: &str, params: &[Type], ret: Type) -> HostMethod {
    HostMethod {
        name: name.into(),
        params: params.to_vec(),
        variadic: None,
        ret,
    }
}

fn variadic_method(name: &str, params: &[Type], elem: Type, ret: Type) -> HostMethod {
    HostMethod {
        name: name.into(),
        params: params.to_vec(),
        variadic: Some(elem),
        ret,
    }
}

/// The stock universe: console output, a few math entry points and a
/// regex facade. Enough surface to exercise overload ranking (print),
/// variadic matching (maxOf) and host reference types (Regex).
pub fn default_universe() -> HostUniverse {
    let regex = Type::Named(String::from("host.Regex"));
    HostUniverse::new(vec![
        HostType {
            fqn: String::from("host.Console"),
            methods: vec![
                method("print", &[Type::Int], Type::Unit),
                method("print", &[Type::Double], Type::Unit),
                method("print", &[Type::Str], Type::Unit),
                method("println", &[], Type::Unit),
            ],
        },
        HostType {
            fqn: String::from("host.Math"),
            methods: vec![
                method("abs", &[Type::Int], Type::Int),
                method("abs", &[Type::Double], Type::Double),
                method("max", &[Type::Int, Type::Int], Type::Int),
                variadic_method("maxOf", &[], Type::Int, Type::Int),
                method("pow", &[Type::Double, Type::Double], Type::Double),
            ],
        },
        HostType {
            fqn: String::from("host.Regex"),
            methods: vec![
                method("compile", &[Type::Str], regex.clone()),
                method("test", &[regex, Type::Str], Type::Bool),
            ],
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_name_lookup() {
        let universe = default_universe();
        assert_eq!(
            universe.find_simple("Console").map(|t| t.fqn.as_str()),
            Some("host.Console")
        );
        assert!(universe.find("host.Math").is_some());
        assert!(universe.find_simple("Missing").is_none());
    }

    #[test]
    fn print_overloads_keep_declaration_order() {
        let universe = default_universe();
        let console = universe.find("host.Console").unwrap();
        let params: Vec<_> = console
            .overloads("print")
            .map(|m| m.params[0].clone())
            .collect();
        assert_eq!(params, vec![Type::Int, Type::Double, Type::Str]);
    }

    #[test]
    fn mangled_names_encode_signatures() {
        let universe = default_universe();
        let math = universe.find("host.Math").unwrap();
        let names: Vec<_> = math.methods.iter().map(|m| m.mangled_name()).collect();
        assert_eq!(
            names,
            vec!["abs__i", "abs__d", "max__ii", "maxOf__vi", "pow__dd"]
        );
    }
}
