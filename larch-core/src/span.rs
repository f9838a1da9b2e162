//! Source positions for the Larch compiler.
//!
//! Every token, AST node and diagnostic carries a [`Pos`] so that
//! later stages can report accurate locations without holding on to
//! the source text itself. File names are interned in a [`SourceMap`]
//! owned by the compilation context.

/// Identifier of a source file inside one compilation invocation.
pub type FileId = u32;

/// A 1-based line/column position in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub file: FileId,
    pub line: u32,
    pub col: u32,
}

impl Pos {
    /// Position used for synthesized nodes that have no source location.
    pub const NONE: Pos = Pos {
        file: u32::MAX,
        line: 0,
        col: 0,
    };

    pub fn new(file: FileId, line: u32, col: u32) -> Pos {
        Pos { file, line, col }
    }

    pub fn is_none(&self) -> bool {
        self.file == u32::MAX
    }
}

impl core::fmt::Display for Pos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Maps logical source-file names to [`FileId`]s.
///
/// One map per compilation invocation; ids are dense indices in
/// registration order.
#[derive(Debug, Default)]
pub struct SourceMap {
    names: Vec<String>,
}

impl SourceMap {
    pub fn new() -> SourceMap {
        SourceMap { names: Vec::new() }
    }

    pub fn add(&mut self, name: &str) -> FileId {
        self.names.push(name.to_string());
        (self.names.len() - 1) as FileId
    }

    pub fn name(&self, file: FileId) -> &str {
        self.names
            .get(file as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_names_in_order() {
        let mut map = SourceMap::new();
        let a = map.add("a.lar");
        let b = map.add("b.lar");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(map.name(a), "a.lar");
        assert_eq!(map.name(b), "b.lar");
        assert_eq!(map.name(99), "<unknown>");
    }
}
