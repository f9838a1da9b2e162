//! Diagnostics and the error manager.
//!
//! Every pipeline stage reports through an [`ErrorManager`] owned by
//! the compilation context. The manager either accumulates diagnostics
//! (the default) or, in fail-fast mode, turns the first error into a
//! [`CoreError::Fatal`] that aborts the stage. Diagnostics keep their
//! discovery order, which makes reported lists stable across repeated
//! runs on identical input.

use crate::error::CoreError;
use crate::span::{Pos, SourceMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Which stage of the pipeline discovered the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Lexical,
    Syntax,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub pos: Pos,
}

impl Diagnostic {
    /// Render with the source-file name resolved.
    pub fn render(&self, sources: &SourceMap) -> String {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        if self.pos.is_none() {
            format!("{}: {}", severity, self.message)
        } else {
            format!(
                "{}:{}: {}: {}",
                sources.name(self.pos.file),
                self.pos,
                severity,
                self.message
            )
        }
    }
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", self.pos, severity, self.message)
    }
}

/// Per-invocation diagnostic sink.
///
/// `fatal` is set when a structural failure (for example a cyclic
/// supertype chain) means the whole unit must not reach code
/// generation even though sibling declarations were still analyzed.
#[derive(Debug)]
pub struct ErrorManager {
    fail_fast: bool,
    list: Vec<Diagnostic>,
    error_count: usize,
    fatal: bool,
}

impl ErrorManager {
    pub fn new(fail_fast: bool) -> ErrorManager {
        ErrorManager {
            fail_fast,
            list: Vec::new(),
            error_count: 0,
            fatal: false,
        }
    }

    fn record(
        &mut self,
        severity: Severity,
        category: Category,
        message: String,
        pos: Pos,
    ) -> Result<(), CoreError> {
        let diag = Diagnostic {
            severity,
            category,
            message,
            pos,
        };
        if severity == Severity::Error {
            self.error_count += 1;
            if self.fail_fast {
                return Err(CoreError::Fatal(diag.to_string()));
            }
        }
        self.list.push(diag);
        Ok(())
    }

    pub fn lexical_error(&mut self, message: impl Into<String>, pos: Pos) -> Result<(), CoreError> {
        self.record(Severity::Error, Category::Lexical, message.into(), pos)
    }

    pub fn syntax_error(&mut self, message: impl Into<String>, pos: Pos) -> Result<(), CoreError> {
        self.record(Severity::Error, Category::Syntax, message.into(), pos)
    }

    pub fn semantic_error(&mut self, message: impl Into<String>, pos: Pos) -> Result<(), CoreError> {
        self.record(Severity::Error, Category::Semantic, message.into(), pos)
    }

    /// Structural failure: record the error and poison the whole unit.
    pub fn fatal_semantic_error(
        &mut self,
        message: impl Into<String>,
        pos: Pos,
    ) -> Result<(), CoreError> {
        self.fatal = true;
        self.record(Severity::Error, Category::Semantic, message.into(), pos)
    }

    pub fn warning(&mut self, category: Category, message: impl Into<String>, pos: Pos) {
        // Warnings never trip fail-fast.
        self.list.push(Diagnostic {
            severity: Severity::Warning,
            category,
            message: message.into(),
            pos,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.list
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_in_order() {
        let mut errs = ErrorManager::new(false);
        errs.lexical_error("first", Pos::new(0, 1, 1)).unwrap();
        errs.syntax_error("second", Pos::new(0, 2, 5)).unwrap();
        errs.warning(Category::Semantic, "third", Pos::new(0, 3, 1));
        assert_eq!(errs.error_count(), 2);
        let msgs: Vec<_> = errs.diagnostics().iter().map(|d| d.message.clone()).collect();
        assert_eq!(msgs, vec!["first", "second", "third"]);
    }

    #[test]
    fn fail_fast_aborts_on_first_error() {
        let mut errs = ErrorManager::new(true);
        errs.warning(Category::Lexical, "fine", Pos::new(0, 1, 1));
        let err = errs.syntax_error("boom", Pos::new(0, 1, 2)).unwrap_err();
        assert!(matches!(err, CoreError::Fatal(_)));
    }

    #[test]
    fn fatal_flag_poisons_unit() {
        let mut errs = ErrorManager::new(false);
        errs.fatal_semantic_error("cyclic inheritance", Pos::new(0, 1, 1))
            .unwrap();
        assert!(errs.is_fatal());
        assert!(errs.has_errors());
    }
}
