use thiserror::Error;

/// Failures that abort a compilation invocation outright.
///
/// User-facing compile problems are *not* represented here; those are
/// accumulated as [`crate::diagnostic::Diagnostic`] values. `CoreError`
/// covers I/O failures, fail-fast aborts, script execution failures and
/// internal compiler bugs (invalid IR reaching the code generator).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),
    /// First diagnostic in fail-fast mode, already rendered.
    #[error("{0}")]
    Fatal(String),
    /// A compiler defect: the semantic processor handed the code
    /// generator inconsistent IR. Never caused by user input.
    #[error("internal compiler error: {0}")]
    Internal(String),
    #[error("execution error: {0}")]
    Execution(String),
}
