//! Core compiler pipeline for the Larch language.
//!
//! The pipeline is roughly:
//!
//!   source .lar
//!     -> lexer    (indentation-aware tokens)
//!     -> parser   (surface AST)
//!     -> sem      (registration, overload resolution, typed HIR)
//!     -> codegen  (one wasm module per declared type)
//!
//! Higher-level tools (the CLI, embedders) should depend on this crate
//! rather than reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod diagnostic;
pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Semantic layers: types, the host universe, analysis, HIR
// ---------------------------------------------------------------------

pub mod types;
pub mod host;
pub mod sem;
pub mod hir;

// ---------------------------------------------------------------------
// Back-end: code generation and compiler orchestration
// ---------------------------------------------------------------------

pub mod codegen;
pub mod compiler;

// ---------------------------------------------------------------------
// Execution and tooling support
// ---------------------------------------------------------------------

pub mod script;
pub mod sync;
pub mod artifact;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{compile_unit, CompileConfig, CompileFailure, CompiledUnit, SourceFile};
pub use error::CoreError;
pub use script::{DefaultHost, HostResolver, Outcome, Script};
