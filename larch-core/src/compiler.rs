//! Compilation driver.
//!
//! Strings together the pipeline stages for one unit: every input file
//! is scanned and parsed, all parse trees are analyzed together so
//! cross-file references resolve, and only a unit with zero errors
//! reaches emission. The result is all-or-nothing: either every
//! declared type's module is produced, or the complete diagnostic list
//! comes back and no bytes do.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::diagnostic::{Diagnostic, ErrorManager};
use crate::error::CoreError;
use crate::host::HostUniverse;
use crate::lexer::{scan, ScanConfig};
use crate::parser::parse;
use crate::sem::{analyze, SourceAst};
use crate::span::{FileId, SourceMap};
use crate::{codegen, hir};

/// One source file by logical name and content.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> SourceFile {
        SourceFile {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn read(path: &Path) -> Result<SourceFile, CoreError> {
        let text = fs::read_to_string(path)?;
        Ok(SourceFile {
            name: path.display().to_string(),
            text,
        })
    }

    /// Type name for this file's top-level statements: the sanitized,
    /// capitalized file stem.
    pub fn script_name(&self) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Script");
        let mut out = String::with_capacity(stem.len());
        for c in stem.chars() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
            } else {
                out.push('_');
            }
        }
        if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
            out.insert(0, '_');
        }
        if let Some(first) = out.get(0..1) {
            let upper = first.to_uppercase();
            out.replace_range(0..1, &upper);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileConfig {
    pub scan: ScanConfig,
    /// Abort on the first error instead of accumulating.
    pub fail_fast: bool,
}

/// Why a unit produced no modules.
#[derive(Debug, Error)]
pub enum CompileFailure {
    /// The complete diagnostic list; `sources` resolves file names.
    #[error("compilation failed with {} problem(s)", list.len())]
    Diagnostics {
        list: Vec<Diagnostic>,
        sources: SourceMap,
    },
    /// First error in fail-fast mode, already rendered.
    #[error("{0}")]
    Fatal(String),
    /// A compiler defect, not a user error.
    #[error(transparent)]
    Internal(CoreError),
}

impl From<CoreError> for CompileFailure {
    fn from(e: CoreError) -> CompileFailure {
        match e {
            CoreError::Fatal(message) => CompileFailure::Fatal(message),
            other => CompileFailure::Internal(other),
        }
    }
}

/// A successfully compiled unit.
#[derive(Debug)]
pub struct CompiledUnit {
    /// One wasm module per declared type, keyed by FQN.
    pub modules: BTreeMap<String, Vec<u8>>,
    pub warnings: Vec<Diagnostic>,
    pub sources: SourceMap,
}

/// Compile a set of source files as one unit.
pub fn compile_unit(
    files: &[SourceFile],
    universe: &HostUniverse,
    config: &CompileConfig,
) -> Result<CompiledUnit, CompileFailure> {
    let mut errs = ErrorManager::new(config.fail_fast);
    let mut sources = SourceMap::new();
    let mut asts = Vec::with_capacity(files.len());

    for (i, file) in files.iter().enumerate() {
        let id = sources.add(&file.name);
        debug_assert_eq!(id, i as FileId);
        let tokens = scan(id, &file.text, &config.scan, &mut errs)?;
        let stmts = parse(&tokens, &mut errs)?;
        asts.push(SourceAst {
            script_name: file.script_name(),
            stmts,
        });
    }

    let program = analyze(asts, universe, &mut errs)?;

    if errs.has_errors() || errs.is_fatal() {
        return Err(CompileFailure::Diagnostics {
            list: errs.into_diagnostics(),
            sources,
        });
    }
    let warnings = errs.into_diagnostics();

    let modules = codegen::generate(&program)?;
    Ok(CompiledUnit {
        modules,
        warnings,
        sources,
    })
}

/// Compile and keep the typed program around; used by tooling that
/// wants to inspect the unit beyond its emitted bytes.
pub fn check_unit(
    files: &[SourceFile],
    universe: &HostUniverse,
    config: &CompileConfig,
) -> Result<hir::HProgram, CompileFailure> {
    let mut errs = ErrorManager::new(config.fail_fast);
    let mut sources = SourceMap::new();
    let mut asts = Vec::with_capacity(files.len());
    for file in files {
        let id = sources.add(&file.name);
        let tokens = scan(id, &file.text, &config.scan, &mut errs)?;
        let stmts = parse(&tokens, &mut errs)?;
        asts.push(SourceAst {
            script_name: file.script_name(),
            stmts,
        });
    }
    let program = analyze(asts, universe, &mut errs)?;
    if errs.has_errors() || errs.is_fatal() {
        return Err(CompileFailure::Diagnostics {
            list: errs.into_diagnostics(),
            sources,
        });
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::default_universe;

    fn unit(files: &[(&str, &str)]) -> Result<CompiledUnit, CompileFailure> {
        let files: Vec<SourceFile> = files
            .iter()
            .map(|&(name, text)| SourceFile::new(name, text))
            .collect();
        compile_unit(&files, &default_universe(), &CompileConfig::default())
    }

    #[test]
    fn script_names_derive_from_file_stems() {
        assert_eq!(SourceFile::new("demo/hello.lar", "").script_name(), "Hello");
        assert_eq!(
            SourceFile::new("my-tool.lar", "").script_name(),
            "My_tool"
        );
        assert_eq!(SourceFile::new("2048.lar", "").script_name(), "_2048");
    }

    #[test]
    fn clean_unit_yields_every_module() {
        let out = unit(&[
            ("point.lar", "class Point(x: int, y: int)\n"),
            ("main.lar", "let p = Point(1, 2)\nreturn 0\n"),
        ])
        .expect("compiles");
        let keys: Vec<&String> = out.modules.keys().collect();
        assert_eq!(keys, vec!["Main", "Point"]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn errors_suppress_all_output() {
        // One fine file, one broken one: no bytes at all come back.
        let err = unit(&[
            ("good.lar", "class Point(x: int, y: int)\n"),
            ("bad.lar", "let x = 1 +, 2\n"),
        ])
        .expect_err("must fail");
        match err {
            CompileFailure::Diagnostics { list, .. } => {
                assert!(!list.is_empty());
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn recovery_reports_both_errors_in_one_pass() {
        let err = unit(&[("bad.lar", "let x = 1 +, 2\nlet y = (\n")])
            .expect_err("must fail");
        let CompileFailure::Diagnostics { list, .. } = err else {
            panic!("expected diagnostics");
        };
        assert!(list.len() >= 2, "got: {:?}", list);
    }

    #[test]
    fn supertype_cycle_produces_diagnostics_and_nothing_else() {
        let err = unit(&[(
            "cycle.lar",
            "class A(x: int) : B\nclass B(y: int) : A\n",
        )])
        .expect_err("must fail");
        let CompileFailure::Diagnostics { list, .. } = err else {
            panic!("expected diagnostics");
        };
        assert!(list.iter().any(|d| d.message.contains("cyc")), "got: {:?}", list);
    }

    #[test]
    fn fail_fast_stops_at_the_first_error() {
        let files = [SourceFile::new("bad.lar", "let x = 1 +, 2\nlet y = (\n")];
        let config = CompileConfig {
            fail_fast: true,
            ..CompileConfig::default()
        };
        let err = compile_unit(&files, &default_universe(), &config).expect_err("must fail");
        assert!(matches!(err, CompileFailure::Fatal(_)));
    }

    #[test]
    fn cross_file_references_resolve() {
        let out = unit(&[
            ("shapes.lar", "interface Shape\n    fn area(): double\n"),
            (
                "circle.lar",
                "class Circle(r: double) : Shape\n    fn area(): double\n        return r * r * 3.141592653589793\n",
            ),
        ])
        .expect("compiles");
        assert!(out.modules.contains_key("Circle"));
        assert!(out.modules.contains_key("Shape"));
    }
}
