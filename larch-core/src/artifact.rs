//! Compiled-artifact handling.
//!
//! One compilation writes one `.wasm` file per declared type into an
//! output directory, named after the type's FQN. These helpers write a
//! unit out and find what an earlier run produced.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CoreError;

/// Write each module to `<out_dir>/<FQN>.wasm`, creating the
/// directory if needed. Returns the written paths in FQN order.
pub fn write_artifacts(
    out_dir: &Path,
    modules: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<PathBuf>, CoreError> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::with_capacity(modules.len());
    for (fqn, bytes) in modules {
        let path = out_dir.join(format!("{}.wasm", fqn));
        fs::write(&path, bytes)?;
        written.push(path);
    }
    Ok(written)
}

/// Recursively find every `.wasm` artifact under `dir`, sorted by
/// path so repeated scans of the same tree agree.
pub fn scan_artifacts(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => CoreError::SourceIo(io),
            None => CoreError::Execution(String::from("artifact walk hit a filesystem cycle")),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "wasm")
        {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_rediscovers_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = BTreeMap::new();
        modules.insert(String::from("Point"), vec![0u8, 97, 115, 109]);
        modules.insert(String::from("Main"), vec![0u8, 97, 115, 109]);

        let written = write_artifacts(dir.path(), &modules).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("Main.wasm"));

        let found = scan_artifacts(dir.path()).unwrap();
        assert_eq!(found, {
            let mut sorted = written.clone();
            sorted.sort();
            sorted
        });
    }

    #[test]
    fn scan_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/Deep.wasm"), [0u8]).unwrap();

        let found = scan_artifacts(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("nested/Deep.wasm"));
    }
}
