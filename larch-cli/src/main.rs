use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use larch_core::artifact::write_artifacts;
use larch_core::lexer::ScanConfig;
use larch_core::{CompileConfig, CompileFailure, Script, SourceFile};

/// Larch compiler: one wasm module per declared type.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Source files, compiled together as one unit.
    #[arg(short, long, required = true)]
    input: Vec<PathBuf>,

    /// Directory receiving one `<FQN>.wasm` per declared type.
    #[arg(short, long, value_name = "DIR")]
    out_dir: PathBuf,

    #[arg(long, help = "Run the first input's script after compiling")]
    run: bool,

    #[arg(long, value_name = "N", default_value_t = 4, help = "Spaces per indentation level")]
    indent: u32,

    #[arg(long, help = "Stop at the first error instead of collecting all of them")]
    fail_fast: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    execute(cli)
}

fn execute(cli: Cli) -> Result<()> {
    let mut files = Vec::with_capacity(cli.input.len());
    for path in &cli.input {
        let file = SourceFile::read(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        files.push(file);
    }

    let config = CompileConfig {
        scan: ScanConfig {
            indent_width: cli.indent,
            ..ScanConfig::default()
        },
        fail_fast: cli.fail_fast,
    };

    let script = match Script::compile(&files, &config) {
        Ok(script) => script,
        Err(CompileFailure::Diagnostics { list, sources }) => {
            for diag in &list {
                eprintln!("{}", diag.render(&sources));
            }
            anyhow::bail!("compilation failed with {} problem(s)", list.len());
        }
        Err(other) => return Err(other.into()),
    };

    for warning in &script.unit().warnings {
        eprintln!("{}", warning.render(&script.unit().sources));
    }

    let written = write_artifacts(&cli.out_dir, script.modules())
        .with_context(|| format!("failed to write artifacts to {}", cli.out_dir.display()))?;
    for path in &written {
        println!("wrote {}", path.display());
    }

    if cli.run {
        let entry = files[0].script_name();
        let outcome = script
            .run(&entry)
            .with_context(|| format!("failed to run `{}`", entry))?;
        for line in &outcome.output {
            println!("{line}");
        }
        println!("Program exited with {}", outcome.exit);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn compiles_runs_and_reports_exit() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("main.lar");
        fs::write(
            &input_path,
            "Console.print(\"hello\")\nConsole.println()\nreturn 7\n",
        )
        .expect("write input");
        let out_dir = dir.path().join("out");

        Command::cargo_bin("larch-cli")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--out-dir")
            .arg(&out_dir)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("hello"))
            .stdout(predicate::str::contains("Program exited with 7"));

        assert!(out_dir.join("Main.wasm").exists(), "script module missing");
    }

    #[test]
    fn writes_one_module_per_declared_type() {
        let dir = tempdir().expect("tempdir");
        let shapes = dir.path().join("shapes.lar");
        fs::write(
            &shapes,
            "class Point(x: int, y: int)\nclass Size(w: int, h: int)\n",
        )
        .expect("write input");
        let main = dir.path().join("main.lar");
        fs::write(&main, "let p = Point(1, 2)\nreturn 0\n").expect("write input");
        let out_dir = dir.path().join("out");

        Command::cargo_bin("larch-cli")
            .expect("binary exists")
            .arg("--input")
            .arg(&shapes)
            .arg("--input")
            .arg(&main)
            .arg("--out-dir")
            .arg(&out_dir)
            .assert()
            .success();

        for name in ["Point.wasm", "Size.wasm", "Main.wasm"] {
            assert!(out_dir.join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn reports_diagnostics_with_positions() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("bad.lar");
        fs::write(&input_path, "let x = 1 +, 2\n").expect("write input");

        Command::cargo_bin("larch-cli")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("bad.lar"))
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn fail_fast_stops_after_the_first_problem() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("bad.lar");
        fs::write(&input_path, "let x = 1 +, 2\nlet y = (\n").expect("write input");

        Command::cargo_bin("larch-cli")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .arg("--fail-fast")
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn honors_a_custom_indent_width() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("main.lar");
        fs::write(&input_path, "if 1 < 2\n  return 1\nreturn 0\n").expect("write input");

        Command::cargo_bin("larch-cli")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--out-dir")
            .arg(dir.path().join("out"))
            .arg("--indent")
            .arg("2")
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 1"));
    }
}
