//! In-process script execution.
//!
//! Compiles a unit and runs it under the `wasmi` interpreter. Host
//! imports are supplied by a [`HostResolver`]; [`DefaultHost`] backs
//! the universe described in [`crate::host`]: console methods collect
//! output lines, math methods compute directly and the regex facade
//! keeps compiled patterns in the store state. Imports between type
//! modules are resolved by instantiating modules in dependency order
//! and publishing each instance's exports under its type's
//! fully-qualified name.

use std::collections::BTreeMap;

use wasmi::{Caller, Engine, Extern, Linker, Module, Store};

use crate::compiler::{compile_unit, CompileConfig, CompileFailure, CompiledUnit, SourceFile};
use crate::error::CoreError;
use crate::host::default_universe;

/// A compiled unit ready to execute.
#[derive(Debug)]
pub struct Script {
    unit: CompiledUnit,
}

/// What a run produced.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    /// The entry point's return value.
    pub exit: i32,
    /// Console output, one entry per completed line.
    pub output: Vec<String>,
}

/// Mutable host-side state for one run, available to resolver
/// closures through `Caller::data_mut`.
#[derive(Debug, Default)]
pub struct HostContext {
    line: String,
    output: Vec<String>,
    /// Compiled regex patterns; handles are 1-based indices.
    patterns: Vec<String>,
}

impl HostContext {
    /// Append to the current console line.
    pub fn print(&mut self, text: &str) {
        self.line.push_str(text);
    }

    /// Complete the current console line.
    pub fn end_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        self.output.push(line);
    }

    /// Register a pattern and return its handle.
    pub fn add_pattern(&mut self, pattern: String) -> i32 {
        self.patterns.push(pattern);
        self.patterns.len() as i32
    }

    pub fn pattern(&self, handle: i32) -> Option<&str> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.patterns.get(i))
            .map(String::as_str)
    }

    fn into_output(mut self) -> Vec<String> {
        if !self.line.is_empty() {
            self.end_line();
        }
        self.output
    }
}

/// Supplies implementations for the host universe's imports, the
/// runtime analogue of a classloader.
pub trait HostResolver {
    fn bind(&self, linker: &mut Linker<HostContext>) -> Result<(), CoreError>;
}

impl Script {
    pub fn compile(files: &[SourceFile], config: &CompileConfig) -> Result<Script, CompileFailure> {
        let unit = compile_unit(files, &default_universe(), config)?;
        Ok(Script { unit })
    }

    pub fn unit(&self) -> &CompiledUnit {
        &self.unit
    }

    pub fn modules(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.unit.modules
    }

    /// Run with the stock host bindings.
    pub fn run(&self, entry: &str) -> Result<Outcome, CoreError> {
        self.run_with(entry, &DefaultHost)
    }

    /// Instantiate every module and call `main` on the named one.
    pub fn run_with(&self, entry: &str, resolver: &dyn HostResolver) -> Result<Outcome, CoreError> {
        let engine = Engine::default();
        let mut store = Store::new(&engine, HostContext::default());
        let mut linker: Linker<HostContext> = Linker::new(&engine);
        resolver.bind(&mut linker)?;

        let mut remaining: Vec<(String, Module)> = Vec::new();
        for (fqn, bytes) in &self.unit.modules {
            let module = Module::new(&engine, bytes)
                .map_err(|e| CoreError::Execution(format!("module `{}`: {}", fqn, e)))?;
            remaining.push((fqn.clone(), module));
        }

        let mut instances: BTreeMap<String, wasmi::Instance> = BTreeMap::new();
        while !remaining.is_empty() {
            let mut next = Vec::new();
            let mut progressed = false;
            let mut last_error = None;
            for (fqn, module) in remaining {
                match linker.instantiate(&mut store, &module) {
                    Ok(pre) => {
                        let instance = pre.start(&mut store).map_err(|e| {
                            CoreError::Execution(format!("module `{}` failed to start: {}", fqn, e))
                        })?;
                        let exports: Vec<(String, Extern)> = instance
                            .exports(&store)
                            .map(|e| (e.name().to_string(), e.into_extern()))
                            .collect();
                        for (name, ext) in exports {
                            linker.define(&fqn, &name, ext).map_err(|e| {
                                CoreError::Execution(format!(
                                    "module `{}` export `{}`: {}",
                                    fqn, name, e
                                ))
                            })?;
                        }
                        instances.insert(fqn, instance);
                        progressed = true;
                    }
                    // Possibly just an import on a module that has not
                    // been instantiated yet; retry after the others.
                    Err(e) => {
                        last_error = Some(format!("module `{}`: {}", fqn, e));
                        next.push((fqn, module));
                    }
                }
            }
            if !progressed {
                return Err(CoreError::Execution(format!(
                    "unresolvable imports between modules: {}",
                    last_error.unwrap_or_default()
                )));
            }
            remaining = next;
        }

        let instance = instances.get(entry).ok_or_else(|| {
            CoreError::Execution(format!("no module named `{}` in this unit", entry))
        })?;
        let main = instance
            .get_typed_func::<(), i32>(&store, "main")
            .map_err(|e| CoreError::Execution(format!("`{}` has no entry point: {}", entry, e)))?;
        let exit = main
            .call(&mut store, ())
            .map_err(|e| CoreError::Execution(format!("trap: {}", e)))?;

        Ok(Outcome {
            exit,
            output: store.into_data().into_output(),
        })
    }
}

/// Read a packed `ptr << 32 | len` string out of the calling module's
/// memory. Malformed input yields `None` rather than a trap; the
/// console then prints nothing.
pub fn read_string(caller: &Caller<'_, HostContext>, packed: i64) -> Option<String> {
    let memory = caller.get_export("memory")?.into_memory()?;
    let ptr = (packed >> 32) as u32 as usize;
    let len = packed as u32 as usize;
    let mut buf = vec![0u8; len];
    memory.read(caller, ptr, &mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Read a counted argument pack of ints out of the caller's memory.
pub fn read_int_pack(caller: &Caller<'_, HostContext>, ptr: i32) -> Vec<i32> {
    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        return Vec::new();
    };
    let base = ptr as u32 as usize;
    let mut word = [0u8; 4];
    if memory.read(caller, base, &mut word).is_err() {
        return Vec::new();
    }
    let count = i32::from_le_bytes(word).max(0) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        if memory.read(caller, base + 8 + i * 8, &mut word).is_err() {
            break;
        }
        out.push(i32::from_le_bytes(word));
    }
    out
}

/// Tiny pattern matcher for the regex facade: `.` matches any single
/// character, everything else is literal, and a match anywhere in the
/// text counts.
fn pattern_matches(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let chars: Vec<char> = text.chars().collect();
    if pat.is_empty() {
        return true;
    }
    if pat.len() > chars.len() {
        return false;
    }
    (0..=chars.len() - pat.len()).any(|start| {
        pat.iter()
            .zip(&chars[start..])
            .all(|(p, c)| *p == '.' || p == c)
    })
}

/// Stock implementations for [`crate::host::default_universe`].
pub struct DefaultHost;

impl HostResolver for DefaultHost {
    fn bind(&self, linker: &mut Linker<HostContext>) -> Result<(), CoreError> {
        let fail = |e: wasmi::errors::LinkerError| CoreError::Execution(e.to_string());

        linker
            .func_wrap("host.Console", "print__i", |mut caller: Caller<'_, HostContext>, v: i32| {
                caller.data_mut().print(&v.to_string());
            })
            .map_err(fail)?;
        linker
            .func_wrap("host.Console", "print__d", |mut caller: Caller<'_, HostContext>, v: f64| {
                caller.data_mut().print(&v.to_string());
            })
            .map_err(fail)?;
        linker
            .func_wrap(
                "host.Console",
                "print__s",
                |mut caller: Caller<'_, HostContext>, packed: i64| {
                    if let Some(text) = read_string(&caller, packed) {
                        caller.data_mut().print(&text);
                    }
                },
            )
            .map_err(fail)?;
        linker
            .func_wrap("host.Console", "println__", |mut caller: Caller<'_, HostContext>| {
                caller.data_mut().end_line();
            })
            .map_err(fail)?;

        linker
            .func_wrap("host.Math", "abs__i", |v: i32| v.wrapping_abs())
            .map_err(fail)?;
        linker
            .func_wrap("host.Math", "abs__d", |v: f64| v.abs())
            .map_err(fail)?;
        linker
            .func_wrap("host.Math", "max__ii", |a: i32, b: i32| a.max(b))
            .map_err(fail)?;
        linker
            .func_wrap(
                "host.Math",
                "maxOf__vi",
                |caller: Caller<'_, HostContext>, pack: i32| {
                    read_int_pack(&caller, pack)
                        .into_iter()
                        .max()
                        .unwrap_or(i32::MIN)
                },
            )
            .map_err(fail)?;
        linker
            .func_wrap("host.Math", "pow__dd", |a: f64, b: f64| a.powf(b))
            .map_err(fail)?;

        linker
            .func_wrap(
                "host.Regex",
                "compile__s",
                |mut caller: Caller<'_, HostContext>, packed: i64| {
                    let pattern = read_string(&caller, packed).unwrap_or_default();
                    caller.data_mut().add_pattern(pattern)
                },
            )
            .map_err(fail)?;
        linker
            .func_wrap(
                "host.Regex",
                "test__os",
                |caller: Caller<'_, HostContext>, handle: i32, packed: i64| {
                    let Some(text) = read_string(&caller, packed) else {
                        return 0i32;
                    };
                    let hit = caller
                        .data()
                        .pattern(handle)
                        .is_some_and(|p| pattern_matches(p, &text));
                    hit as i32
                },
            )
            .map_err(fail)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Script {
        let files = [SourceFile::new("main.lar", source)];
        Script::compile(&files, &CompileConfig::default()).expect("compiles")
    }

    fn run_source(source: &str) -> Outcome {
        compile_source(source).run("Main").expect("runs")
    }

    #[test]
    fn console_output_is_captured_per_line() {
        let out = run_source(
            "Console.print(6 * 7)\nConsole.println()\nConsole.print(\"done\")\nreturn 0\n",
        );
        assert_eq!(out.exit, 0);
        assert_eq!(out.output, vec!["42", "done"]);
    }

    #[test]
    fn host_math_resolves_and_computes() {
        let out = run_source("return Math.max(3, Math.abs(0 - 9))\n");
        assert_eq!(out.exit, 9);
    }

    #[test]
    fn variadic_host_call_reads_the_pack() {
        let out = run_source("return Math.maxOf(3, 41, 7)\n");
        assert_eq!(out.exit, 41);
    }

    #[test]
    fn regex_facade_compiles_and_tests() {
        let source = "\
let r = Regex.compile(\"ar.h\")
if Regex.test(r, \"larch\")
    return 1
return 0
";
        assert_eq!(run_source(source).exit, 1);
    }

    #[test]
    fn declared_types_link_against_the_script() {
        let source = "\
class Accumulator(total: int)
    fn add(n: int): int
        total = total + n
        return total
let acc = Accumulator(0)
acc.add(40)
return acc.add(2)
";
        assert_eq!(run_source(source).exit, 42);
    }

    #[test]
    fn strings_survive_crossing_between_modules() {
        // `label` is stored in `Tag`'s memory; the console reads the
        // script's. Each hop copies the bytes.
        let source = "\
class Tag(label: str)
    fn show(): str
        return label
let t = Tag(\"larch\")
Console.print(t.label)
Console.println()
Console.print(t.show())
Console.println()
return 0
";
        let out = run_source(source);
        assert_eq!(out.exit, 0);
        assert_eq!(out.output, vec!["larch", "larch"]);
    }

    #[test]
    fn custom_resolver_supplies_host_imports() {
        struct SummingMax;
        impl HostResolver for SummingMax {
            fn bind(&self, linker: &mut Linker<HostContext>) -> Result<(), CoreError> {
                linker
                    .func_wrap("host.Math", "max__ii", |a: i32, b: i32| a + b)
                    .map_err(|e| CoreError::Execution(e.to_string()))?;
                Ok(())
            }
        }
        let script = compile_source("return Math.max(1, 2)\n");
        let out = script.run_with("Main", &SummingMax).expect("runs");
        assert_eq!(out.exit, 3);
    }

    #[test]
    fn missing_entry_module_is_an_execution_error() {
        let script = compile_source("return 0\n");
        let err = script.run("Absent").expect_err("no such module");
        assert!(matches!(err, CoreError::Execution(_)));
    }

    #[test]
    fn dot_matches_any_single_character() {
        assert!(pattern_matches("a.c", "xabcx"));
        assert!(pattern_matches("", "anything"));
        assert!(!pattern_matches("a.c", "ac"));
        assert!(!pattern_matches("long.pattern", "short"));
    }
}
