//! Wasm emission.
//!
//! Each resolved type becomes one wasm module, keyed by its
//! fully-qualified name. Objects live in linear memory behind a bump
//! allocator with one 8-byte slot per field; strings pack pointer and
//! length into an `i64` with their bytes in the data section; lifted
//! lambdas sit in a funcref table and closures are heap records of
//! `[table index][captures]` invoked through `call_indirect`. Host
//! calls and cross-type calls become imports whose module name is the
//! callee's fully-qualified name. Memories are private, so an object
//! is only addressable from its declaring module: field access from
//! another module goes through exported accessor functions, and a
//! string crossing a boundary is copied byte by byte through the
//! exported `alloc`/`poke8`/`peek8` helpers. A `larch.lines` custom
//! section maps instruction offsets back to source lines.
//!
//! The semantic processor hands over fully-resolved bodies, so any
//! inconsistency observed here is a compiler bug and surfaces as
//! [`CoreError::Internal`], never as a user diagnostic.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, CustomSection, DataSection, ElementSection, Elements,
    EntityType, ExportKind, ExportSection, Function, FunctionSection, GlobalSection, GlobalType,
    ImportSection, Instruction, MemArg, MemorySection, MemoryType, Module, RefType, TableSection,
    TableType, TypeSection, ValType,
};

use crate::ast::{BinOp, UnOp};
use crate::error::CoreError;
use crate::hir::{
    mangle, HExpr, HExprKind, HProgram, HStmt, HStmtKind, MethodDef, TypeDef,
};
use crate::span::Pos;
use crate::types::Type;

/// Field and capture slots are uniformly 8 bytes; every value type
/// fits and offsets stay aligned.
const SLOT: u32 = 8;
/// String data starts past a small reserved prefix so that no live
/// pointer is ever zero.
const DATA_BASE: u32 = 8;
/// Room left for the bump allocator when sizing memory.
const HEAP_HEADROOM: u32 = 1 << 20;
const PAGE: u32 = 65536;

/// Name of the custom section carrying `(function, offset, line)`
/// triples as little-endian `u32`s.
pub const LINES_SECTION: &str = "larch.lines";

/// Emit one module per type, in stable FQN order.
pub fn generate(program: &HProgram) -> Result<BTreeMap<String, Vec<u8>>, CoreError> {
    let mut out = BTreeMap::new();
    for def in &program.types {
        out.insert(def.fqn.clone(), generate_type(def)?);
    }
    Ok(out)
}

/// Function signature at the wasm level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FuncSig {
    params: Vec<ValType>,
    ret: Option<ValType>,
}

/// Interns function types; the section is assembled after all bodies
/// are built so late entries (closure call types) still land in it.
#[derive(Default)]
struct SigTable {
    section: TypeSection,
    index: HashMap<FuncSig, u32>,
}

impl SigTable {
    fn intern(&mut self, sig: &FuncSig) -> u32 {
        if let Some(&i) = self.index.get(sig) {
            return i;
        }
        let i = self.section.len();
        self.section
            .ty()
            .function(sig.params.iter().copied(), sig.ret.iter().copied());
        self.index.insert(sig.clone(), i);
        i
    }
}

fn vt(ty: &Type) -> Result<ValType, CoreError> {
    ty.val_type()
        .ok_or_else(|| CoreError::Internal(format!("`{}` has no value representation", ty)))
}

fn ret_vt(ty: &Type) -> Result<Option<ValType>, CoreError> {
    match ty {
        Type::Unit => Ok(None),
        other => Ok(Some(vt(other)?)),
    }
}

fn method_sig(m: &MethodDef) -> Result<FuncSig, CoreError> {
    let mut params = Vec::new();
    // Lambdas receive their environment record first; instance
    // methods their receiver.
    if m.is_lambda || !m.is_static {
        params.push(ValType::I32);
    }
    for p in &m.params {
        params.push(vt(&p.ty)?);
    }
    if m.variadic.is_some() {
        params.push(ValType::I32);
    }
    Ok(FuncSig {
        params,
        ret: ret_vt(&m.ret)?,
    })
}

fn mem(offset: u32, align: u32) -> MemArg {
    MemArg {
        offset: offset as u64,
        align,
        memory_index: 0,
    }
}

fn load_instr(ty: &Type, offset: u32) -> Result<Instruction<'static>, CoreError> {
    Ok(match vt(ty)? {
        ValType::I32 => Instruction::I32Load(mem(offset, 2)),
        ValType::I64 => Instruction::I64Load(mem(offset, 3)),
        ValType::F32 => Instruction::F32Load(mem(offset, 2)),
        ValType::F64 => Instruction::F64Load(mem(offset, 3)),
        other => {
            return Err(CoreError::Internal(format!(
                "cannot load a value of wasm type {:?}",
                other
            )))
        }
    })
}

fn store_instr(ty: &Type, offset: u32) -> Result<Instruction<'static>, CoreError> {
    Ok(match vt(ty)? {
        ValType::I32 => Instruction::I32Store(mem(offset, 2)),
        ValType::I64 => Instruction::I64Store(mem(offset, 3)),
        ValType::F32 => Instruction::F32Store(mem(offset, 2)),
        ValType::F64 => Instruction::F64Store(mem(offset, 3)),
        other => {
            return Err(CoreError::Internal(format!(
                "cannot store a value of wasm type {:?}",
                other
            )))
        }
    })
}

/// Export name of the field accessor pair. The `$` keeps them out of
/// the mangled-method namespace; importers know the field by index.
fn getter_name(index: usize) -> String {
    format!("field${}$get", index)
}

fn setter_name(index: usize) -> String {
    format!("field${}$set", index)
}

// ------------------------------------------------------------------
// String pool
// ------------------------------------------------------------------

/// Interned string literals for one module's data section.
#[derive(Default)]
struct StringPool {
    blob: Vec<u8>,
    offsets: HashMap<String, (u32, u32)>,
}

impl StringPool {
    fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(&hit) = self.offsets.get(s) {
            return hit;
        }
        let at = (DATA_BASE + self.blob.len() as u32, s.len() as u32);
        self.blob.extend_from_slice(s.as_bytes());
        self.offsets.insert(s.to_string(), at);
        at
    }

    /// The `ptr << 32 | len` constant for an interned literal.
    fn packed(&self, s: &str) -> Result<i64, CoreError> {
        let Some(&(ptr, len)) = self.offsets.get(s) else {
            return Err(CoreError::Internal(format!(
                "string literal {:?} missing from the pool",
                s
            )));
        };
        Ok(((ptr as i64) << 32) | len as i64)
    }

    fn end(&self) -> u32 {
        DATA_BASE + self.blob.len() as u32
    }
}

// ------------------------------------------------------------------
// Collection pass
// ------------------------------------------------------------------

/// First walk over the bodies: interns string literals and assigns
/// import indices before any code is emitted.
struct Harvest<'a> {
    fqn: &'a str,
    strings: StringPool,
    imports: Vec<(String, String, FuncSig)>,
    import_index: HashMap<(String, String), u32>,
}

impl<'a> Harvest<'a> {
    fn new(fqn: &'a str) -> Harvest<'a> {
        Harvest {
            fqn,
            strings: StringPool::default(),
            imports: Vec::new(),
            import_index: HashMap::new(),
        }
    }

    fn add_import(&mut self, module: &str, field: &str, sig: FuncSig) -> Result<(), CoreError> {
        let key = (module.to_string(), field.to_string());
        if let Some(&i) = self.import_index.get(&key) {
            if self.imports[i as usize].2 != sig {
                return Err(CoreError::Internal(format!(
                    "import `{}`.`{}` referenced with two signatures",
                    module, field
                )));
            }
            return Ok(());
        }
        self.import_index.insert(key, self.imports.len() as u32);
        self.imports.push((module.to_string(), field.to_string(), sig));
        Ok(())
    }

    /// Strings handed to `module` need its `alloc`/`poke8` to land in
    /// its memory; string results come back through its `peek8`.
    fn marshal_imports(
        &mut self,
        module: &str,
        args: &[HExpr],
        ret: &Type,
    ) -> Result<(), CoreError> {
        if args.iter().any(|a| a.ty == Type::Str) {
            self.add_import(
                module,
                "alloc",
                FuncSig {
                    params: vec![ValType::I32],
                    ret: Some(ValType::I32),
                },
            )?;
            self.add_import(
                module,
                "poke8",
                FuncSig {
                    params: vec![ValType::I32, ValType::I32],
                    ret: None,
                },
            )?;
        }
        if *ret == Type::Str {
            self.add_import(
                module,
                "peek8",
                FuncSig {
                    params: vec![ValType::I32],
                    ret: Some(ValType::I32),
                },
            )?;
        }
        Ok(())
    }

    fn call_sig(args: &[HExpr], receiver: bool, ret: &Type) -> Result<FuncSig, CoreError> {
        let mut params = Vec::new();
        if receiver {
            params.push(ValType::I32);
        }
        for a in args {
            params.push(vt(&a.ty)?);
        }
        Ok(FuncSig {
            params,
            ret: ret_vt(ret)?,
        })
    }

    fn stmts(&mut self, stmts: &[HStmt]) -> Result<(), CoreError> {
        for s in stmts {
            match &s.kind {
                HStmtKind::Let { init, .. } => {
                    if let Some(e) = init {
                        self.expr(e)?;
                    }
                }
                HStmtKind::Expr(e) => self.expr(e)?,
                HStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    self.expr(cond)?;
                    self.stmts(then_body)?;
                    self.stmts(else_body)?;
                }
                HStmtKind::While { cond, body } => {
                    self.expr(cond)?;
                    self.stmts(body)?;
                }
                HStmtKind::Return(Some(e)) => self.expr(e)?,
                HStmtKind::Return(None) | HStmtKind::Break | HStmtKind::Continue => {}
            }
        }
        Ok(())
    }

    fn expr(&mut self, e: &HExpr) -> Result<(), CoreError> {
        match &e.kind {
            HExprKind::Str(s) => {
                self.strings.intern(s);
            }
            HExprKind::CallHost {
                type_fqn,
                mangled,
                args,
            } => {
                let sig = Self::call_sig(args, false, &e.ty)?;
                self.add_import(type_fqn, mangled, sig)?;
                for a in args {
                    self.expr(a)?;
                }
            }
            HExprKind::CallMethod {
                target,
                type_fqn,
                mangled,
                args,
            } => {
                if type_fqn != self.fqn {
                    let sig = Self::call_sig(args, target.is_some(), &e.ty)?;
                    self.add_import(type_fqn, mangled, sig)?;
                    self.marshal_imports(type_fqn, args, &e.ty)?;
                }
                if let Some(t) = target {
                    self.expr(t)?;
                }
                for a in args {
                    self.expr(a)?;
                }
            }
            HExprKind::New { type_fqn, args } => {
                if type_fqn != self.fqn {
                    let tys: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
                    let sig = Self::call_sig(args, false, &e.ty)?;
                    self.add_import(type_fqn, &mangle("new", &tys, None), sig)?;
                    self.marshal_imports(type_fqn, args, &e.ty)?;
                }
                for a in args {
                    self.expr(a)?;
                }
            }
            HExprKind::CellGet { cell } => self.expr(cell)?,
            HExprKind::CellSet { cell, value } => {
                self.expr(cell)?;
                self.expr(value)?;
            }
            HExprKind::SetLocal { value, .. } => self.expr(value)?,
            HExprKind::GetField {
                target,
                type_fqn,
                index,
            } => {
                if type_fqn != self.fqn {
                    let sig = FuncSig {
                        params: vec![ValType::I32],
                        ret: ret_vt(&e.ty)?,
                    };
                    self.add_import(type_fqn, &getter_name(*index), sig)?;
                    self.marshal_imports(type_fqn, &[], &e.ty)?;
                }
                self.expr(target)?;
            }
            HExprKind::SetField {
                target,
                type_fqn,
                index,
                value,
            } => {
                if type_fqn != self.fqn {
                    let sig = FuncSig {
                        params: vec![ValType::I32, vt(&value.ty)?],
                        ret: None,
                    };
                    self.add_import(type_fqn, &setter_name(*index), sig)?;
                    self.marshal_imports(
                        type_fqn,
                        std::slice::from_ref(&**value),
                        &Type::Unit,
                    )?;
                }
                self.expr(target)?;
                self.expr(value)?;
            }
            HExprKind::Convert { value }
            | HExprKind::BoxAny { value }
            | HExprKind::UnboxAny { value } => self.expr(value)?,
            HExprKind::Unary { operand, .. } => self.expr(operand)?,
            HExprKind::Binary { lhs, rhs, .. } | HExprKind::Logic { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
            }
            HExprKind::CallClosure { target, args } => {
                self.expr(target)?;
                for a in args {
                    self.expr(a)?;
                }
            }
            HExprKind::MakeClosure { captures, .. } => {
                for c in captures {
                    self.expr(c)?;
                }
            }
            HExprKind::MakePack { args, .. } => {
                for a in args {
                    self.expr(a)?;
                }
            }
            HExprKind::Int(_)
            | HExprKind::Long(_)
            | HExprKind::Float(_)
            | HExprKind::Double(_)
            | HExprKind::Bool(_)
            | HExprKind::Char(_)
            | HExprKind::Unit
            | HExprKind::Local(_)
            | HExprKind::This
            | HExprKind::Env { .. }
            | HExprKind::AllocRecord { .. } => {}
        }
        Ok(())
    }
}

// ------------------------------------------------------------------
// Scratch accounting
// ------------------------------------------------------------------

/// Allocation-shaped expressions hold a scratch pointer local while
/// their operands run; the deepest nesting decides how many scratch
/// slots a function needs.
fn scratch_in_stmts(stmts: &[HStmt]) -> u32 {
    stmts.iter().map(scratch_in_stmt).max().unwrap_or(0)
}

fn scratch_in_stmt(s: &HStmt) -> u32 {
    match &s.kind {
        HStmtKind::Let { init, .. } => init.as_ref().map(scratch_in_expr).unwrap_or(0),
        HStmtKind::Expr(e) => scratch_in_expr(e),
        HStmtKind::If {
            cond,
            then_body,
            else_body,
        } => scratch_in_expr(cond)
            .max(scratch_in_stmts(then_body))
            .max(scratch_in_stmts(else_body)),
        HStmtKind::While { cond, body } => scratch_in_expr(cond).max(scratch_in_stmts(body)),
        HStmtKind::Return(Some(e)) => scratch_in_expr(e),
        HStmtKind::Return(None) | HStmtKind::Break | HStmtKind::Continue => 0,
    }
}

fn scratch_in_expr(e: &HExpr) -> u32 {
    let holds = matches!(
        e.kind,
        HExprKind::BoxAny { .. }
            | HExprKind::CallClosure { .. }
            | HExprKind::MakeClosure { .. }
            | HExprKind::MakePack { .. }
    ) as u32;
    let inner = match &e.kind {
        HExprKind::CellGet { cell } => scratch_in_expr(cell),
        HExprKind::CellSet { cell, value } => scratch_in_expr(cell).max(scratch_in_expr(value)),
        HExprKind::SetLocal { value, .. }
        | HExprKind::Convert { value }
        | HExprKind::BoxAny { value }
        | HExprKind::UnboxAny { value } => scratch_in_expr(value),
        HExprKind::GetField { target, .. } => scratch_in_expr(target),
        HExprKind::SetField { target, value, .. } => {
            scratch_in_expr(target).max(scratch_in_expr(value))
        }
        HExprKind::Unary { operand, .. } => scratch_in_expr(operand),
        HExprKind::Binary { lhs, rhs, .. } | HExprKind::Logic { lhs, rhs, .. } => {
            scratch_in_expr(lhs).max(scratch_in_expr(rhs))
        }
        HExprKind::New { args, .. }
        | HExprKind::CallHost { args, .. }
        | HExprKind::MakePack { args, .. } => {
            args.iter().map(scratch_in_expr).max().unwrap_or(0)
        }
        HExprKind::CallMethod { target, args, .. } => target
            .as_deref()
            .map(scratch_in_expr)
            .unwrap_or(0)
            .max(args.iter().map(scratch_in_expr).max().unwrap_or(0)),
        HExprKind::CallClosure { target, args } => scratch_in_expr(target)
            .max(args.iter().map(scratch_in_expr).max().unwrap_or(0)),
        HExprKind::MakeClosure { captures, .. } => {
            captures.iter().map(scratch_in_expr).max().unwrap_or(0)
        }
        _ => 0,
    };
    holds + inner
}

// ------------------------------------------------------------------
// Marshal accounting
// ------------------------------------------------------------------

/// Whether a body moves a string across a module boundary; such
/// bodies carry one set of copy-loop locals.
fn marshals_in_stmts(fqn: &str, stmts: &[HStmt]) -> bool {
    stmts.iter().any(|s| marshals_in_stmt(fqn, s))
}

fn marshals_in_stmt(fqn: &str, s: &HStmt) -> bool {
    match &s.kind {
        HStmtKind::Let { init, .. } => init.as_ref().is_some_and(|e| marshals_in_expr(fqn, e)),
        HStmtKind::Expr(e) => marshals_in_expr(fqn, e),
        HStmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            marshals_in_expr(fqn, cond)
                || marshals_in_stmts(fqn, then_body)
                || marshals_in_stmts(fqn, else_body)
        }
        HStmtKind::While { cond, body } => {
            marshals_in_expr(fqn, cond) || marshals_in_stmts(fqn, body)
        }
        HStmtKind::Return(Some(e)) => marshals_in_expr(fqn, e),
        HStmtKind::Return(None) | HStmtKind::Break | HStmtKind::Continue => false,
    }
}

fn marshals_in_expr(fqn: &str, e: &HExpr) -> bool {
    let here = match &e.kind {
        HExprKind::CallMethod { type_fqn, args, .. } | HExprKind::New { type_fqn, args } => {
            type_fqn != fqn && (e.ty == Type::Str || args.iter().any(|a| a.ty == Type::Str))
        }
        HExprKind::GetField { type_fqn, .. } => type_fqn != fqn && e.ty == Type::Str,
        HExprKind::SetField {
            type_fqn, value, ..
        } => type_fqn != fqn && value.ty == Type::Str,
        _ => false,
    };
    let inner = match &e.kind {
        HExprKind::CellGet { cell } => marshals_in_expr(fqn, cell),
        HExprKind::CellSet { cell, value } => {
            marshals_in_expr(fqn, cell) || marshals_in_expr(fqn, value)
        }
        HExprKind::SetLocal { value, .. }
        | HExprKind::Convert { value }
        | HExprKind::BoxAny { value }
        | HExprKind::UnboxAny { value } => marshals_in_expr(fqn, value),
        HExprKind::GetField { target, .. } => marshals_in_expr(fqn, target),
        HExprKind::SetField { target, value, .. } => {
            marshals_in_expr(fqn, target) || marshals_in_expr(fqn, value)
        }
        HExprKind::Unary { operand, .. } => marshals_in_expr(fqn, operand),
        HExprKind::Binary { lhs, rhs, .. } | HExprKind::Logic { lhs, rhs, .. } => {
            marshals_in_expr(fqn, lhs) || marshals_in_expr(fqn, rhs)
        }
        HExprKind::New { args, .. }
        | HExprKind::CallHost { args, .. }
        | HExprKind::MakePack { args, .. } => args.iter().any(|a| marshals_in_expr(fqn, a)),
        HExprKind::CallMethod { target, args, .. } => {
            target
                .as_deref()
                .is_some_and(|t| marshals_in_expr(fqn, t))
                || args.iter().any(|a| marshals_in_expr(fqn, a))
        }
        HExprKind::CallClosure { target, args } => {
            marshals_in_expr(fqn, target) || args.iter().any(|a| marshals_in_expr(fqn, a))
        }
        HExprKind::MakeClosure { captures, .. } => {
            captures.iter().any(|c| marshals_in_expr(fqn, c))
        }
        _ => false,
    };
    here || inner
}

// ------------------------------------------------------------------
// Per-module generation
// ------------------------------------------------------------------

fn generate_type(def: &TypeDef) -> Result<Vec<u8>, CoreError> {
    let mut harvest = Harvest::new(&def.fqn);
    for m in &def.methods {
        if let Some(body) = &m.body {
            harvest.stmts(body)?;
        }
    }

    let heap_base = (harvest.strings.end() + SLOT - 1) & !(SLOT - 1);
    let pages = ((heap_base + HEAP_HEADROOM) / PAGE + 1) as u64;

    let mut sigs = SigTable::default();

    let mut imports = ImportSection::new();
    for (module, field, sig) in &harvest.imports {
        let ti = sigs.intern(sig);
        imports.import(module, field, EntityType::Function(ti));
    }
    let import_count = harvest.imports.len() as u32;

    // Local function index space: imports, then methods with bodies
    // in declaration order, then the runtime helpers.
    let mut method_index: HashMap<&str, u32> = HashMap::new();
    let mut lambda_slots: HashMap<&str, u32> = HashMap::new();
    let mut lambda_funcs: Vec<u32> = Vec::new();
    let mut body_methods: Vec<&MethodDef> = Vec::new();
    for m in &def.methods {
        if m.body.is_none() {
            continue;
        }
        let index = import_count + body_methods.len() as u32;
        method_index.insert(m.mangled.as_str(), index);
        if m.is_lambda {
            lambda_slots.insert(m.mangled.as_str(), lambda_funcs.len() as u32);
            lambda_funcs.push(index);
        }
        body_methods.push(m);
    }
    let alloc_index = import_count + body_methods.len() as u32;
    let concat_index = alloc_index + 1;
    let poke_index = concat_index + 1;
    let peek_index = poke_index + 1;
    // Field accessors follow, a getter/setter pair per field.
    let accessor_base = peek_index + 1;

    let mut functions = FunctionSection::new();
    for m in &body_methods {
        let ti = sigs.intern(&method_sig(m)?);
        functions.function(ti);
    }
    let alloc_sig = FuncSig {
        params: vec![ValType::I32],
        ret: Some(ValType::I32),
    };
    functions.function(sigs.intern(&alloc_sig));
    let concat_sig = FuncSig {
        params: vec![ValType::I64, ValType::I64],
        ret: Some(ValType::I64),
    };
    functions.function(sigs.intern(&concat_sig));
    let poke_sig = FuncSig {
        params: vec![ValType::I32, ValType::I32],
        ret: None,
    };
    functions.function(sigs.intern(&poke_sig));
    let peek_sig = FuncSig {
        params: vec![ValType::I32],
        ret: Some(ValType::I32),
    };
    functions.function(sigs.intern(&peek_sig));
    for field in &def.fields {
        let fvt = vt(&field.ty)?;
        functions.function(sigs.intern(&FuncSig {
            params: vec![ValType::I32],
            ret: Some(fvt),
        }));
        functions.function(sigs.intern(&FuncSig {
            params: vec![ValType::I32, fvt],
            ret: None,
        }));
    }

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    for m in &body_methods {
        if m.is_lambda {
            continue;
        }
        let index = method_index[m.mangled.as_str()];
        exports.export(&m.mangled, ExportKind::Func, index);
        if m.name == "main" && m.params.is_empty() && m.variadic.is_none() {
            exports.export("main", ExportKind::Func, index);
        }
    }
    // Other modules reach this module's objects only through these.
    exports.export("alloc", ExportKind::Func, alloc_index);
    exports.export("poke8", ExportKind::Func, poke_index);
    exports.export("peek8", ExportKind::Func, peek_index);
    for i in 0..def.fields.len() {
        let base = accessor_base + 2 * i as u32;
        exports.export(&getter_name(i), ExportKind::Func, base);
        exports.export(&setter_name(i), ExportKind::Func, base + 1);
    }

    let mut code = CodeSection::new();
    let mut lines: Vec<(u32, u32, u32)> = Vec::new();
    for (i, m) in body_methods.iter().enumerate() {
        let emitter = BodyEmitter::new(
            def,
            m,
            import_count + i as u32,
            &harvest,
            &method_index,
            &lambda_slots,
            &mut sigs,
            alloc_index,
            concat_index,
            &mut lines,
        )?;
        code.function(&emitter.finish()?);
    }
    code.function(&emit_alloc());
    code.function(&emit_concat(alloc_index));
    code.function(&emit_poke8());
    code.function(&emit_peek8());
    for (i, field) in def.fields.iter().enumerate() {
        code.function(&emit_getter(&field.ty, i)?);
        code.function(&emit_setter(&field.ty, i)?);
    }

    // Assembly, in section order.
    let mut module = Module::new();
    module.section(&sigs.section);
    if import_count > 0 {
        module.section(&imports);
    }
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        table64: false,
        minimum: lambda_funcs.len() as u64,
        maximum: Some(lambda_funcs.len() as u64),
        shared: false,
    });
    module.section(&tables);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: pages,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut globals = GlobalSection::new();
    globals.global(
        GlobalType {
            val_type: ValType::I32,
            mutable: true,
            shared: false,
        },
        &ConstExpr::i32_const(heap_base as i32),
    );
    module.section(&globals);

    module.section(&exports);

    if !lambda_funcs.is_empty() {
        let mut elements = ElementSection::new();
        elements.active(
            None,
            &ConstExpr::i32_const(0),
            Elements::Functions(lambda_funcs.as_slice().into()),
        );
        module.section(&elements);
    }

    module.section(&code);

    if !harvest.strings.blob.is_empty() {
        let mut data = DataSection::new();
        data.active(
            0,
            &ConstExpr::i32_const(DATA_BASE as i32),
            harvest.strings.blob.iter().copied(),
        );
        module.section(&data);
    }

    let mut line_bytes = Vec::with_capacity(lines.len() * 12);
    for (func, offset, line) in &lines {
        line_bytes.extend_from_slice(&func.to_le_bytes());
        line_bytes.extend_from_slice(&offset.to_le_bytes());
        line_bytes.extend_from_slice(&line.to_le_bytes());
    }
    module.section(&CustomSection {
        name: Cow::Borrowed(LINES_SECTION),
        data: Cow::Owned(line_bytes),
    });

    Ok(module.finish())
}

/// Bump allocator: `alloc(size) -> ptr`, rounding the heap pointer up
/// to the next slot boundary.
fn emit_alloc() -> Function {
    let mut f = Function::new([(1, ValType::I32)]);
    f.instruction(&Instruction::GlobalGet(0));
    f.instruction(&Instruction::LocalSet(1));
    f.instruction(&Instruction::GlobalGet(0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(SLOT as i32 - 1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(-(SLOT as i32)));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::GlobalSet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

/// `concat(a, b) -> packed`: copies both strings into a fresh
/// allocation and repacks pointer and length.
fn emit_concat(alloc_index: u32) -> Function {
    // params: a(0), b(1); locals: ptr(2), la(3), lb(4)
    let mut f = Function::new([(3, ValType::I32)]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32WrapI64);
    f.instruction(&Instruction::LocalSet(3));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32WrapI64);
    f.instruction(&Instruction::LocalSet(4));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::Call(alloc_index));
    f.instruction(&Instruction::LocalSet(2));
    // copy a
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I64Const(32));
    f.instruction(&Instruction::I64ShrU);
    f.instruction(&Instruction::I32WrapI64);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    // copy b after it
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I64Const(32));
    f.instruction(&Instruction::I64ShrU);
    f.instruction(&Instruction::I32WrapI64);
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    // pack the result
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I64ExtendI32U);
    f.instruction(&Instruction::I64Const(32));
    f.instruction(&Instruction::I64Shl);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::LocalGet(4));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I64ExtendI32U);
    f.instruction(&Instruction::I64Or);
    f.instruction(&Instruction::End);
    f
}

/// `poke8(addr, byte)`: lets another module write one byte into this
/// module's memory.
fn emit_poke8() -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Store8(mem(0, 0)));
    f.instruction(&Instruction::End);
    f
}

/// `peek8(addr) -> byte`: the read-side counterpart.
fn emit_peek8() -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load8U(mem(0, 0)));
    f.instruction(&Instruction::End);
    f
}

/// `field$N$get(obj) -> value`; the object pointer is only valid in
/// the declaring module's memory, so the load happens here.
fn emit_getter(ty: &Type, index: usize) -> Result<Function, CoreError> {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&load_instr(ty, index as u32 * SLOT)?);
    f.instruction(&Instruction::End);
    Ok(f)
}

/// `field$N$set(obj, value)`.
fn emit_setter(ty: &Type, index: usize) -> Result<Function, CoreError> {
    let mut f = Function::new([]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&store_instr(ty, index as u32 * SLOT)?);
    f.instruction(&Instruction::End);
    Ok(f)
}

// ------------------------------------------------------------------
// Body emission
// ------------------------------------------------------------------

/// Locals backing the string copy loops, allocated once per body
/// that moves a string across a module boundary.
#[derive(Clone, Copy)]
struct MarshalLocals {
    /// The packed `ptr << 32 | len` being moved (i64).
    packed: u32,
    src: u32,
    dst: u32,
    len: u32,
    i: u32,
}

/// Direction of one byte transfer inside the copy loop.
enum Transfer {
    /// Into the callee's memory through its imported `poke8`.
    Out(u32),
    /// Out of the callee's memory through its imported `peek8`.
    In(u32),
}

struct BodyEmitter<'a> {
    def: &'a TypeDef,
    method: &'a MethodDef,
    func_index: u32,
    harvest: &'a Harvest<'a>,
    method_index: &'a HashMap<&'a str, u32>,
    lambda_slots: &'a HashMap<&'a str, u32>,
    sigs: &'a mut SigTable,
    alloc_index: u32,
    concat_index: u32,
    lines: &'a mut Vec<(u32, u32, u32)>,
    func: Function,
    count: u32,
    /// Wasm local index per HIR slot.
    local_map: Vec<u32>,
    scratch_base: u32,
    scratch_used: u32,
    marshal: Option<MarshalLocals>,
    /// Open structured blocks inside the function body.
    depth: u32,
    /// Per enclosing `while`: the levels of its exit block and loop.
    loops: Vec<(u32, u32)>,
}

impl<'a> BodyEmitter<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        def: &'a TypeDef,
        method: &'a MethodDef,
        func_index: u32,
        harvest: &'a Harvest<'a>,
        method_index: &'a HashMap<&'a str, u32>,
        lambda_slots: &'a HashMap<&'a str, u32>,
        sigs: &'a mut SigTable,
        alloc_index: u32,
        concat_index: u32,
        lines: &'a mut Vec<(u32, u32, u32)>,
    ) -> Result<BodyEmitter<'a>, CoreError> {
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| CoreError::Internal(String::from("emitting a bodiless method")))?;

        // Leading locals that arrive as wasm parameters.
        let receiver = !method.is_static && !method.is_lambda;
        let param_slots =
            usize::from(receiver) + method.params.len() + usize::from(method.variadic.is_some());
        // Lambdas take the environment pointer before everything; it
        // has no HIR slot, so every slot shifts by one.
        let base = u32::from(method.is_lambda);

        let mut local_map: Vec<u32> = (0..method.locals.len())
            .map(|i| base + i as u32)
            .collect();
        let mut extra: Vec<ValType> = Vec::new();
        for l in &method.locals[param_slots.min(method.locals.len())..] {
            extra.push(if l.boxed { ValType::I32 } else { vt(&l.ty)? });
        }
        // Boxed parameters move into fresh cells; their slot becomes
        // an extra pointer local.
        let mut next = base + method.locals.len() as u32;
        let mut boxed_params: Vec<usize> = Vec::new();
        for (i, l) in method.locals.iter().take(param_slots).enumerate() {
            if l.boxed {
                extra.push(ValType::I32);
                local_map[i] = next;
                next += 1;
                boxed_params.push(i);
            }
        }
        let scratch_base = next;
        let scratch = scratch_in_stmts(body);
        for _ in 0..scratch {
            extra.push(ValType::I32);
        }
        let marshal = if marshals_in_stmts(&def.fqn, body) {
            let packed = scratch_base + scratch;
            extra.push(ValType::I64);
            extra.extend([ValType::I32; 4]);
            Some(MarshalLocals {
                packed,
                src: packed + 1,
                dst: packed + 2,
                len: packed + 3,
                i: packed + 4,
            })
        } else {
            None
        };

        let mut emitter = BodyEmitter {
            def,
            method,
            func_index,
            harvest,
            method_index,
            lambda_slots,
            sigs,
            alloc_index,
            concat_index,
            lines,
            func: Function::new(run_length(&extra)),
            count: 0,
            local_map,
            scratch_base,
            scratch_used: 0,
            marshal,
            depth: 0,
            loops: Vec::new(),
        };

        for &i in &boxed_params {
            emitter.ins(&Instruction::I32Const(SLOT as i32));
            emitter.ins(&Instruction::Call(emitter.alloc_index));
            emitter.ins(&Instruction::LocalSet(emitter.local_map[i]));
            emitter.ins(&Instruction::LocalGet(emitter.local_map[i]));
            emitter.ins(&Instruction::LocalGet(base + i as u32));
            let store = store_instr(&method.locals[i].ty, 0)?;
            emitter.ins(&store);
        }

        emitter.stmts(body)?;
        Ok(emitter)
    }

    fn finish(mut self) -> Result<Function, CoreError> {
        if self.method.ret != Type::Unit {
            // A well-typed body already returned; this keeps the
            // validator satisfied on paths the checker proved dead.
            self.ins(&Instruction::Unreachable);
        }
        self.ins(&Instruction::End);
        Ok(self.func)
    }

    fn ins(&mut self, i: &Instruction<'_>) {
        self.func.instruction(i);
        self.count += 1;
    }

    fn record_line(&mut self, pos: Pos) {
        if !pos.is_none() {
            self.lines.push((self.func_index, self.count, pos.line));
        }
    }

    fn acquire_scratch(&mut self) -> u32 {
        let slot = self.scratch_base + self.scratch_used;
        self.scratch_used += 1;
        slot
    }

    fn release_scratch(&mut self) {
        self.scratch_used -= 1;
    }

    fn local(&self, id: crate::hir::LocalId) -> Result<u32, CoreError> {
        self.local_map
            .get(id.0 as usize)
            .copied()
            .ok_or_else(|| CoreError::Internal(format!("local slot {} out of range", id.0)))
    }

    // --------------------------------------------------------------
    // Statements
    // --------------------------------------------------------------

    fn stmts(&mut self, stmts: &[HStmt]) -> Result<(), CoreError> {
        for s in stmts {
            self.record_line(s.pos);
            self.stmt(s)?;
        }
        Ok(())
    }

    fn stmt(&mut self, s: &HStmt) -> Result<(), CoreError> {
        match &s.kind {
            HStmtKind::Let { local, init } => {
                let slot = self.local(*local)?;
                let def = &self.method.locals[local.0 as usize];
                if def.boxed {
                    let store = store_instr(&def.ty, 0)?;
                    self.ins(&Instruction::I32Const(SLOT as i32));
                    self.ins(&Instruction::Call(self.alloc_index));
                    self.ins(&Instruction::LocalSet(slot));
                    if let Some(e) = init {
                        self.ins(&Instruction::LocalGet(slot));
                        self.expr(e)?;
                        self.ins(&store);
                    }
                } else if let Some(e) = init {
                    self.expr(e)?;
                    self.ins(&Instruction::LocalSet(slot));
                }
            }
            HStmtKind::Expr(e) => {
                self.expr(e)?;
                if e.ty.val_type().is_some() {
                    self.ins(&Instruction::Drop);
                }
            }
            HStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond)?;
                self.ins(&Instruction::If(BlockType::Empty));
                self.depth += 1;
                self.stmts(then_body)?;
                if !else_body.is_empty() {
                    self.ins(&Instruction::Else);
                    self.stmts(else_body)?;
                }
                self.ins(&Instruction::End);
                self.depth -= 1;
            }
            HStmtKind::While { cond, body } => {
                self.ins(&Instruction::Block(BlockType::Empty));
                self.depth += 1;
                let exit = self.depth;
                self.ins(&Instruction::Loop(BlockType::Empty));
                self.depth += 1;
                let head = self.depth;
                self.loops.push((exit, head));

                self.expr(cond)?;
                self.ins(&Instruction::I32Eqz);
                self.ins(&Instruction::BrIf(self.depth - exit));
                self.stmts(body)?;
                self.ins(&Instruction::Br(self.depth - head));

                self.ins(&Instruction::End);
                self.ins(&Instruction::End);
                self.loops.pop();
                self.depth -= 2;
            }
            HStmtKind::Return(value) => {
                if let Some(e) = value {
                    self.expr(e)?;
                }
                self.ins(&Instruction::Return);
            }
            HStmtKind::Break => {
                let &(exit, _) = self
                    .loops
                    .last()
                    .ok_or_else(|| CoreError::Internal(String::from("`break` outside a loop")))?;
                self.ins(&Instruction::Br(self.depth - exit));
            }
            HStmtKind::Continue => {
                let &(_, head) = self.loops.last().ok_or_else(|| {
                    CoreError::Internal(String::from("`continue` outside a loop"))
                })?;
                self.ins(&Instruction::Br(self.depth - head));
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Expressions
    // --------------------------------------------------------------

    fn expr(&mut self, e: &HExpr) -> Result<(), CoreError> {
        match &e.kind {
            HExprKind::Int(v) => self.ins(&Instruction::I32Const(*v)),
            HExprKind::Long(v) => self.ins(&Instruction::I64Const(*v)),
            HExprKind::Float(v) => self.ins(&Instruction::F32Const((*v).into())),
            HExprKind::Double(v) => self.ins(&Instruction::F64Const((*v).into())),
            HExprKind::Bool(v) => self.ins(&Instruction::I32Const(*v as i32)),
            HExprKind::Char(v) => self.ins(&Instruction::I32Const(*v as i32)),
            HExprKind::Str(s) => {
                let packed = self.harvest.strings.packed(s)?;
                self.ins(&Instruction::I64Const(packed));
            }
            HExprKind::Unit => {}
            HExprKind::Local(id) => {
                let slot = self.local(*id)?;
                self.ins(&Instruction::LocalGet(slot));
            }
            HExprKind::This => self.ins(&Instruction::LocalGet(0)),
            HExprKind::Env { index } => {
                self.env_base()?;
                let load = load_instr(&e.ty, SLOT + *index as u32 * SLOT)?;
                self.ins(&load);
            }
            HExprKind::CellGet { cell } => {
                self.cell_ptr(cell)?;
                let load = load_instr(&e.ty, 0)?;
                self.ins(&load);
            }
            HExprKind::CellSet { cell, value } => {
                self.cell_ptr(cell)?;
                self.expr(value)?;
                let store = store_instr(&value.ty, 0)?;
                self.ins(&store);
            }
            HExprKind::SetLocal { local, value } => {
                self.expr(value)?;
                let slot = self.local(*local)?;
                self.ins(&Instruction::LocalSet(slot));
            }
            HExprKind::GetField {
                target,
                type_fqn,
                index,
            } => {
                self.expr(target)?;
                if type_fqn == &self.def.fqn {
                    let load = load_instr(&e.ty, *index as u32 * SLOT)?;
                    self.ins(&load);
                } else {
                    // The object lives in the declaring module's
                    // memory; read it through its accessor.
                    let getter = self.import_ref(type_fqn, &getter_name(*index))?;
                    self.ins(&Instruction::Call(getter));
                    if e.ty == Type::Str {
                        self.marshal_in(type_fqn)?;
                    }
                }
            }
            HExprKind::SetField {
                target,
                type_fqn,
                index,
                value,
            } => {
                self.expr(target)?;
                self.expr(value)?;
                if type_fqn == &self.def.fqn {
                    let store = store_instr(&value.ty, *index as u32 * SLOT)?;
                    self.ins(&store);
                } else {
                    if value.ty == Type::Str {
                        self.marshal_out(type_fqn)?;
                    }
                    let setter = self.import_ref(type_fqn, &setter_name(*index))?;
                    self.ins(&Instruction::Call(setter));
                }
            }
            HExprKind::Convert { value } => {
                self.expr(value)?;
                if let Some(i) = convert_instr(&value.ty, &e.ty)? {
                    self.ins(&i);
                }
            }
            HExprKind::BoxAny { value } => {
                let s = self.acquire_scratch();
                self.ins(&Instruction::I32Const(SLOT as i32));
                self.ins(&Instruction::Call(self.alloc_index));
                self.ins(&Instruction::LocalTee(s));
                self.expr(value)?;
                let store = store_instr(&value.ty, 0)?;
                self.ins(&store);
                self.ins(&Instruction::LocalGet(s));
                self.release_scratch();
            }
            HExprKind::UnboxAny { value } => {
                self.expr(value)?;
                let load = load_instr(&e.ty, 0)?;
                self.ins(&load);
            }
            HExprKind::Unary { op, operand } => self.unary(*op, operand)?,
            HExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, &e.ty)?,
            HExprKind::Logic { and, lhs, rhs } => {
                self.expr(lhs)?;
                self.ins(&Instruction::If(BlockType::Result(ValType::I32)));
                self.depth += 1;
                if *and {
                    self.expr(rhs)?;
                    self.ins(&Instruction::Else);
                    self.ins(&Instruction::I32Const(0));
                } else {
                    self.ins(&Instruction::I32Const(1));
                    self.ins(&Instruction::Else);
                    self.expr(rhs)?;
                }
                self.ins(&Instruction::End);
                self.depth -= 1;
            }
            HExprKind::AllocRecord { type_fqn } => {
                if type_fqn != &self.def.fqn {
                    return Err(CoreError::Internal(format!(
                        "allocation of `{}` outside its module",
                        type_fqn
                    )));
                }
                let size = self.def.fields.len() as i32 * SLOT as i32;
                self.ins(&Instruction::I32Const(size));
                self.ins(&Instruction::Call(self.alloc_index));
            }
            HExprKind::New { type_fqn, args } => {
                let cross = type_fqn != &self.def.fqn;
                for a in args {
                    self.expr(a)?;
                    if cross && a.ty == Type::Str {
                        self.marshal_out(type_fqn)?;
                    }
                }
                let index = if type_fqn == &self.def.fqn {
                    let ctor = self
                        .def
                        .methods
                        .iter()
                        .find(|m| m.name == "new")
                        .ok_or_else(|| {
                            CoreError::Internal(format!("`{}` lost its constructor", type_fqn))
                        })?;
                    self.method_ref(&ctor.mangled)?
                } else {
                    let tys: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
                    self.import_ref(type_fqn, &mangle("new", &tys, None))?
                };
                self.ins(&Instruction::Call(index));
            }
            HExprKind::CallMethod {
                target,
                type_fqn,
                mangled,
                args,
            } => {
                let cross = type_fqn != &self.def.fqn;
                if let Some(t) = target {
                    self.expr(t)?;
                }
                for a in args {
                    self.expr(a)?;
                    if cross && a.ty == Type::Str {
                        self.marshal_out(type_fqn)?;
                    }
                }
                let index = if cross {
                    self.import_ref(type_fqn, mangled)?
                } else {
                    self.method_ref(mangled)?
                };
                self.ins(&Instruction::Call(index));
                if cross && e.ty == Type::Str {
                    self.marshal_in(type_fqn)?;
                }
            }
            HExprKind::CallHost {
                type_fqn,
                mangled,
                args,
            } => {
                for a in args {
                    self.expr(a)?;
                }
                let index = self.import_ref(type_fqn, mangled)?;
                self.ins(&Instruction::Call(index));
            }
            HExprKind::CallClosure { target, args } => {
                let Type::Function { params, ret } = &target.ty else {
                    return Err(CoreError::Internal(format!(
                        "closure call on `{}`",
                        target.ty
                    )));
                };
                let mut sig = FuncSig {
                    params: vec![ValType::I32],
                    ret: ret_vt(ret)?,
                };
                for p in params {
                    sig.params.push(vt(p)?);
                }
                let type_index = self.sigs.intern(&sig);

                let s = self.acquire_scratch();
                self.expr(target)?;
                self.ins(&Instruction::LocalTee(s));
                for a in args {
                    self.expr(a)?;
                }
                self.ins(&Instruction::LocalGet(s));
                self.ins(&Instruction::I32Load(mem(0, 2)));
                self.ins(&Instruction::CallIndirect {
                    type_index,
                    table_index: 0,
                });
                self.release_scratch();
            }
            HExprKind::MakeClosure {
                mangled, captures, ..
            } => {
                let slot = *self.lambda_slots.get(mangled.as_str()).ok_or_else(|| {
                    CoreError::Internal(format!("lambda `{}` has no table slot", mangled))
                })?;
                let s = self.acquire_scratch();
                let size = SLOT as i32 + captures.len() as i32 * SLOT as i32;
                self.ins(&Instruction::I32Const(size));
                self.ins(&Instruction::Call(self.alloc_index));
                self.ins(&Instruction::LocalTee(s));
                self.ins(&Instruction::I32Const(slot as i32));
                self.ins(&Instruction::I32Store(mem(0, 2)));
                for (i, c) in captures.iter().enumerate() {
                    self.ins(&Instruction::LocalGet(s));
                    self.expr(c)?;
                    let store = store_instr(&c.ty, SLOT + i as u32 * SLOT)?;
                    self.ins(&store);
                }
                self.ins(&Instruction::LocalGet(s));
                self.release_scratch();
            }
            HExprKind::MakePack { elem, args } => {
                let s = self.acquire_scratch();
                let size = SLOT as i32 + args.len() as i32 * SLOT as i32;
                self.ins(&Instruction::I32Const(size));
                self.ins(&Instruction::Call(self.alloc_index));
                self.ins(&Instruction::LocalTee(s));
                self.ins(&Instruction::I32Const(args.len() as i32));
                self.ins(&Instruction::I32Store(mem(0, 2)));
                for (i, a) in args.iter().enumerate() {
                    self.ins(&Instruction::LocalGet(s));
                    self.expr(a)?;
                    let store = store_instr(elem, SLOT + i as u32 * SLOT)?;
                    self.ins(&store);
                }
                self.ins(&Instruction::LocalGet(s));
                self.release_scratch();
            }
        }
        Ok(())
    }

    /// Push the environment pointer; only lambda bodies have one.
    fn env_base(&mut self) -> Result<(), CoreError> {
        if !self.method.is_lambda {
            return Err(CoreError::Internal(String::from(
                "environment access outside a lambda body",
            )));
        }
        self.ins(&Instruction::LocalGet(0));
        Ok(())
    }

    /// Push the address of a heap cell.
    fn cell_ptr(&mut self, cell: &HExpr) -> Result<(), CoreError> {
        match &cell.kind {
            HExprKind::Local(id) => {
                let slot = self.local(*id)?;
                self.ins(&Instruction::LocalGet(slot));
            }
            HExprKind::Env { index } => {
                self.env_base()?;
                self.ins(&Instruction::I32Load(mem(SLOT + *index as u32 * SLOT, 2)));
            }
            _ => {
                return Err(CoreError::Internal(String::from(
                    "cell expression is not a local or capture",
                )))
            }
        }
        Ok(())
    }

    fn method_ref(&self, mangled: &str) -> Result<u32, CoreError> {
        self.method_index.get(mangled).copied().ok_or_else(|| {
            CoreError::Internal(format!(
                "method `{}` is not defined in `{}`",
                mangled, self.def.fqn
            ))
        })
    }

    fn import_ref(&self, module: &str, field: &str) -> Result<u32, CoreError> {
        self.harvest
            .import_index
            .get(&(module.to_string(), field.to_string()))
            .copied()
            .ok_or_else(|| {
                CoreError::Internal(format!("import `{}`.`{}` was not collected", module, field))
            })
    }

    fn marshal_locals(&self) -> Result<MarshalLocals, CoreError> {
        self.marshal.ok_or_else(|| {
            CoreError::Internal(String::from(
                "string crossed a module boundary without marshal locals",
            ))
        })
    }

    /// The packed string on the stack lives in this module's memory;
    /// copy its bytes into `module`'s memory and leave the repacked
    /// callee-side value on the stack.
    fn marshal_out(&mut self, module: &str) -> Result<(), CoreError> {
        let m = self.marshal_locals()?;
        let alloc = self.import_ref(module, "alloc")?;
        let poke = self.import_ref(module, "poke8")?;
        self.ins(&Instruction::LocalSet(m.packed));
        self.unpack(m);
        self.ins(&Instruction::LocalGet(m.len));
        self.ins(&Instruction::Call(alloc));
        self.ins(&Instruction::LocalSet(m.dst));
        self.byte_copy_loop(m, Transfer::Out(poke));
        self.repack(m);
        Ok(())
    }

    /// The packed string on the stack points into `module`'s memory;
    /// copy it into a fresh local allocation and repack.
    fn marshal_in(&mut self, module: &str) -> Result<(), CoreError> {
        let m = self.marshal_locals()?;
        let peek = self.import_ref(module, "peek8")?;
        self.ins(&Instruction::LocalSet(m.packed));
        self.unpack(m);
        self.ins(&Instruction::LocalGet(m.len));
        self.ins(&Instruction::Call(self.alloc_index));
        self.ins(&Instruction::LocalSet(m.dst));
        self.byte_copy_loop(m, Transfer::In(peek));
        self.repack(m);
        Ok(())
    }

    /// Split the packed local into `src` and `len`.
    fn unpack(&mut self, m: MarshalLocals) {
        self.ins(&Instruction::LocalGet(m.packed));
        self.ins(&Instruction::I32WrapI64);
        self.ins(&Instruction::LocalSet(m.len));
        self.ins(&Instruction::LocalGet(m.packed));
        self.ins(&Instruction::I64Const(32));
        self.ins(&Instruction::I64ShrU);
        self.ins(&Instruction::I32WrapI64);
        self.ins(&Instruction::LocalSet(m.src));
    }

    /// Push `dst << 32 | len`.
    fn repack(&mut self, m: MarshalLocals) {
        self.ins(&Instruction::LocalGet(m.dst));
        self.ins(&Instruction::I64ExtendI32U);
        self.ins(&Instruction::I64Const(32));
        self.ins(&Instruction::I64Shl);
        self.ins(&Instruction::LocalGet(m.len));
        self.ins(&Instruction::I64ExtendI32U);
        self.ins(&Instruction::I64Or);
    }

    /// `for i in 0..len { transfer(dst + i, src + i) }`. Branch
    /// targets are literal: expressions cannot contain `break` or
    /// `continue`, so no user branch threads through this loop.
    fn byte_copy_loop(&mut self, m: MarshalLocals, transfer: Transfer) {
        self.ins(&Instruction::I32Const(0));
        self.ins(&Instruction::LocalSet(m.i));
        self.ins(&Instruction::Block(BlockType::Empty));
        self.ins(&Instruction::Loop(BlockType::Empty));
        self.ins(&Instruction::LocalGet(m.i));
        self.ins(&Instruction::LocalGet(m.len));
        self.ins(&Instruction::I32GeU);
        self.ins(&Instruction::BrIf(1));
        self.ins(&Instruction::LocalGet(m.dst));
        self.ins(&Instruction::LocalGet(m.i));
        self.ins(&Instruction::I32Add);
        self.ins(&Instruction::LocalGet(m.src));
        self.ins(&Instruction::LocalGet(m.i));
        self.ins(&Instruction::I32Add);
        match transfer {
            Transfer::Out(poke) => {
                self.ins(&Instruction::I32Load8U(mem(0, 0)));
                self.ins(&Instruction::Call(poke));
            }
            Transfer::In(peek) => {
                self.ins(&Instruction::Call(peek));
                self.ins(&Instruction::I32Store8(mem(0, 0)));
            }
        }
        self.ins(&Instruction::LocalGet(m.i));
        self.ins(&Instruction::I32Const(1));
        self.ins(&Instruction::I32Add);
        self.ins(&Instruction::LocalSet(m.i));
        self.ins(&Instruction::Br(0));
        self.ins(&Instruction::End);
        self.ins(&Instruction::End);
    }

    fn unary(&mut self, op: UnOp, operand: &HExpr) -> Result<(), CoreError> {
        match (op, vt(&operand.ty)?) {
            (UnOp::Neg, ValType::I32) => {
                self.ins(&Instruction::I32Const(0));
                self.expr(operand)?;
                self.ins(&Instruction::I32Sub);
            }
            (UnOp::Neg, ValType::I64) => {
                self.ins(&Instruction::I64Const(0));
                self.expr(operand)?;
                self.ins(&Instruction::I64Sub);
            }
            (UnOp::Neg, ValType::F32) => {
                self.expr(operand)?;
                self.ins(&Instruction::F32Neg);
            }
            (UnOp::Neg, ValType::F64) => {
                self.expr(operand)?;
                self.ins(&Instruction::F64Neg);
            }
            (UnOp::Not, ValType::I32) => {
                self.expr(operand)?;
                self.ins(&Instruction::I32Eqz);
            }
            (UnOp::BitNot, ValType::I32) => {
                self.ins(&Instruction::I32Const(-1));
                self.expr(operand)?;
                self.ins(&Instruction::I32Xor);
            }
            (UnOp::BitNot, ValType::I64) => {
                self.ins(&Instruction::I64Const(-1));
                self.expr(operand)?;
                self.ins(&Instruction::I64Xor);
            }
            (op, other) => {
                return Err(CoreError::Internal(format!(
                    "unary {:?} on wasm type {:?}",
                    op, other
                )))
            }
        }
        Ok(())
    }

    fn binary(
        &mut self,
        op: BinOp,
        lhs: &HExpr,
        rhs: &HExpr,
        _out: &Type,
    ) -> Result<(), CoreError> {
        // String `+` is the one reference-typed operator left after
        // checking; everything else is primitive.
        if lhs.ty == Type::Str && op == BinOp::Add {
            self.expr(lhs)?;
            self.expr(rhs)?;
            self.ins(&Instruction::Call(self.concat_index));
            return Ok(());
        }
        self.expr(lhs)?;
        self.expr(rhs)?;
        let i = binary_instr(op, &lhs.ty)?;
        self.ins(&i);
        Ok(())
    }
}

/// Run-length encode a local list for `Function::new`.
fn run_length(types: &[ValType]) -> Vec<(u32, ValType)> {
    let mut out: Vec<(u32, ValType)> = Vec::new();
    for &t in types {
        match out.last_mut() {
            Some((n, last)) if *last == t => *n += 1,
            _ => out.push((1, t)),
        }
    }
    out
}

fn convert_instr(from: &Type, to: &Type) -> Result<Option<Instruction<'static>>, CoreError> {
    Ok(match (vt(from)?, vt(to)?) {
        (ValType::I32, ValType::I32) => None,
        (ValType::I32, ValType::I64) => Some(Instruction::I64ExtendI32S),
        (ValType::I32, ValType::F32) => Some(Instruction::F32ConvertI32S),
        (ValType::I32, ValType::F64) => Some(Instruction::F64ConvertI32S),
        (ValType::I64, ValType::F32) => Some(Instruction::F32ConvertI64S),
        (ValType::I64, ValType::F64) => Some(Instruction::F64ConvertI64S),
        (ValType::F32, ValType::F64) => Some(Instruction::F64PromoteF32),
        (a, b) => {
            return Err(CoreError::Internal(format!(
                "no widening from {:?} to {:?}",
                a, b
            )))
        }
    })
}

fn binary_instr(op: BinOp, operand: &Type) -> Result<Instruction<'static>, CoreError> {
    let out = match vt(operand)? {
        ValType::I32 => match op {
            BinOp::Add => Instruction::I32Add,
            BinOp::Sub => Instruction::I32Sub,
            BinOp::Mul => Instruction::I32Mul,
            BinOp::Div => Instruction::I32DivS,
            BinOp::Rem => Instruction::I32RemS,
            BinOp::Shl => Instruction::I32Shl,
            BinOp::Shr => Instruction::I32ShrS,
            BinOp::UShr => Instruction::I32ShrU,
            BinOp::BitAnd => Instruction::I32And,
            BinOp::BitOr => Instruction::I32Or,
            BinOp::BitXor => Instruction::I32Xor,
            BinOp::Eq => Instruction::I32Eq,
            BinOp::Ne => Instruction::I32Ne,
            BinOp::Lt => Instruction::I32LtS,
            BinOp::Gt => Instruction::I32GtS,
            BinOp::Le => Instruction::I32LeS,
            BinOp::Ge => Instruction::I32GeS,
            other => {
                return Err(CoreError::Internal(format!(
                    "operator {:?} reached emission",
                    other
                )))
            }
        },
        ValType::I64 => match op {
            BinOp::Add => Instruction::I64Add,
            BinOp::Sub => Instruction::I64Sub,
            BinOp::Mul => Instruction::I64Mul,
            BinOp::Div => Instruction::I64DivS,
            BinOp::Rem => Instruction::I64RemS,
            BinOp::Shl => Instruction::I64Shl,
            BinOp::Shr => Instruction::I64ShrS,
            BinOp::UShr => Instruction::I64ShrU,
            BinOp::BitAnd => Instruction::I64And,
            BinOp::BitOr => Instruction::I64Or,
            BinOp::BitXor => Instruction::I64Xor,
            BinOp::Eq => Instruction::I64Eq,
            BinOp::Ne => Instruction::I64Ne,
            BinOp::Lt => Instruction::I64LtS,
            BinOp::Gt => Instruction::I64GtS,
            BinOp::Le => Instruction::I64LeS,
            BinOp::Ge => Instruction::I64GeS,
            other => {
                return Err(CoreError::Internal(format!(
                    "operator {:?} reached emission",
                    other
                )))
            }
        },
        ValType::F32 => match op {
            BinOp::Add => Instruction::F32Add,
            BinOp::Sub => Instruction::F32Sub,
            BinOp::Mul => Instruction::F32Mul,
            BinOp::Div => Instruction::F32Div,
            BinOp::Eq => Instruction::F32Eq,
            BinOp::Ne => Instruction::F32Ne,
            BinOp::Lt => Instruction::F32Lt,
            BinOp::Gt => Instruction::F32Gt,
            BinOp::Le => Instruction::F32Le,
            BinOp::Ge => Instruction::F32Ge,
            other => {
                return Err(CoreError::Internal(format!(
                    "operator {:?} on floats reached emission",
                    other
                )))
            }
        },
        ValType::F64 => match op {
            BinOp::Add => Instruction::F64Add,
            BinOp::Sub => Instruction::F64Sub,
            BinOp::Mul => Instruction::F64Mul,
            BinOp::Div => Instruction::F64Div,
            BinOp::Eq => Instruction::F64Eq,
            BinOp::Ne => Instruction::F64Ne,
            BinOp::Lt => Instruction::F64Lt,
            BinOp::Gt => Instruction::F64Gt,
            BinOp::Le => Instruction::F64Le,
            BinOp::Ge => Instruction::F64Ge,
            other => {
                return Err(CoreError::Internal(format!(
                    "operator {:?} on floats reached emission",
                    other
                )))
            }
        },
        other => {
            return Err(CoreError::Internal(format!(
                "binary operator on wasm type {:?}",
                other
            )))
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::ErrorManager;
    use crate::host::default_universe;
    use crate::lexer::{scan, ScanConfig};
    use crate::parser::parse;
    use crate::sem::{analyze, SourceAst};

    fn compile(source: &str) -> BTreeMap<String, Vec<u8>> {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, source, &ScanConfig::default(), &mut errs).expect("scan");
        let stmts = parse(&tokens, &mut errs).expect("parse");
        let program = analyze(
            vec![SourceAst {
                script_name: String::from("Main"),
                stmts,
            }],
            &default_universe(),
            &mut errs,
        )
        .expect("analyze");
        assert!(
            !errs.has_errors(),
            "unexpected errors: {:?}",
            errs.diagnostics()
        );
        generate(&program).expect("generate")
    }

    fn validate(bytes: &[u8]) {
        wasmparser::validate(bytes).expect("module must validate");
    }

    fn run_main(bytes: &[u8]) -> i32 {
        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, bytes).expect("module");
        let mut store = wasmi::Store::new(&engine, ());
        let linker: wasmi::Linker<()> = wasmi::Linker::new(&engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("instantiate")
            .start(&mut store)
            .expect("start");
        let main = instance
            .get_typed_func::<(), i32>(&store, "main")
            .expect("main export");
        main.call(&mut store, ()).expect("call")
    }

    #[test]
    fn minimal_class_emits_one_valid_module() {
        let out = compile("class Point(x: int, y: int)\n    static fn zero(): int\n        return 0\n");
        assert_eq!(out.len(), 1);
        let bytes = out.get("Point").expect("keyed by FQN");
        validate(bytes);
    }

    #[test]
    fn script_arithmetic_runs() {
        let out = compile("let a = 6\nlet b = 7\nreturn a * b\n");
        let bytes = out.get("Main").expect("script module");
        validate(bytes);
        assert_eq!(run_main(bytes), 42);
    }

    #[test]
    fn control_flow_runs() {
        let source = "\
let n = 10
let sum = 0
let i = 1
while i <= n
    if i % 2 == 0
        sum = sum + i
    i = i + 1
return sum
";
        let out = compile(source);
        let bytes = out.get("Main").expect("script module");
        validate(bytes);
        assert_eq!(run_main(bytes), 30);
    }

    /// Instantiate the named dependency modules first, publishing
    /// their exports under their FQN, then run the script's `main`.
    fn run_linked(out: &BTreeMap<String, Vec<u8>>, deps: &[&str]) -> i32 {
        let engine = wasmi::Engine::default();
        let mut store = wasmi::Store::new(&engine, ());
        let mut linker: wasmi::Linker<()> = wasmi::Linker::new(&engine);
        for dep in deps {
            let module =
                wasmi::Module::new(&engine, out.get(*dep).expect("dependency")).expect("module");
            let instance = linker
                .instantiate(&mut store, &module)
                .expect("instantiate dependency")
                .start(&mut store)
                .expect("start dependency");
            for export in instance.exports(&store) {
                let name = export.name().to_string();
                let ext = export.into_extern();
                linker.define(dep, &name, ext).expect("define");
            }
        }
        let script = wasmi::Module::new(&engine, out.get("Main").expect("script")).expect("module");
        let instance = linker
            .instantiate(&mut store, &script)
            .expect("instantiate script")
            .start(&mut store)
            .expect("start script");
        let main = instance
            .get_typed_func::<(), i32>(&store, "main")
            .expect("main export");
        main.call(&mut store, ()).expect("call")
    }

    #[test]
    fn objects_and_methods_run() {
        let source = "\
class Counter(start: int)
    fn bump(by: int): int
        start = start + by
        return start
let c = Counter(40)
c.bump(1)
return c.bump(1)
";
        let out = compile(source);
        assert_eq!(out.len(), 2);
        for bytes in out.values() {
            validate(bytes);
        }
        assert_eq!(run_linked(&out, &["Counter"]), 42);
    }

    #[test]
    fn cross_module_field_reads_see_the_object() {
        // The object lives in `Point`'s memory; a raw load in the
        // script's own memory would see zeroes.
        let source = "\
class Point(x: int, y: int)
let p = Point(40, 2)
return p.x + p.y
";
        let out = compile(source);
        for bytes in out.values() {
            validate(bytes);
        }
        assert_eq!(run_linked(&out, &["Point"]), 42);
    }

    #[test]
    fn cross_module_field_writes_reach_the_object() {
        let source = "\
class Cell(v: int)
    fn read(): int
        return v
let c = Cell(1)
c.v = 41
return c.read() + 1
";
        let out = compile(source);
        for bytes in out.values() {
            validate(bytes);
        }
        assert_eq!(run_linked(&out, &["Cell"]), 42);
    }

    #[test]
    fn field_accessors_are_exported() {
        let out = compile("class Point(x: int, y: int)\n");
        let bytes = out.get("Point").expect("class module");
        let mut names: Vec<String> = Vec::new();
        for payload in wasmparser::Parser::new(0).parse_all(bytes) {
            if let wasmparser::Payload::ExportSection(reader) = payload.expect("payload") {
                for export in reader {
                    names.push(export.expect("export").name.to_string());
                }
            }
        }
        for expected in ["alloc", "poke8", "peek8", "field$0$get", "field$1$set"] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn closures_capture_and_run() {
        let source = "\
let total = 0
let add = fn(n: int) =>
    total = total + n
add(40)
add(2)
return total
";
        let out = compile(source);
        let bytes = out.get("Main").expect("script module");
        validate(bytes);
        assert_eq!(run_main(bytes), 42);
    }

    #[test]
    fn string_literals_land_in_the_data_section() {
        let out = compile("let s = \"larch\" + \"wood\"\nreturn 0\n");
        let bytes = out.get("Main").expect("script module");
        validate(bytes);
        let mut found = false;
        for payload in wasmparser::Parser::new(0).parse_all(bytes) {
            if let wasmparser::Payload::DataSection(reader) = payload.expect("payload") {
                for segment in reader {
                    let segment = segment.expect("segment");
                    let text = String::from_utf8_lossy(segment.data);
                    assert!(text.contains("larch"));
                    assert!(text.contains("wood"));
                    found = true;
                }
            }
        }
        assert!(found, "expected a data section with the literals");
        assert_eq!(run_main(bytes), 0);
    }

    #[test]
    fn line_section_is_present_and_ordered() {
        let out = compile("let a = 1\nlet b = 2\nreturn a + b\n");
        let bytes = out.get("Main").expect("script module");
        let mut lines: Vec<(u32, u32, u32)> = Vec::new();
        for payload in wasmparser::Parser::new(0).parse_all(bytes) {
            if let wasmparser::Payload::CustomSection(reader) = payload.expect("payload") {
                if reader.name() == LINES_SECTION {
                    for triple in reader.data().chunks(12) {
                        lines.push((
                            u32::from_le_bytes(triple[0..4].try_into().unwrap()),
                            u32::from_le_bytes(triple[4..8].try_into().unwrap()),
                            u32::from_le_bytes(triple[8..12].try_into().unwrap()),
                        ));
                    }
                }
            }
        }
        let recorded: Vec<u32> = lines.iter().map(|&(_, _, l)| l).collect();
        assert!(recorded.windows(2).all(|w| w[0] <= w[1]));
        assert!(recorded.contains(&1));
        assert!(recorded.contains(&3));
    }

    #[test]
    fn emission_is_deterministic() {
        let source = "class B(x: int)\nclass A(b: B)\nreturn 0\n";
        let first = compile(source);
        let second = compile(source);
        assert_eq!(first, second);
        let keys: Vec<&String> = first.keys().collect();
        assert_eq!(keys, vec!["A", "B", "Main"]);
    }
}
