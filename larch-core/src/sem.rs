//! Semantic analysis: AST to typed IR.
//!
//! Two passes over the full AST set of a compilation unit. Pass 1
//! registers every declared type name (so forward references across
//! files resolve), builds each type's field layout and method
//! signatures, and validates supertype chains; type names referenced
//! before their declaration is seen are queued as half-applied
//! references and replayed in FIFO order once registration completes.
//! Pass 2 checks method bodies: name resolution through a scope chain,
//! overload selection, operator-to-method mapping, lambda lifting with
//! capture analysis, and insertion of explicit conversion nodes.
//!
//! Per-declaration errors are non-fatal; sibling methods keep being
//! analyzed. A cyclic supertype chain poisons the whole unit and
//! suppresses code generation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ast::{
    BinOp, ClassDecl, Expr, ExprKind, FnDecl, InterfaceDecl, Member, Param, Stmt, StmtKind,
    TypeRef, TypeRefKind, UnOp,
};
use crate::diagnostic::ErrorManager;
use crate::error::CoreError;
use crate::hir::{
    mangle, FieldDef, HExpr, HExprKind, HProgram, HStmt, HStmtKind, LocalDef, LocalId, MethodDef,
    ParamDef, TypeDef, TypeDefKind,
};
use crate::host::HostUniverse;
use crate::span::Pos;
use crate::types::{conversion_rank, promote, Rank, Type};

/// One parsed source file. Top-level statements that are not type
/// declarations are collected into an implicit script type named
/// `script_name`, with plain statements forming its static `main`.
#[derive(Debug)]
pub struct SourceAst {
    pub script_name: String,
    pub stmts: Vec<Stmt>,
}

/// Analyze a compilation unit. The returned program is only
/// meaningful when the error manager recorded no errors; callers gate
/// code generation on that.
pub fn analyze(
    files: Vec<SourceAst>,
    universe: &HostUniverse,
    errs: &mut ErrorManager,
) -> Result<HProgram, CoreError> {
    let mut an = Analyzer {
        universe,
        types: Vec::new(),
        index: HashMap::new(),
        pending: VecDeque::new(),
        tasks: Vec::new(),
    };
    an.register_files(files, errs)?;
    an.replay_pending(errs)?;
    an.check_supertypes(errs)?;
    if errs.is_fatal() {
        return Ok(HProgram { types: an.types });
    }
    an.flatten_fields();
    an.check_conformance(errs)?;
    let dispatch = an.build_dispatch_table();

    let tasks = std::mem::take(&mut an.tasks);
    for task in tasks {
        let type_fqn = an.types[task.type_index].fqn.clone();
        let mut counter = an.lambda_count(task.type_index);
        let checker = BodyChecker {
            types: &an.types,
            index: &an.index,
            universe,
            dispatch: &dispatch,
            errs: &mut *errs,
            type_index: task.type_index,
            type_fqn,
            boxed_names: HashSet::new(),
            bodies: Vec::new(),
            frames: Vec::new(),
            cur_frame: 0,
            lifted: Vec::new(),
            lambda_counter: &mut counter,
        };
        let (body, locals, lifted) = checker.check_task(&task)?;
        let method = &mut an.types[task.type_index].methods[task.method_index];
        method.body = Some(body);
        method.locals = locals;
        an.types[task.type_index].methods.extend(lifted);
    }
    Ok(HProgram { types: an.types })
}

/// Reference to a type name seen before the name was registered.
#[derive(Debug)]
struct PendingRef {
    name: String,
    pos: Pos,
}

/// A method body waiting for pass 2.
#[derive(Debug)]
struct BodyTask {
    type_index: usize,
    method_index: usize,
    instance: bool,
    stmts: Vec<Stmt>,
    kind: TaskKind,
}

#[derive(Debug)]
enum TaskKind {
    Method,
    /// Synthetic constructor: allocate, store constructor parameters
    /// into their fields, run field initializers in field order.
    Ctor { inits: Vec<(String, Expr)> },
    /// Implicit script entry point; falls off the end returning 0.
    ScriptMain,
}

/// A callable's signature for overload purposes.
#[derive(Debug, Clone)]
struct Sig {
    params: Vec<Type>,
    variadic: Option<Type>,
}

/// One entry of the polymorphic dispatch table for `any` receivers.
#[derive(Debug, Clone)]
struct DynTarget {
    /// Defining type.
    fqn: String,
    host: bool,
    mangled: String,
    /// Receiver type recovered by the unbox.
    recv: Type,
    /// Parameter types excluding the receiver.
    params: Vec<Type>,
    variadic: Option<Type>,
    ret: Type,
}

/// Name to candidates, in declaration order (declared types first,
/// then host types). Arity filtering happens at lookup.
type DispatchTable = HashMap<String, Vec<DynTarget>>;

struct Analyzer<'a> {
    universe: &'a HostUniverse,
    types: Vec<TypeDef>,
    index: HashMap<String, usize>,
    pending: VecDeque<PendingRef>,
    tasks: Vec<BodyTask>,
}

impl<'a> Analyzer<'a> {
    // --------------------------------------------------------------
    // Pass 1: registration
    // --------------------------------------------------------------

    fn register_files(
        &mut self,
        files: Vec<SourceAst>,
        errs: &mut ErrorManager,
    ) -> Result<(), CoreError> {
        for file in files {
            let mut script_fns: Vec<FnDecl> = Vec::new();
            let mut script_body: Vec<Stmt> = Vec::new();
            let mut script_pos = Pos::NONE;
            for stmt in file.stmts {
                match stmt.kind {
                    StmtKind::Class(decl) => self.register_class(decl, errs)?,
                    StmtKind::Interface(decl) => self.register_interface(decl, errs)?,
                    StmtKind::Fn(decl) => script_fns.push(decl),
                    _ => {
                        if script_pos.is_none() {
                            script_pos = stmt.pos;
                        }
                        script_body.push(stmt);
                    }
                }
            }
            if !script_fns.is_empty() || !script_body.is_empty() {
                self.register_script(&file.script_name, script_fns, script_body, script_pos, errs)?;
            }
        }
        Ok(())
    }

    fn declare_type(
        &mut self,
        name: &str,
        kind: TypeDefKind,
        pos: Pos,
        errs: &mut ErrorManager,
    ) -> Result<Option<usize>, CoreError> {
        if self.index.contains_key(name) {
            errs.semantic_error(format!("duplicate type name `{}`", name), pos)?;
            return Ok(None);
        }
        if self.universe.find_simple(name).is_some() {
            errs.semantic_error(
                format!("type name `{}` collides with a host type", name),
                pos,
            )?;
            return Ok(None);
        }
        let index = self.types.len();
        self.types.push(TypeDef {
            fqn: name.to_string(),
            kind,
            supers: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pos,
        });
        self.index.insert(name.to_string(), index);
        Ok(Some(index))
    }

    fn register_class(&mut self, decl: ClassDecl, errs: &mut ErrorManager) -> Result<(), CoreError> {
        let Some(ti) = self.declare_type(&decl.name, TypeDefKind::Class, decl.pos, errs)? else {
            return Ok(());
        };
        for sup in &decl.supers {
            if let Some(name) = self.resolve_super(sup, errs)? {
                self.types[ti].supers.push(name);
            }
        }

        // Constructor parameters double as leading fields.
        let mut ctor_params = Vec::new();
        let mut seen_fields = HashSet::new();
        for p in &decl.params {
            let ty = self.resolve_param_type(p, errs)?;
            if !seen_fields.insert(p.name.clone()) {
                errs.semantic_error(format!("duplicate field `{}`", p.name), p.pos)?;
                continue;
            }
            if p.variadic {
                errs.semantic_error("constructor parameters cannot be variadic", p.pos)?;
            }
            self.types[ti].fields.push(FieldDef {
                name: p.name.clone(),
                ty: ty.clone(),
                pos: p.pos,
            });
            ctor_params.push(ParamDef {
                name: p.name.clone(),
                ty,
                pos: p.pos,
            });
        }

        let mut ctor_inits = Vec::new();
        let mut methods: Vec<(FnDecl, usize)> = Vec::new();
        for member in decl.members {
            match member {
                Member::Field { name, ty, init, pos } => {
                    let ty = self.resolve_type_ref(&ty, errs)?;
                    if !seen_fields.insert(name.clone()) {
                        errs.semantic_error(format!("duplicate field `{}`", name), pos)?;
                        continue;
                    }
                    self.types[ti].fields.push(FieldDef {
                        name: name.clone(),
                        ty,
                        pos,
                    });
                    if let Some(init) = init {
                        ctor_inits.push((name, init));
                    }
                }
                Member::Method(decl) => {
                    let mi = self.register_method(ti, &decl, errs)?;
                    if let Some(mi) = mi {
                        methods.push((decl, mi));
                    }
                }
            }
        }

        // Synthetic constructor.
        let ctor = MethodDef {
            name: String::from("new"),
            mangled: mangle(
                "new",
                &ctor_params.iter().map(|p| p.ty.clone()).collect::<Vec<_>>(),
                None,
            ),
            params: ctor_params,
            variadic: None,
            ret: Type::Named(decl.name.clone()),
            is_static: true,
            body: None,
            locals: Vec::new(),
            is_lambda: false,
            pos: decl.pos,
        };
        let ctor_index = self.types[ti].methods.len();
        self.types[ti].methods.push(ctor);
        self.tasks.push(BodyTask {
            type_index: ti,
            method_index: ctor_index,
            instance: false,
            stmts: Vec::new(),
            kind: TaskKind::Ctor { inits: ctor_inits },
        });

        for (decl, mi) in methods {
            match decl.body {
                Some(stmts) => {
                    self.tasks.push(BodyTask {
                        type_index: ti,
                        method_index: mi,
                        instance: !decl.is_static,
                        stmts,
                        kind: TaskKind::Method,
                    });
                }
                None => {
                    errs.semantic_error(
                        format!("method `{}` needs a body", decl.name),
                        decl.pos,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn register_interface(
        &mut self,
        decl: InterfaceDecl,
        errs: &mut ErrorManager,
    ) -> Result<(), CoreError> {
        let Some(ti) = self.declare_type(&decl.name, TypeDefKind::Interface, decl.pos, errs)?
        else {
            return Ok(());
        };
        for sup in &decl.supers {
            if let Some(name) = self.resolve_super(sup, errs)? {
                self.types[ti].supers.push(name);
            }
        }
        for method in decl.methods {
            if method.body.is_some() {
                errs.semantic_error(
                    format!("interface method `{}` cannot have a body", method.name),
                    method.pos,
                )?;
            }
            if method.is_static {
                errs.semantic_error(
                    format!("interface method `{}` cannot be static", method.name),
                    method.pos,
                )?;
            }
            self.register_method(ti, &method, errs)?;
        }
        Ok(())
    }

    fn register_script(
        &mut self,
        name: &str,
        fns: Vec<FnDecl>,
        body: Vec<Stmt>,
        pos: Pos,
        errs: &mut ErrorManager,
    ) -> Result<(), CoreError> {
        let Some(ti) = self.declare_type(name, TypeDefKind::Class, pos, errs)? else {
            return Ok(());
        };
        for decl in fns {
            // Top-level functions are static regardless of keywords.
            let forced = FnDecl {
                is_static: true,
                ..decl
            };
            let mi = self.register_method(ti, &forced, errs)?;
            if let Some(mi) = mi {
                match forced.body {
                    Some(stmts) => self.tasks.push(BodyTask {
                        type_index: ti,
                        method_index: mi,
                        instance: false,
                        stmts,
                        kind: TaskKind::Method,
                    }),
                    None => {
                        errs.semantic_error(
                            format!("function `{}` needs a body", forced.name),
                            forced.pos,
                        )?;
                    }
                }
            }
        }
        let main = MethodDef {
            name: String::from("main"),
            mangled: mangle("main", &[], None),
            params: Vec::new(),
            variadic: None,
            ret: Type::Int,
            is_static: true,
            body: None,
            locals: Vec::new(),
            is_lambda: false,
            pos,
        };
        if self.types[ti].methods.iter().any(|m| m.mangled == main.mangled) {
            errs.semantic_error(
                "script statements conflict with a declared `main` function",
                pos,
            )?;
            return Ok(());
        }
        let mi = self.types[ti].methods.len();
        self.types[ti].methods.push(main);
        self.tasks.push(BodyTask {
            type_index: ti,
            method_index: mi,
            instance: false,
            stmts: body,
            kind: TaskKind::ScriptMain,
        });
        Ok(())
    }

    fn register_method(
        &mut self,
        ti: usize,
        decl: &FnDecl,
        errs: &mut ErrorManager,
    ) -> Result<Option<usize>, CoreError> {
        let mut params = Vec::new();
        let mut variadic = None;
        for (i, p) in decl.params.iter().enumerate() {
            let ty = self.resolve_param_type(p, errs)?;
            if p.variadic {
                if i + 1 != decl.params.len() {
                    errs.semantic_error(
                        "a variadic parameter must come last",
                        p.pos,
                    )?;
                }
                variadic = Some(ty);
            } else {
                params.push(ParamDef {
                    name: p.name.clone(),
                    ty,
                    pos: p.pos,
                });
            }
        }
        let ret = match &decl.ret {
            Some(ty) => self.resolve_type_ref(ty, errs)?,
            None => Type::Unit,
        };
        let mangled = mangle(
            &decl.name,
            &params.iter().map(|p| p.ty.clone()).collect::<Vec<_>>(),
            variadic.as_ref(),
        );
        if self.types[ti].methods.iter().any(|m| m.mangled == mangled) {
            errs.semantic_error(
                format!("duplicate method `{}` with the same signature", decl.name),
                decl.pos,
            )?;
            return Ok(None);
        }
        let mi = self.types[ti].methods.len();
        self.types[ti].methods.push(MethodDef {
            name: decl.name.clone(),
            mangled,
            params,
            variadic,
            ret,
            is_static: decl.is_static,
            body: None,
            locals: Vec::new(),
            is_lambda: false,
            pos: decl.pos,
        });
        Ok(Some(mi))
    }

    // --------------------------------------------------------------
    // Type-name resolution and the half-applied queue
    // --------------------------------------------------------------

    fn resolve_param_type(
        &mut self,
        p: &Param,
        errs: &mut ErrorManager,
    ) -> Result<Type, CoreError> {
        match &p.ty {
            Some(ty) => self.resolve_type_ref(ty, errs),
            None => {
                errs.semantic_error(
                    format!("parameter `{}` needs a type", p.name),
                    p.pos,
                )?;
                Ok(Type::Any)
            }
        }
    }

    /// Resolve a syntactic type reference. A name that is neither a
    /// primitive, an already-registered type nor a host type is
    /// optimistically treated as a forward reference: it is queued and
    /// validated when the queue is replayed after registration.
    fn resolve_type_ref(
        &mut self,
        ty: &TypeRef,
        errs: &mut ErrorManager,
    ) -> Result<Type, CoreError> {
        match &ty.kind {
            TypeRefKind::Name(name) => Ok(self.resolve_name(name, ty.pos)),
            TypeRefKind::Fn { params, ret } => {
                let mut ps = Vec::new();
                for p in params {
                    ps.push(self.resolve_type_ref(p, errs)?);
                }
                let ret = match ret {
                    Some(r) => self.resolve_type_ref(r, errs)?,
                    None => Type::Unit,
                };
                Ok(Type::Function {
                    params: ps,
                    ret: Box::new(ret),
                })
            }
        }
    }

    fn resolve_name(&mut self, name: &str, pos: Pos) -> Type {
        if let Some(prim) = Type::from_name(name) {
            return prim;
        }
        if self.index.contains_key(name) {
            return Type::Named(name.to_string());
        }
        if let Some(host) = self.universe.find_simple(name) {
            return Type::Named(host.fqn.clone());
        }
        self.pending.push_back(PendingRef {
            name: name.to_string(),
            pos,
        });
        Type::Named(name.to_string())
    }

    fn resolve_super(
        &mut self,
        sup: &TypeRef,
        errs: &mut ErrorManager,
    ) -> Result<Option<String>, CoreError> {
        match self.resolve_type_ref(sup, errs)? {
            Type::Named(name) => {
                if name.starts_with("host.") {
                    errs.semantic_error("host types cannot be extended", sup.pos)?;
                    Ok(None)
                } else {
                    Ok(Some(name))
                }
            }
            other => {
                errs.semantic_error(
                    format!("`{}` cannot be used as a supertype", other),
                    sup.pos,
                )?;
                Ok(None)
            }
        }
    }

    /// Replay queued forward references in the order they were seen.
    fn replay_pending(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        while let Some(pending) = self.pending.pop_front() {
            if !self.index.contains_key(&pending.name) {
                errs.semantic_error(
                    format!("unresolved type name `{}`", pending.name),
                    pending.pos,
                )?;
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Supertype validation
    // --------------------------------------------------------------

    fn check_supertypes(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        // Shape: a class may extend at most one class; everything else
        // in the list, and every interface supertype, must be an
        // interface.
        for ti in 0..self.types.len() {
            let kind = self.types[ti].kind;
            let pos = self.types[ti].pos;
            let supers = self.types[ti].supers.clone();
            let mut class_count = 0;
            for name in &supers {
                let Some(&si) = self.index.get(name) else {
                    continue; // already reported by the replay
                };
                match (kind, self.types[si].kind) {
                    (TypeDefKind::Class, TypeDefKind::Class) => {
                        class_count += 1;
                        if class_count > 1 {
                            errs.semantic_error(
                                "a class can extend at most one class",
                                pos,
                            )?;
                        }
                    }
                    (TypeDefKind::Interface, TypeDefKind::Class) => {
                        errs.semantic_error(
                            format!("interface cannot extend class `{}`", name),
                            pos,
                        )?;
                    }
                    _ => {}
                }
            }
        }

        // Cycle walk; a cycle is structural and fatal for the unit.
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut colors = vec![Color::White; self.types.len()];
        for start in 0..self.types.len() {
            if colors[start] != Color::White {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            colors[start] = Color::Grey;
            while let Some(&mut (ti, ref mut edge)) = stack.last_mut() {
                let supers = &self.types[ti].supers;
                if *edge >= supers.len() {
                    colors[ti] = Color::Black;
                    stack.pop();
                    continue;
                }
                let name = supers[*edge].clone();
                *edge += 1;
                let Some(&si) = self.index.get(&name) else {
                    continue;
                };
                match colors[si] {
                    Color::White => {
                        colors[si] = Color::Grey;
                        stack.push((si, 0));
                    }
                    Color::Grey => {
                        errs.fatal_semantic_error(
                            format!(
                                "cyclic supertype chain involving `{}`",
                                self.types[si].fqn
                            ),
                            self.types[si].pos,
                        )?;
                        return Ok(());
                    }
                    Color::Black => {}
                }
            }
        }
        Ok(())
    }

    /// Prepend inherited class fields so an object's layout is the
    /// super chain's fields followed by its own.
    fn flatten_fields(&mut self) {
        fn flatten(
            types: &mut Vec<TypeDef>,
            index: &HashMap<String, usize>,
            ti: usize,
            done: &mut Vec<bool>,
        ) {
            if done[ti] {
                return;
            }
            done[ti] = true;
            let super_class = types[ti]
                .supers
                .iter()
                .filter_map(|name| index.get(name).copied())
                .find(|&si| types[si].kind == TypeDefKind::Class);
            if let Some(si) = super_class {
                flatten(types, index, si, done);
                let mut inherited = types[si].fields.clone();
                inherited.extend(types[ti].fields.drain(..));
                types[ti].fields = inherited;
            }
        }
        let mut done = vec![false; self.types.len()];
        for ti in 0..self.types.len() {
            flatten(&mut self.types, &self.index, ti, &mut done);
        }
    }

    /// Every method of every transitive interface must be implemented
    /// with the same signature and result type.
    fn check_conformance(&mut self, errs: &mut ErrorManager) -> Result<(), CoreError> {
        for ti in 0..self.types.len() {
            if self.types[ti].kind != TypeDefKind::Class {
                continue;
            }
            let mut ifaces = Vec::new();
            let mut seen = HashSet::new();
            self.collect_interfaces(ti, &mut ifaces, &mut seen);
            let pos = self.types[ti].pos;
            for ii in ifaces {
                for mi in 0..self.types[ii].methods.len() {
                    let required = &self.types[ii].methods[mi];
                    let found = self
                        .method_chain(ti)
                        .flat_map(|ci| self.types[ci].methods.iter())
                        .find(|m| !m.is_static && m.mangled == required.mangled);
                    match found {
                        Some(m) if m.ret == required.ret => {}
                        Some(m) => {
                            let msg = format!(
                                "method `{}` returns `{}` but `{}` requires `{}`",
                                m.name, m.ret, self.types[ii].fqn, required.ret
                            );
                            errs.semantic_error(msg, pos)?;
                        }
                        None => {
                            let msg = format!(
                                "class `{}` does not implement `{}` from `{}`",
                                self.types[ti].fqn, required.name, self.types[ii].fqn
                            );
                            errs.semantic_error(msg, pos)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn collect_interfaces(&self, ti: usize, out: &mut Vec<usize>, seen: &mut HashSet<usize>) {
        for name in &self.types[ti].supers {
            let Some(&si) = self.index.get(name) else {
                continue;
            };
            if self.types[si].kind == TypeDefKind::Interface && seen.insert(si) {
                out.push(si);
            }
            self.collect_interfaces(si, out, seen);
        }
    }

    /// The class chain starting at `ti`, following the (single) class
    /// supertype upward.
    fn method_chain(&self, ti: usize) -> MethodChain<'_> {
        MethodChain {
            types: &self.types,
            index: &self.index,
            next: Some(ti),
        }
    }

    /// Dispatch table for `any` receivers: every instance method of a
    /// declared type plus every host method whose first parameter is a
    /// host reference type, keyed by bare name.
    fn build_dispatch_table(&self) -> DispatchTable {
        let mut table: DispatchTable = HashMap::new();
        for def in &self.types {
            for m in &def.methods {
                if m.is_static || m.is_lambda {
                    continue;
                }
                table.entry(m.name.clone()).or_default().push(DynTarget {
                    fqn: def.fqn.clone(),
                    host: false,
                    mangled: m.mangled.clone(),
                    recv: Type::Named(def.fqn.clone()),
                    params: m.params.iter().map(|p| p.ty.clone()).collect(),
                    variadic: m.variadic.clone(),
                    ret: m.ret.clone(),
                });
            }
        }
        for host in self.universe.types() {
            for m in &host.methods {
                let Some(Type::Named(recv)) = m.params.first() else {
                    continue;
                };
                table.entry(m.name.clone()).or_default().push(DynTarget {
                    fqn: host.fqn.clone(),
                    host: true,
                    mangled: m.mangled_name(),
                    recv: Type::Named(recv.clone()),
                    params: m.params[1..].to_vec(),
                    variadic: m.variadic.clone(),
                    ret: m.ret.clone(),
                });
            }
        }
        table
    }

    fn lambda_count(&self, ti: usize) -> usize {
        self.types[ti].methods.iter().filter(|m| m.is_lambda).count()
    }
}

struct MethodChain<'a> {
    types: &'a [TypeDef],
    index: &'a HashMap<String, usize>,
    next: Option<usize>,
}

impl<'a> Iterator for MethodChain<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let ti = self.next?;
        self.next = self.types[ti]
            .supers
            .iter()
            .filter_map(|name| self.index.get(name).copied())
            .find(|&si| self.types[si].kind == TypeDefKind::Class);
        Some(ti)
    }
}

// ------------------------------------------------------------------
// Overload selection
// ------------------------------------------------------------------

enum Selection {
    Chosen(usize),
    NoMatch,
    Ambiguous(Vec<usize>),
}

/// Rank a candidate against the argument types, or `None` when it is
/// inapplicable. Positions consumed by the variadic tail rank
/// `Variadic` regardless of how well the element type matches.
fn rank_call(sig: &Sig, args: &[Type]) -> Option<Vec<Rank>> {
    match &sig.variadic {
        None => {
            if args.len() != sig.params.len() {
                return None;
            }
            args.iter()
                .zip(&sig.params)
                .map(|(a, p)| conversion_rank(a, p))
                .collect()
        }
        Some(elem) => {
            if args.len() < sig.params.len() {
                return None;
            }
            let mut ranks = Vec::with_capacity(args.len());
            for (a, p) in args.iter().zip(&sig.params) {
                ranks.push(conversion_rank(a, p)?);
            }
            for a in &args[sig.params.len()..] {
                conversion_rank(a, elem)?;
                ranks.push(Rank::Variadic);
            }
            Some(ranks)
        }
    }
}

/// Pick the most specific applicable candidate. Candidates are
/// considered in declaration order, which makes the outcome (chosen
/// method or ambiguity set) deterministic for a given candidate list.
fn select(cands: &[Sig], args: &[Type]) -> Selection {
    let applicable: Vec<(usize, Vec<Rank>)> = cands
        .iter()
        .enumerate()
        .filter_map(|(i, sig)| rank_call(sig, args).map(|ranks| (i, ranks)))
        .collect();
    if applicable.is_empty() {
        return Selection::NoMatch;
    }

    // a strictly beats b when no position ranks worse and one ranks
    // better; equal rank vectors fall back to fixed-arity over
    // variadic.
    let beats = |a: &(usize, Vec<Rank>), b: &(usize, Vec<Rank>)| -> bool {
        let mut better = false;
        for (ra, rb) in a.1.iter().zip(&b.1) {
            if ra > rb {
                return false;
            }
            if ra < rb {
                better = true;
            }
        }
        if better {
            return true;
        }
        cands[a.0].variadic.is_none() && cands[b.0].variadic.is_some()
    };

    let survivors: Vec<&(usize, Vec<Rank>)> = applicable
        .iter()
        .filter(|c| {
            !applicable
                .iter()
                .any(|other| other.0 != c.0 && beats(other, c))
        })
        .collect();
    match survivors.as_slice() {
        [one] => Selection::Chosen(one.0),
        many => Selection::Ambiguous(many.iter().map(|c| c.0).collect()),
    }
}

// ------------------------------------------------------------------
// Pass 2: body checking
// ------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CaptureSource {
    /// Slot in the immediately enclosing body.
    Local(LocalId),
    /// Environment index in the immediately enclosing lambda.
    Env(usize),
}

#[derive(Debug, Clone)]
struct Capture {
    name: String,
    ty: Type,
    boxed: bool,
    source: CaptureSource,
}

/// How the current body reaches the receiver object.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SelfKind {
    /// Static method, script code or a lambda body.
    None,
    /// Instance method; the receiver is parameter slot 0.
    Receiver,
    /// Constructor; the receiver is the freshly allocated record.
    Slot(LocalId),
}

struct BodyState {
    locals: Vec<LocalDef>,
    captures: Vec<Capture>,
    ret: Type,
    loop_depth: u32,
    self_kind: SelfKind,
}

struct Frame {
    parent: Option<usize>,
    body: usize,
    names: Vec<(String, LocalId)>,
}

/// Where a name resolved to, relative to the current body.
enum VarRef {
    Local { id: LocalId, boxed: bool },
    Capture { index: usize, boxed: bool, ty: Type },
}

struct BodyChecker<'a> {
    types: &'a [TypeDef],
    index: &'a HashMap<String, usize>,
    universe: &'a HostUniverse,
    dispatch: &'a DispatchTable,
    errs: &'a mut ErrorManager,
    type_index: usize,
    type_fqn: String,
    boxed_names: HashSet<String>,
    bodies: Vec<BodyState>,
    frames: Vec<Frame>,
    cur_frame: usize,
    lifted: Vec<MethodDef>,
    lambda_counter: &'a mut usize,
}

impl<'a> BodyChecker<'a> {
    fn check_task(
        mut self,
        task: &BodyTask,
    ) -> Result<(Vec<HStmt>, Vec<LocalDef>, Vec<MethodDef>), CoreError> {
        let method = &self.types[task.type_index].methods[task.method_index];
        let ret = method.ret.clone();
        let params: Vec<ParamDef> = method.params.clone();
        let variadic = method.variadic.clone();
        let pos = method.pos;

        // Names assigned anywhere in the body and also mentioned
        // inside a lambda must live in heap cells so every closure and
        // the enclosing frame observe the same value.
        let mut assigned = HashSet::new();
        let mut in_lambda = HashSet::new();
        collect_assigned(&task.stmts, &mut assigned);
        collect_lambda_idents(&task.stmts, false, &mut in_lambda);
        if let TaskKind::Ctor { inits } = &task.kind {
            for (_, init) in inits {
                collect_assigned_expr(init, &mut assigned);
                collect_lambda_idents_expr(init, false, &mut in_lambda);
            }
        }
        self.boxed_names = assigned.intersection(&in_lambda).cloned().collect();

        let self_kind = if task.instance {
            SelfKind::Receiver
        } else {
            SelfKind::None
        };
        self.push_body(ret.clone(), self_kind);
        let root = self.push_frame(None);
        self.cur_frame = root;

        if task.instance {
            // Slot 0 is the receiver.
            self.bodies[0].locals.push(LocalDef {
                name: String::from("self"),
                ty: Type::Named(self.type_fqn.clone()),
                boxed: false,
            });
        }
        for p in &params {
            self.declare(&p.name, p.ty.clone());
        }
        if let Some(elem) = &variadic {
            // The pack arrives as one slot; indexing into it is not
            // part of the surface language yet, so the name only
            // forwards to other variadic calls.
            self.declare("args", Type::Pack(Box::new(elem.clone())));
        }

        let body = match &task.kind {
            TaskKind::Method => self.check_stmts(&task.stmts)?,
            TaskKind::ScriptMain => {
                let mut body = self.check_stmts(&task.stmts)?;
                let ends_in_return = matches!(
                    body.last(),
                    Some(HStmt {
                        kind: HStmtKind::Return(_),
                        ..
                    })
                );
                if !ends_in_return {
                    body.push(HStmt {
                        kind: HStmtKind::Return(Some(HExpr {
                            kind: HExprKind::Int(0),
                            ty: Type::Int,
                            pos,
                        })),
                        pos,
                    });
                }
                body
            }
            TaskKind::Ctor { inits } => self.check_ctor(&params, inits, pos)?,
        };

        let state = self.bodies.pop().expect("body stack is never empty here");
        Ok((body, state.locals, self.lifted))
    }

    fn check_ctor(
        &mut self,
        params: &[ParamDef],
        inits: &[(String, Expr)],
        pos: Pos,
    ) -> Result<Vec<HStmt>, CoreError> {
        let own_ty = Type::Named(self.type_fqn.clone());
        let self_id = self.declare("self", own_ty.clone());
        self.bodies[0].self_kind = SelfKind::Slot(self_id);

        let mut body = vec![HStmt {
            kind: HStmtKind::Let {
                local: self_id,
                init: Some(HExpr {
                    kind: HExprKind::AllocRecord {
                        type_fqn: self.type_fqn.clone(),
                    },
                    ty: own_ty,
                    pos,
                }),
            },
            pos,
        }];

        // Parameter slots precede `self`; each parameter fills its
        // field. Fields of an inherited class sit before own fields
        // in the flattened layout, so lookups take the last match.
        for (pi, p) in params.iter().enumerate() {
            let index = self.own_field(&p.name);
            let target = self.receiver(p.pos).expect("constructor has a receiver");
            body.push(HStmt {
                kind: HStmtKind::Expr(HExpr {
                    kind: HExprKind::SetField {
                        target: Box::new(target),
                        type_fqn: self.type_fqn.clone(),
                        index,
                        value: Box::new(HExpr {
                            kind: HExprKind::Local(LocalId(pi as u32)),
                            ty: p.ty.clone(),
                            pos: p.pos,
                        }),
                    },
                    ty: Type::Unit,
                    pos: p.pos,
                }),
                pos: p.pos,
            });
        }

        for (name, init) in inits {
            let index = self.own_field(name);
            let field_ty = self.types[self.type_index].fields[index].ty.clone();
            let value = self.check_expr(init, Some(&field_ty))?;
            let value = self.convert_to(value, &field_ty)?;
            let init_pos = init.pos;
            let target = self.receiver(init_pos).expect("constructor has a receiver");
            body.push(HStmt {
                kind: HStmtKind::Expr(HExpr {
                    kind: HExprKind::SetField {
                        target: Box::new(target),
                        type_fqn: self.type_fqn.clone(),
                        index,
                        value: Box::new(value),
                    },
                    ty: Type::Unit,
                    pos: init_pos,
                }),
                pos: init_pos,
            });
        }

        let result = self.receiver(pos).expect("constructor has a receiver");
        body.push(HStmt {
            kind: HStmtKind::Return(Some(result)),
            pos,
        });
        Ok(body)
    }

    fn own_field(&self, name: &str) -> usize {
        self.types[self.type_index]
            .fields
            .iter()
            .rposition(|f| f.name == name)
            .expect("registration created this field")
    }

    /// Receiver expression, if the current context has one. Lambda
    /// bodies have none: a field must be copied into a local before a
    /// closure can use it.
    fn receiver(&self, pos: Pos) -> Option<HExpr> {
        if self.bodies.len() != 1 {
            return None;
        }
        let ty = Type::Named(self.type_fqn.clone());
        match self.bodies[0].self_kind {
            SelfKind::None => None,
            SelfKind::Receiver => Some(HExpr {
                kind: HExprKind::This,
                ty,
                pos,
            }),
            SelfKind::Slot(id) => Some(HExpr {
                kind: HExprKind::Local(id),
                ty,
                pos,
            }),
        }
    }

    // --------------------------------------------------------------
    // Scopes, locals and captures
    // --------------------------------------------------------------

    fn push_body(&mut self, ret: Type, self_kind: SelfKind) {
        self.bodies.push(BodyState {
            locals: Vec::new(),
            captures: Vec::new(),
            ret,
            loop_depth: 0,
            self_kind,
        });
    }

    fn push_frame(&mut self, parent: Option<usize>) -> usize {
        self.frames.push(Frame {
            parent,
            body: self.bodies.len() - 1,
            names: Vec::new(),
        });
        self.frames.len() - 1
    }

    fn declare(&mut self, name: &str, ty: Type) -> LocalId {
        let body = self.bodies.last_mut().expect("inside a body");
        let id = LocalId(body.locals.len() as u32);
        body.locals.push(LocalDef {
            name: name.to_string(),
            ty,
            boxed: self.boxed_names.contains(name),
        });
        self.frames[self.cur_frame].names.push((name.to_string(), id));
        id
    }

    /// Resolve a name through the frame chain. A hit in an enclosing
    /// body threads a capture through every lambda in between.
    fn lookup(&mut self, name: &str) -> Option<VarRef> {
        let mut frame = Some(self.cur_frame);
        let mut hit: Option<(usize, LocalId)> = None;
        while let Some(fi) = frame {
            let f = &self.frames[fi];
            if let Some(&(_, id)) = f.names.iter().rev().find(|(n, _)| n == name) {
                hit = Some((f.body, id));
                break;
            }
            frame = f.parent;
        }
        let (owner, id) = hit?;
        let cur = self.bodies.len() - 1;
        if owner == cur {
            let boxed = self.bodies[owner].locals[id.0 as usize].boxed;
            return Some(VarRef::Local { id, boxed });
        }

        let ty = self.bodies[owner].locals[id.0 as usize].ty.clone();
        let boxed = self.bodies[owner].locals[id.0 as usize].boxed;
        let mut source = CaptureSource::Local(id);
        let mut index = 0;
        for level in owner + 1..=cur {
            let captures = &mut self.bodies[level].captures;
            index = match captures.iter().position(|c| c.name == name) {
                Some(i) => i,
                None => {
                    captures.push(Capture {
                        name: name.to_string(),
                        ty: ty.clone(),
                        boxed,
                        source: source.clone(),
                    });
                    captures.len() - 1
                }
            };
            source = CaptureSource::Env(index);
        }
        Some(VarRef::Capture { index, boxed, ty })
    }

    fn read_var(&mut self, var: &VarRef, pos: Pos) -> HExpr {
        match var {
            VarRef::Local { id, boxed } => {
                let ty = self.bodies.last().expect("inside a body").locals[id.0 as usize]
                    .ty
                    .clone();
                let slot = HExpr {
                    kind: HExprKind::Local(*id),
                    ty: ty.clone(),
                    pos,
                };
                if *boxed {
                    HExpr {
                        kind: HExprKind::CellGet {
                            cell: Box::new(slot),
                        },
                        ty,
                        pos,
                    }
                } else {
                    slot
                }
            }
            VarRef::Capture { index, boxed, ty } => {
                let env = HExpr {
                    kind: HExprKind::Env { index: *index },
                    ty: ty.clone(),
                    pos,
                };
                if *boxed {
                    HExpr {
                        kind: HExprKind::CellGet {
                            cell: Box::new(env),
                        },
                        ty: ty.clone(),
                        pos,
                    }
                } else {
                    env
                }
            }
        }
    }

    fn write_var(
        &mut self,
        var: &VarRef,
        value: HExpr,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        match var {
            VarRef::Local { id, boxed } => {
                let ty = self.bodies.last().expect("inside a body").locals[id.0 as usize]
                    .ty
                    .clone();
                let value = self.convert_to(value, &ty)?;
                if *boxed {
                    Ok(HExpr {
                        kind: HExprKind::CellSet {
                            cell: Box::new(HExpr {
                                kind: HExprKind::Local(*id),
                                ty: ty.clone(),
                                pos,
                            }),
                            value: Box::new(value),
                        },
                        ty: Type::Unit,
                        pos,
                    })
                } else {
                    Ok(HExpr {
                        kind: HExprKind::SetLocal {
                            local: *id,
                            value: Box::new(value),
                        },
                        ty: Type::Unit,
                        pos,
                    })
                }
            }
            VarRef::Capture { index, boxed, ty } => {
                if !*boxed {
                    self.errs.semantic_error(
                        "cannot assign to a by-value captured variable",
                        pos,
                    )?;
                    return Ok(HExpr::unit(pos));
                }
                let value = self.convert_to(value, ty)?;
                Ok(HExpr {
                    kind: HExprKind::CellSet {
                        cell: Box::new(HExpr {
                            kind: HExprKind::Env { index: *index },
                            ty: ty.clone(),
                            pos,
                        }),
                        value: Box::new(value),
                    },
                    ty: Type::Unit,
                    pos,
                })
            }
        }
    }

    // --------------------------------------------------------------
    // Statements
    // --------------------------------------------------------------

    fn check_stmts(&mut self, stmts: &[Stmt]) -> Result<Vec<HStmt>, CoreError> {
        let parent = self.cur_frame;
        self.cur_frame = self.push_frame(Some(parent));
        let mut out = Vec::new();
        for stmt in stmts {
            if let Some(hs) = self.check_stmt(stmt)? {
                out.push(hs);
            }
        }
        self.cur_frame = parent;
        Ok(out)
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<Option<HStmt>, CoreError> {
        let pos = stmt.pos;
        let kind = match &stmt.kind {
            StmtKind::Class(_) | StmtKind::Interface(_) | StmtKind::Fn(_) => {
                self.errs
                    .semantic_error("declarations are not allowed inside a body", pos)?;
                return Ok(None);
            }
            StmtKind::Let { name, ty, init } => {
                let annotated = match ty {
                    Some(ty) => Some(self.resolve_checked(ty)?),
                    None => None,
                };
                let init = match init {
                    Some(e) => Some(self.check_expr(e, annotated.as_ref())?),
                    None => None,
                };
                let var_ty = match (&annotated, &init) {
                    (Some(t), _) => t.clone(),
                    (None, Some(e)) => e.ty.clone(),
                    (None, None) => {
                        self.errs.semantic_error(
                            format!("cannot infer a type for `{}`", name),
                            pos,
                        )?;
                        Type::Any
                    }
                };
                if var_ty == Type::Unit {
                    self.errs
                        .semantic_error(format!("`{}` cannot have type `unit`", name), pos)?;
                }
                let init = match init {
                    Some(e) => Some(self.convert_to(e, &var_ty)?),
                    None => None,
                };
                let local = self.declare(name, var_ty);
                HStmtKind::Let { local, init }
            }
            StmtKind::If {
                cond,
                then_body,
                elifs,
                else_body,
            } => self.check_if(cond, then_body, elifs, else_body.as_deref(), pos)?,
            StmtKind::While { cond, body } => {
                let cond = self.check_expr(cond, Some(&Type::Bool))?;
                let cond = self.expect_bool(cond)?;
                self.bodies.last_mut().expect("inside a body").loop_depth += 1;
                let body = self.check_stmts(body)?;
                self.bodies.last_mut().expect("inside a body").loop_depth -= 1;
                HStmtKind::While { cond, body }
            }
            StmtKind::Return(value) => {
                let ret = self.bodies.last().expect("inside a body").ret.clone();
                match (value, &ret) {
                    (None, Type::Unit) => HStmtKind::Return(None),
                    (None, _) => {
                        self.errs.semantic_error(
                            format!("this function must return `{}`", ret),
                            pos,
                        )?;
                        HStmtKind::Return(None)
                    }
                    (Some(e), Type::Unit) => {
                        let value = self.check_expr(e, None)?;
                        if value.ty != Type::Unit {
                            self.errs
                                .semantic_error("this function does not return a value", pos)?;
                        }
                        HStmtKind::Return(None)
                    }
                    (Some(e), _) => {
                        let value = self.check_expr(e, Some(&ret))?;
                        let value = self.convert_to(value, &ret)?;
                        HStmtKind::Return(Some(value))
                    }
                }
            }
            StmtKind::Break => {
                if self.bodies.last().expect("inside a body").loop_depth == 0 {
                    self.errs.semantic_error("`break` outside of a loop", pos)?;
                }
                HStmtKind::Break
            }
            StmtKind::Continue => {
                if self.bodies.last().expect("inside a body").loop_depth == 0 {
                    self.errs
                        .semantic_error("`continue` outside of a loop", pos)?;
                }
                HStmtKind::Continue
            }
            StmtKind::Expr(e) => {
                if matches!(e.kind, ExprKind::Error) {
                    // Already reported by the parser.
                    return Ok(None);
                }
                HStmtKind::Expr(self.check_expr(e, None)?)
            }
        };
        Ok(Some(HStmt { kind, pos }))
    }

    fn check_if(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        elifs: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
        pos: Pos,
    ) -> Result<HStmtKind, CoreError> {
        let cond = self.check_expr(cond, Some(&Type::Bool))?;
        let cond = self.expect_bool(cond)?;
        let then_body = self.check_stmts(then_body)?;
        // `elif` chains become nested else-if.
        let else_body = match elifs.split_first() {
            Some(((c, b), rest)) => {
                let inner = self.check_if(c, b, rest, else_body, pos)?;
                vec![HStmt { kind: inner, pos }]
            }
            None => match else_body {
                Some(stmts) => self.check_stmts(stmts)?,
                None => Vec::new(),
            },
        };
        Ok(HStmtKind::If {
            cond,
            then_body,
            else_body,
        })
    }

    // --------------------------------------------------------------
    // Expressions
    // --------------------------------------------------------------

    fn check_expr(&mut self, expr: &Expr, expect: Option<&Type>) -> Result<HExpr, CoreError> {
        let pos = expr.pos;
        match &expr.kind {
            ExprKind::Int(v) => {
                if let Some(Type::Long) = expect {
                    return Ok(HExpr {
                        kind: HExprKind::Long(*v),
                        ty: Type::Long,
                        pos,
                    });
                }
                match i32::try_from(*v) {
                    Ok(v) => Ok(HExpr {
                        kind: HExprKind::Int(v),
                        ty: Type::Int,
                        pos,
                    }),
                    Err(_) => {
                        self.errs.semantic_error(
                            "integer literal out of range; use an `L` suffix",
                            pos,
                        )?;
                        Ok(HExpr {
                            kind: HExprKind::Int(0),
                            ty: Type::Int,
                            pos,
                        })
                    }
                }
            }
            ExprKind::Long(v) => Ok(HExpr {
                kind: HExprKind::Long(*v),
                ty: Type::Long,
                pos,
            }),
            ExprKind::Float(v) => Ok(HExpr {
                kind: HExprKind::Float(*v),
                ty: Type::Float,
                pos,
            }),
            ExprKind::Double(v) => Ok(HExpr {
                kind: HExprKind::Double(*v),
                ty: Type::Double,
                pos,
            }),
            ExprKind::Bool(v) => Ok(HExpr {
                kind: HExprKind::Bool(*v),
                ty: Type::Bool,
                pos,
            }),
            ExprKind::Char(v) => Ok(HExpr {
                kind: HExprKind::Char(*v),
                ty: Type::Char,
                pos,
            }),
            ExprKind::Str(v) => Ok(HExpr {
                kind: HExprKind::Str(v.clone()),
                ty: Type::Str,
                pos,
            }),
            ExprKind::Regex(pattern) => self.check_regex(pattern, pos),
            ExprKind::Ident(name) => self.check_ident(name, pos),
            ExprKind::Unary { op, operand } => self.check_unary(*op, operand, pos),
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(*op, lhs, rhs, pos),
            ExprKind::Call { callee, args } => self.check_call(callee, args, pos),
            ExprKind::Index { target, index } => {
                let target = self.check_expr(target, None)?;
                let index = self.check_expr(index, None)?;
                self.index_call(target, vec![index], false, pos)
            }
            ExprKind::Member { target, name } => self.check_member_read(target, name, pos),
            ExprKind::Lambda { params, body } => self.check_lambda(params, body, expect, pos),
            ExprKind::Error => Ok(HExpr::unit(pos)),
        }
    }

    fn check_regex(&mut self, pattern: &str, pos: Pos) -> Result<HExpr, CoreError> {
        let Some(host) = self.universe.find("host.Regex") else {
            self.errs
                .semantic_error("regex literals need the host `Regex` type", pos)?;
            return Ok(HExpr::unit(pos));
        };
        let Some(compile) = host.overloads("compile").next() else {
            self.errs
                .semantic_error("host `Regex` type has no `compile` method", pos)?;
            return Ok(HExpr::unit(pos));
        };
        Ok(HExpr {
            kind: HExprKind::CallHost {
                type_fqn: host.fqn.clone(),
                mangled: compile.mangled_name(),
                args: vec![HExpr {
                    kind: HExprKind::Str(pattern.to_string()),
                    ty: Type::Str,
                    pos,
                }],
            },
            ty: compile.ret.clone(),
            pos,
        })
    }

    fn check_ident(&mut self, name: &str, pos: Pos) -> Result<HExpr, CoreError> {
        if let Some(var) = self.lookup(name) {
            return Ok(self.read_var(&var, pos));
        }
        if let Some((index, ty)) = self.instance_field(name) {
            let Some(target) = self.receiver(pos) else {
                let msg = if self.bodies.len() > 1 {
                    format!("field `{}` cannot be captured; copy it into a local first", name)
                } else {
                    format!("field `{}` is not reachable from static code", name)
                };
                self.errs.semantic_error(msg, pos)?;
                return Ok(HExpr::unit(pos));
            };
            return Ok(HExpr {
                kind: HExprKind::GetField {
                    target: Box::new(target),
                    type_fqn: self.type_fqn.clone(),
                    index,
                },
                ty,
                pos,
            });
        }
        if self.index.contains_key(name) || self.universe.find_simple(name).is_some() {
            self.errs.semantic_error(
                format!("type name `{}` used as a value", name),
                pos,
            )?;
        } else {
            self.errs
                .semantic_error(format!("unresolved name `{}`", name), pos)?;
        }
        Ok(HExpr::unit(pos))
    }

    /// Field of the enclosing type, by name. Whether the context can
    /// actually reach it is the caller's question, via [`Self::receiver`].
    fn instance_field(&self, name: &str) -> Option<(usize, Type)> {
        if self.bodies[0].self_kind == SelfKind::None {
            return None;
        }
        let def = &self.types[self.type_index];
        let index = def.field_index(name)?;
        Some((index, def.fields[index].ty.clone()))
    }

    fn check_unary(&mut self, op: UnOp, operand: &Expr, pos: Pos) -> Result<HExpr, CoreError> {
        let operand = self.check_expr(operand, None)?;
        let ok = match (op, &operand.ty) {
            (UnOp::Neg, t) if t.is_numeric() => true,
            (UnOp::Not, Type::Bool) => true,
            (UnOp::BitNot, t) if t.is_integer() => true,
            _ => false,
        };
        if ok {
            let ty = match (&op, &operand.ty) {
                (UnOp::Neg, Type::Char) | (UnOp::BitNot, Type::Char) => Type::Int,
                _ => operand.ty.clone(),
            };
            let operand = if operand.ty == Type::Char {
                self.convert_to(operand, &Type::Int)?
            } else {
                operand
            };
            return Ok(HExpr {
                kind: HExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                ty,
                pos,
            });
        }
        match operand.ty.clone() {
            Type::Named(fqn) => self.method_call(operand, &fqn, op.method_name(), Vec::new(), pos),
            Type::Any => self.dynamic_call(operand, op.method_name(), Vec::new(), pos),
            other => {
                self.errs.semantic_error(
                    format!("operator `{}` is not defined for `{}`", op_text(op), other),
                    pos,
                )?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        if op == BinOp::Assign {
            return self.check_assign(lhs, rhs, pos);
        }
        if matches!(op, BinOp::And | BinOp::Or) {
            let lhs = self.check_expr(lhs, Some(&Type::Bool))?;
            let lhs = self.expect_bool(lhs)?;
            let rhs = self.check_expr(rhs, Some(&Type::Bool))?;
            let rhs = self.expect_bool(rhs)?;
            return Ok(HExpr {
                kind: HExprKind::Logic {
                    and: op == BinOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: Type::Bool,
                pos,
            });
        }

        let lhs = self.check_expr(lhs, None)?;
        let rhs = self.check_expr(rhs, None)?;

        // User and host types route operators to conventional method
        // names; `p + q` is `p.add(q)`.
        if let Type::Named(fqn) = lhs.ty.clone() {
            let Some(method) = op.method_name() else {
                self.errs.semantic_error(
                    format!("operator is not defined for `{}`", lhs.ty),
                    pos,
                )?;
                return Ok(HExpr::unit(pos));
            };
            return self.method_call(lhs, &fqn, method, vec![rhs], pos);
        }
        if lhs.ty == Type::Any {
            let Some(method) = op.method_name() else {
                self.errs
                    .semantic_error("operator is not defined for `any`", pos)?;
                return Ok(HExpr::unit(pos));
            };
            return self.dynamic_call(lhs, method, vec![rhs], pos);
        }

        // String concatenation is the one built-in reference operator.
        if lhs.ty == Type::Str && rhs.ty == Type::Str && op == BinOp::Add {
            return Ok(HExpr {
                kind: HExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: Type::Str,
                pos,
            });
        }

        if matches!(op, BinOp::Eq | BinOp::Ne) && lhs.ty == Type::Bool && rhs.ty == Type::Bool {
            return Ok(HExpr {
                kind: HExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty: Type::Bool,
                pos,
            });
        }

        let Some(common) = promote(&lhs.ty, &rhs.ty) else {
            self.errs.semantic_error(
                format!("operator is not defined for `{}` and `{}`", lhs.ty, rhs.ty),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        };
        let integral = matches!(
            op,
            BinOp::Shl | BinOp::Shr | BinOp::UShr | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
        );
        if integral && !common.is_integer() {
            self.errs.semantic_error(
                format!("operator requires integer operands, found `{}`", common),
                pos,
            )?;
        }
        if op == BinOp::Rem && !common.is_integer() {
            self.errs
                .semantic_error("`%` requires integer operands", pos)?;
        }
        let lhs = self.convert_to(lhs, &common)?;
        let rhs = self.convert_to(rhs, &common)?;
        let ty = match op {
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => Type::Bool,
            _ => common,
        };
        Ok(HExpr {
            kind: HExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            pos,
        })
    }

    fn check_assign(&mut self, lhs: &Expr, rhs: &Expr, pos: Pos) -> Result<HExpr, CoreError> {
        // Assignment has type unit, so `a = b = 1` can never type-check;
        // name the actual problem instead of the unit mismatch.
        if matches!(&rhs.kind, ExprKind::Binary { op: BinOp::Assign, .. }) {
            self.errs
                .semantic_error("assignment is not an expression", rhs.pos)?;
            return Ok(HExpr::unit(pos));
        }
        match &lhs.kind {
            ExprKind::Ident(name) => {
                if let Some(var) = self.lookup(name) {
                    let ty = match &var {
                        VarRef::Local { id, .. } => self.bodies.last().expect("inside a body")
                            .locals[id.0 as usize]
                            .ty
                            .clone(),
                        VarRef::Capture { ty, .. } => ty.clone(),
                    };
                    let value = self.check_expr(rhs, Some(&ty))?;
                    return self.write_var(&var, value, pos);
                }
                if let Some((index, ty)) = self.instance_field(name) {
                    let Some(target) = self.receiver(pos) else {
                        self.errs.semantic_error(
                            format!("field `{}` cannot be assigned from here", name),
                            pos,
                        )?;
                        return Ok(HExpr::unit(pos));
                    };
                    let value = self.check_expr(rhs, Some(&ty))?;
                    let value = self.convert_to(value, &ty)?;
                    return Ok(HExpr {
                        kind: HExprKind::SetField {
                            target: Box::new(target),
                            type_fqn: self.type_fqn.clone(),
                            index,
                            value: Box::new(value),
                        },
                        ty: Type::Unit,
                        pos,
                    });
                }
                self.errs
                    .semantic_error(format!("unresolved name `{}`", name), pos)?;
                Ok(HExpr::unit(pos))
            }
            ExprKind::Member { target, name } => {
                let target = self.check_expr(target, None)?;
                match target.ty.clone() {
                    Type::Named(fqn) if !fqn.starts_with("host.") => {
                        let Some(&ti) = self.index.get(&fqn) else {
                            self.errs
                                .semantic_error(format!("unresolved type `{}`", fqn), pos)?;
                            return Ok(HExpr::unit(pos));
                        };
                        let Some(index) = self.types[ti].field_index(name) else {
                            self.errs.semantic_error(
                                format!("`{}` has no field `{}`", fqn, name),
                                pos,
                            )?;
                            return Ok(HExpr::unit(pos));
                        };
                        let ty = self.types[ti].fields[index].ty.clone();
                        if !self.guard_function_boundary(&fqn, &[ty.clone()], &Type::Unit, pos)? {
                            return Ok(HExpr::unit(pos));
                        }
                        let value = self.check_expr(rhs, Some(&ty))?;
                        let value = self.convert_to(value, &ty)?;
                        Ok(HExpr {
                            kind: HExprKind::SetField {
                                target: Box::new(target),
                                type_fqn: fqn,
                                index,
                                value: Box::new(value),
                            },
                            ty: Type::Unit,
                            pos,
                        })
                    }
                    other => {
                        self.errs.semantic_error(
                            format!("cannot assign to a field of `{}`", other),
                            pos,
                        )?;
                        Ok(HExpr::unit(pos))
                    }
                }
            }
            ExprKind::Index { target, index } => {
                let target = self.check_expr(target, None)?;
                let index = self.check_expr(index, None)?;
                let value = self.check_expr(rhs, None)?;
                self.index_call(target, vec![index, value], true, pos)
            }
            _ => {
                self.errs
                    .semantic_error("this expression cannot be assigned to", pos)?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    /// `a[i]` maps to `get`, `a[i] = v` to `set`, following the same
    /// method-name convention as the other operators.
    fn index_call(
        &mut self,
        target: HExpr,
        args: Vec<HExpr>,
        store: bool,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let method = if store { "set" } else { "get" };
        match target.ty.clone() {
            Type::Named(fqn) => self.method_call(target, &fqn, method, args, pos),
            Type::Any => self.dynamic_call(target, method, args, pos),
            other => {
                self.errs.semantic_error(
                    format!("`{}` cannot be indexed", other),
                    pos,
                )?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    fn check_member_read(
        &mut self,
        target: &Expr,
        name: &str,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        // Type-name targets only make sense as a call prefix.
        if let ExprKind::Ident(tname) = &target.kind {
            if self.lookup(tname).is_none()
                && (self.index.contains_key(tname) || self.universe.find_simple(tname).is_some())
            {
                self.errs.semantic_error(
                    format!("`{}.{}` must be called", tname, name),
                    pos,
                )?;
                return Ok(HExpr::unit(pos));
            }
        }
        let target = self.check_expr(target, None)?;
        match target.ty.clone() {
            Type::Named(fqn) if !fqn.starts_with("host.") => {
                let Some(&ti) = self.index.get(&fqn) else {
                    self.errs
                        .semantic_error(format!("unresolved type `{}`", fqn), pos)?;
                    return Ok(HExpr::unit(pos));
                };
                let Some(index) = self.types[ti].field_index(name) else {
                    self.errs
                        .semantic_error(format!("`{}` has no field `{}`", fqn, name), pos)?;
                    return Ok(HExpr::unit(pos));
                };
                let ty = self.types[ti].fields[index].ty.clone();
                if !self.guard_function_boundary(&fqn, &[], &ty, pos)? {
                    return Ok(HExpr::unit(pos));
                }
                Ok(HExpr {
                    kind: HExprKind::GetField {
                        target: Box::new(target),
                        type_fqn: fqn,
                        index,
                    },
                    ty,
                    pos,
                })
            }
            other => {
                self.errs.semantic_error(
                    format!("`{}` has no accessible fields", other),
                    pos,
                )?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    // --------------------------------------------------------------
    // Calls
    // --------------------------------------------------------------

    fn check_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        match &callee.kind {
            ExprKind::Ident(name) => {
                // Local function values shadow everything else.
                if let Some(var) = self.lookup(name) {
                    let target = self.read_var(&var, pos);
                    return self.closure_call(target, args, pos);
                }
                // Constructor call.
                if let Some(&ti) = self.index.get(name) {
                    return self.ctor_call(ti, args, pos);
                }
                // Method of the enclosing type.
                if self.own_method_exists(name) {
                    return self.own_call(name, args, pos);
                }
                self.errs
                    .semantic_error(format!("unresolved function `{}`", name), pos)?;
                Ok(HExpr::unit(pos))
            }
            ExprKind::Member { target, name } => {
                if let ExprKind::Ident(tname) = &target.kind {
                    if self.lookup(tname).is_none() {
                        if let Some(host) = self.universe.find_simple(tname) {
                            let fqn = host.fqn.clone();
                            return self.host_static_call(&fqn, name, args, pos);
                        }
                        if let Some(&ti) = self.index.get(tname.as_str()) {
                            return self.static_call(ti, name, args, pos);
                        }
                    }
                }
                let target = self.check_expr(target, None)?;
                match target.ty.clone() {
                    Type::Named(fqn) => {
                        let args = self.check_args(args)?;
                        self.method_call(target, &fqn, name, args, pos)
                    }
                    Type::Any => {
                        let args = self.check_args(args)?;
                        self.dynamic_call(target, name, args, pos)
                    }
                    other => {
                        self.errs.semantic_error(
                            format!("`{}` has no methods", other),
                            pos,
                        )?;
                        Ok(HExpr::unit(pos))
                    }
                }
            }
            _ => {
                let target = self.check_expr(callee, None)?;
                self.closure_call(target, args, pos)
            }
        }
    }

    fn check_args(&mut self, args: &[Expr]) -> Result<Vec<HExpr>, CoreError> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            out.push(self.check_expr(a, None)?);
        }
        Ok(out)
    }

    /// Check arguments against a single known signature so that
    /// unannotated lambda arguments can take their parameter types
    /// from it.
    fn check_args_with(&mut self, args: &[Expr], sig: &Sig) -> Result<Vec<HExpr>, CoreError> {
        let mut out = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            let expect = sig
                .params
                .get(i)
                .or(if i >= sig.params.len() { sig.variadic.as_ref() } else { None });
            out.push(self.check_expr(a, expect)?);
        }
        Ok(out)
    }

    fn closure_call(
        &mut self,
        target: HExpr,
        args: &[Expr],
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let Type::Function { params, ret } = target.ty.clone() else {
            self.errs.semantic_error(
                format!("`{}` is not callable", target.ty),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        };
        if args.len() != params.len() {
            self.errs.semantic_error(
                format!("expected {} arguments, found {}", params.len(), args.len()),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        }
        let mut checked = Vec::with_capacity(args.len());
        for (a, p) in args.iter().zip(&params) {
            let v = self.check_expr(a, Some(p))?;
            checked.push(self.convert_to(v, p)?);
        }
        Ok(HExpr {
            kind: HExprKind::CallClosure {
                target: Box::new(target),
                args: checked,
            },
            ty: *ret,
            pos,
        })
    }

    /// Function values are module-local: the funcref table backing
    /// `call_indirect` belongs to the module that created the closure,
    /// so a signature carrying one must not cross into another type or
    /// into the host. Returns `false` after reporting the violation.
    fn guard_function_boundary(
        &mut self,
        callee_fqn: &str,
        params: &[Type],
        ret: &Type,
        pos: Pos,
    ) -> Result<bool, CoreError> {
        if callee_fqn == self.type_fqn {
            return Ok(true);
        }
        let carries = params
            .iter()
            .chain(std::iter::once(ret))
            .any(|t| matches!(t, Type::Function { .. }));
        if !carries {
            return Ok(true);
        }
        self.errs.semantic_error(
            format!(
                "a function value cannot cross the boundary of `{}`",
                callee_fqn
            ),
            pos,
        )?;
        Ok(false)
    }

    fn ctor_call(&mut self, ti: usize, args: &[Expr], pos: Pos) -> Result<HExpr, CoreError> {
        if self.types[ti].kind == TypeDefKind::Interface {
            self.errs.semantic_error(
                format!("interface `{}` cannot be constructed", self.types[ti].fqn),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        }
        let fqn = self.types[ti].fqn.clone();
        let ctor = self.types[ti]
            .methods
            .iter()
            .find(|m| m.name == "new")
            .cloned();
        let Some(ctor) = ctor else {
            self.errs.semantic_error(
                format!("`{}` has no constructor", fqn),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        };
        let sig = Sig {
            params: ctor.params.iter().map(|p| p.ty.clone()).collect(),
            variadic: None,
        };
        if !self.guard_function_boundary(&fqn, &sig.params, &Type::Named(fqn.clone()), pos)? {
            return Ok(HExpr::unit(pos));
        }
        let args = self.check_args_with(args, &sig)?;
        let Some(args) = self.finish_args(args, &sig, pos)? else {
            return Ok(HExpr::unit(pos));
        };
        Ok(HExpr {
            kind: HExprKind::New {
                type_fqn: fqn.clone(),
                args,
            },
            ty: Type::Named(fqn),
            pos,
        })
    }

    fn own_method_exists(&self, name: &str) -> bool {
        let mut chain = MethodChain {
            types: self.types,
            index: self.index,
            next: Some(self.type_index),
        };
        chain.any(|ti| {
            self.types[ti]
                .methods
                .iter()
                .any(|m| m.name == name && !m.is_lambda && m.name != "new")
        })
    }

    /// Bare-name call: a method of the enclosing type, static or
    /// instance depending on what resolves.
    fn own_call(&mut self, name: &str, args: &[Expr], pos: Pos) -> Result<HExpr, CoreError> {
        let cands = self.collect_candidates(self.type_index, name, None);
        let (def_fqn, method, args) = match self.pick(&cands, args, name, pos)? {
            Some(r) => r,
            None => return Ok(HExpr::unit(pos)),
        };
        // Inherited methods live in the supertype's module.
        let mut tys: Vec<Type> = method.params.iter().map(|p| p.ty.clone()).collect();
        tys.extend(method.variadic.clone());
        if !self.guard_function_boundary(&def_fqn, &tys, &method.ret, pos)? {
            return Ok(HExpr::unit(pos));
        }
        if method.is_static {
            Ok(HExpr {
                kind: HExprKind::CallMethod {
                    target: None,
                    type_fqn: def_fqn,
                    mangled: method.mangled,
                    args,
                },
                ty: method.ret,
                pos,
            })
        } else {
            let Some(target) = self.receiver(pos) else {
                self.errs.semantic_error(
                    format!("instance method `{}` needs a receiver", name),
                    pos,
                )?;
                return Ok(HExpr::unit(pos));
            };
            Ok(HExpr {
                kind: HExprKind::CallMethod {
                    target: Some(Box::new(target)),
                    type_fqn: def_fqn,
                    mangled: method.mangled,
                    args,
                },
                ty: method.ret,
                pos,
            })
        }
    }

    fn static_call(
        &mut self,
        ti: usize,
        name: &str,
        args: &[Expr],
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let cands = self.collect_candidates(ti, name, Some(true));
        let (def_fqn, method, args) = match self.pick(&cands, args, name, pos)? {
            Some(r) => r,
            None => return Ok(HExpr::unit(pos)),
        };
        let mut tys: Vec<Type> = method.params.iter().map(|p| p.ty.clone()).collect();
        tys.extend(method.variadic.clone());
        if !self.guard_function_boundary(&def_fqn, &tys, &method.ret, pos)? {
            return Ok(HExpr::unit(pos));
        }
        Ok(HExpr {
            kind: HExprKind::CallMethod {
                target: None,
                type_fqn: def_fqn,
                mangled: method.mangled,
                args,
            },
            ty: method.ret,
            pos,
        })
    }

    fn method_call(
        &mut self,
        target: HExpr,
        fqn: &str,
        name: &str,
        args: Vec<HExpr>,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        if fqn.starts_with("host.") {
            return self.host_receiver_call(target, fqn, name, args, pos);
        }
        let Some(&ti) = self.index.get(fqn) else {
            self.errs
                .semantic_error(format!("unresolved type `{}`", fqn), pos)?;
            return Ok(HExpr::unit(pos));
        };
        // Interface receivers go through the dispatch table; the
        // concrete implementor decides the call target.
        if self.types[ti].kind == TypeDefKind::Interface {
            return self.dynamic_call(target, name, args, pos);
        }
        let cands = self.collect_candidates(ti, name, Some(false));
        let (def_fqn, method, args) =
            match self.pick_checked(&cands, args, name, pos)? {
                Some(r) => r,
                None => return Ok(HExpr::unit(pos)),
            };
        let mut tys: Vec<Type> = method.params.iter().map(|p| p.ty.clone()).collect();
        tys.extend(method.variadic.clone());
        if !self.guard_function_boundary(&def_fqn, &tys, &method.ret, pos)? {
            return Ok(HExpr::unit(pos));
        }
        Ok(HExpr {
            kind: HExprKind::CallMethod {
                target: Some(Box::new(target)),
                type_fqn: def_fqn,
                mangled: method.mangled,
                args,
            },
            ty: method.ret,
            pos,
        })
    }

    fn host_static_call(
        &mut self,
        fqn: &str,
        name: &str,
        args: &[Expr],
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let Some(host) = self.universe.find(fqn) else {
            return Err(CoreError::Internal(format!(
                "host type `{}` vanished from the universe",
                fqn
            )));
        };
        let overloads: Vec<_> = host.overloads(name).cloned().collect();
        if overloads.is_empty() {
            self.errs.semantic_error(
                format!("`{}` has no method `{}`", fqn, name),
                pos,
            )?;
            return Ok(HExpr::unit(pos));
        }
        let sigs: Vec<Sig> = overloads
            .iter()
            .map(|m| Sig {
                params: m.params.clone(),
                variadic: m.variadic.clone(),
            })
            .collect();
        let args = if sigs.len() == 1 {
            self.check_args_with(args, &sigs[0])?
        } else {
            self.check_args(args)?
        };
        let arg_tys: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
        match select(&sigs, &arg_tys) {
            Selection::Chosen(i) => {
                let mut tys = sigs[i].params.clone();
                tys.extend(sigs[i].variadic.clone());
                if !self.guard_function_boundary(fqn, &tys, &overloads[i].ret, pos)? {
                    return Ok(HExpr::unit(pos));
                }
                let Some(args) = self.finish_args(args, &sigs[i], pos)? else {
                    return Ok(HExpr::unit(pos));
                };
                Ok(HExpr {
                    kind: HExprKind::CallHost {
                        type_fqn: fqn.to_string(),
                        mangled: overloads[i].mangled_name(),
                        args,
                    },
                    ty: overloads[i].ret.clone(),
                    pos,
                })
            }
            Selection::NoMatch => {
                self.no_match_error(name, &arg_tys, pos)?;
                Ok(HExpr::unit(pos))
            }
            Selection::Ambiguous(_) => {
                self.ambiguous_error(name, &arg_tys, pos)?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    /// Receiver-style sugar on host types: `r.test(s)` resolves among
    /// host methods whose first parameter accepts the receiver.
    fn host_receiver_call(
        &mut self,
        target: HExpr,
        fqn: &str,
        name: &str,
        args: Vec<HExpr>,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let mut full = vec![target];
        full.extend(args);
        let candidates: Vec<(String, crate::host::HostMethod)> = self
            .universe
            .types()
            .iter()
            .flat_map(|t| t.overloads(name).map(move |m| (t.fqn.clone(), m.clone())))
            .filter(|(_, m)| {
                matches!(m.params.first(), Some(Type::Named(recv)) if recv == fqn)
            })
            .collect();
        let sigs: Vec<Sig> = candidates
            .iter()
            .map(|(_, m)| Sig {
                params: m.params.clone(),
                variadic: m.variadic.clone(),
            })
            .collect();
        let arg_tys: Vec<Type> = full.iter().map(|a| a.ty.clone()).collect();
        match select(&sigs, &arg_tys) {
            Selection::Chosen(i) => {
                let mut tys = sigs[i].params.clone();
                tys.extend(sigs[i].variadic.clone());
                if !self.guard_function_boundary(
                    &candidates[i].0,
                    &tys,
                    &candidates[i].1.ret,
                    pos,
                )? {
                    return Ok(HExpr::unit(pos));
                }
                let Some(args) = self.finish_args(full, &sigs[i], pos)? else {
                    return Ok(HExpr::unit(pos));
                };
                Ok(HExpr {
                    kind: HExprKind::CallHost {
                        type_fqn: candidates[i].0.clone(),
                        mangled: candidates[i].1.mangled_name(),
                        args,
                    },
                    ty: candidates[i].1.ret.clone(),
                    pos,
                })
            }
            Selection::NoMatch => {
                self.no_match_error(name, &arg_tys, pos)?;
                Ok(HExpr::unit(pos))
            }
            Selection::Ambiguous(_) => {
                self.ambiguous_error(name, &arg_tys, pos)?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    /// Name+arity dispatch on an `any` receiver through the table
    /// built during pass 1. A unique candidate binds statically.
    fn dynamic_call(
        &mut self,
        target: HExpr,
        name: &str,
        args: Vec<HExpr>,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let empty = Vec::new();
        let targets = self.dispatch.get(name).unwrap_or(&empty);
        let matching: Vec<&DynTarget> = targets
            .iter()
            .filter(|t| match &t.variadic {
                None => t.params.len() == args.len(),
                Some(_) => args.len() >= t.params.len(),
            })
            .collect();
        match matching.as_slice() {
            [] => {
                self.errs.semantic_error(
                    format!(
                        "no method `{}` with {} argument(s) is known for a dynamic call",
                        name,
                        args.len()
                    ),
                    pos,
                )?;
                Ok(HExpr::unit(pos))
            }
            [one] => {
                let one = (*one).clone();
                let mut tys = one.params.clone();
                tys.extend(one.variadic.clone());
                if !self.guard_function_boundary(&one.fqn, &tys, &one.ret, pos)? {
                    return Ok(HExpr::unit(pos));
                }
                // An `any` holds a box that must be opened; an
                // interface-typed value already is the object itself.
                let recv = if target.ty == Type::Any {
                    HExpr {
                        kind: HExprKind::UnboxAny {
                            value: Box::new(target),
                        },
                        ty: one.recv.clone(),
                        pos,
                    }
                } else {
                    HExpr {
                        ty: one.recv.clone(),
                        ..target
                    }
                };
                let sig = Sig {
                    params: one.params.clone(),
                    variadic: one.variadic.clone(),
                };
                let mut converted = Vec::with_capacity(args.len());
                for (i, a) in args.into_iter().enumerate() {
                    let to = sig.params.get(i).unwrap_or_else(|| {
                        sig.variadic.as_ref().expect("arity was checked above")
                    });
                    if conversion_rank(&a.ty, to).is_none() {
                        self.errs.semantic_error(
                            format!("expected `{}`, found `{}`", to, a.ty),
                            a.pos,
                        )?;
                        return Ok(HExpr::unit(pos));
                    }
                    converted.push(a);
                }
                let Some(mut final_args) = self.finish_args(converted, &sig, pos)? else {
                    return Ok(HExpr::unit(pos));
                };
                if one.host {
                    let mut full = vec![recv];
                    full.append(&mut final_args);
                    Ok(HExpr {
                        kind: HExprKind::CallHost {
                            type_fqn: one.fqn,
                            mangled: one.mangled,
                            args: full,
                        },
                        ty: one.ret,
                        pos,
                    })
                } else {
                    Ok(HExpr {
                        kind: HExprKind::CallMethod {
                            target: Some(Box::new(recv)),
                            type_fqn: one.fqn,
                            mangled: one.mangled,
                            args: final_args,
                        },
                        ty: one.ret,
                        pos,
                    })
                }
            }
            _ => {
                self.errs.semantic_error(
                    format!(
                        "ambiguous dynamic call `{}` with {} argument(s)",
                        name,
                        args.len()
                    ),
                    pos,
                )?;
                Ok(HExpr::unit(pos))
            }
        }
    }

    /// Candidates for `name` on type `ti` and its class chain, in
    /// declaration order, overridden signatures shadowed.
    fn collect_candidates(
        &self,
        ti: usize,
        name: &str,
        want_static: Option<bool>,
    ) -> Vec<(String, MethodDef)> {
        let mut out: Vec<(String, MethodDef)> = Vec::new();
        let mut seen = HashSet::new();
        let chain = MethodChain {
            types: self.types,
            index: self.index,
            next: Some(ti),
        };
        for ci in chain {
            for m in &self.types[ci].methods {
                if m.name != name || m.is_lambda || m.name == "new" {
                    continue;
                }
                if let Some(want) = want_static {
                    if m.is_static != want {
                        continue;
                    }
                }
                if seen.insert(m.mangled.clone()) {
                    out.push((self.types[ci].fqn.clone(), m.clone()));
                }
            }
        }
        out
    }

    fn pick(
        &mut self,
        cands: &[(String, MethodDef)],
        args: &[Expr],
        name: &str,
        pos: Pos,
    ) -> Result<Option<(String, MethodDef, Vec<HExpr>)>, CoreError> {
        let sigs: Vec<Sig> = cands
            .iter()
            .map(|(_, m)| Sig {
                params: m.params.iter().map(|p| p.ty.clone()).collect(),
                variadic: m.variadic.clone(),
            })
            .collect();
        let checked = if sigs.len() == 1 {
            self.check_args_with(args, &sigs[0])?
        } else {
            self.check_args(args)?
        };
        self.pick_from(cands, &sigs, checked, name, pos)
    }

    fn pick_checked(
        &mut self,
        cands: &[(String, MethodDef)],
        args: Vec<HExpr>,
        name: &str,
        pos: Pos,
    ) -> Result<Option<(String, MethodDef, Vec<HExpr>)>, CoreError> {
        let sigs: Vec<Sig> = cands
            .iter()
            .map(|(_, m)| Sig {
                params: m.params.iter().map(|p| p.ty.clone()).collect(),
                variadic: m.variadic.clone(),
            })
            .collect();
        self.pick_from(cands, &sigs, args, name, pos)
    }

    fn pick_from(
        &mut self,
        cands: &[(String, MethodDef)],
        sigs: &[Sig],
        args: Vec<HExpr>,
        name: &str,
        pos: Pos,
    ) -> Result<Option<(String, MethodDef, Vec<HExpr>)>, CoreError> {
        let arg_tys: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
        match select(sigs, &arg_tys) {
            Selection::Chosen(i) => {
                let Some(args) = self.finish_args(args, &sigs[i], pos)? else {
                    return Ok(None);
                };
                Ok(Some((cands[i].0.clone(), cands[i].1.clone(), args)))
            }
            Selection::NoMatch => {
                self.no_match_error(name, &arg_tys, pos)?;
                Ok(None)
            }
            Selection::Ambiguous(_) => {
                self.ambiguous_error(name, &arg_tys, pos)?;
                Ok(None)
            }
        }
    }

    /// Apply the chosen signature: convert fixed arguments, collect
    /// the variadic tail into a pack.
    fn finish_args(
        &mut self,
        args: Vec<HExpr>,
        sig: &Sig,
        pos: Pos,
    ) -> Result<Option<Vec<HExpr>>, CoreError> {
        let mut out = Vec::with_capacity(sig.params.len() + 1);
        let mut iter = args.into_iter();
        for p in &sig.params {
            let Some(a) = iter.next() else {
                self.errs.semantic_error("too few arguments", pos)?;
                return Ok(None);
            };
            out.push(self.convert_to(a, p)?);
        }
        match &sig.variadic {
            None => {
                if iter.next().is_some() {
                    self.errs.semantic_error("too many arguments", pos)?;
                    return Ok(None);
                }
            }
            Some(elem) => {
                let mut tail = Vec::new();
                for a in iter {
                    tail.push(self.convert_to(a, elem)?);
                }
                out.push(HExpr {
                    kind: HExprKind::MakePack {
                        elem: elem.clone(),
                        args: tail,
                    },
                    ty: Type::Pack(Box::new(elem.clone())),
                    pos,
                });
            }
        }
        Ok(Some(out))
    }

    fn no_match_error(&mut self, name: &str, args: &[Type], pos: Pos) -> Result<(), CoreError> {
        let shown: Vec<String> = args.iter().map(|t| t.to_string()).collect();
        self.errs.semantic_error(
            format!("no overload of `{}` accepts ({})", name, shown.join(", ")),
            pos,
        )
    }

    fn ambiguous_error(&mut self, name: &str, args: &[Type], pos: Pos) -> Result<(), CoreError> {
        let shown: Vec<String> = args.iter().map(|t| t.to_string()).collect();
        self.errs.semantic_error(
            format!("ambiguous call to `{}` with ({})", name, shown.join(", ")),
            pos,
        )
    }

    // --------------------------------------------------------------
    // Lambdas
    // --------------------------------------------------------------

    fn check_lambda(
        &mut self,
        params: &[Param],
        body: &[Stmt],
        expect: Option<&Type>,
        pos: Pos,
    ) -> Result<HExpr, CoreError> {
        let target = match expect {
            Some(Type::Function { params, ret }) => Some((params.clone(), (**ret).clone())),
            _ => None,
        };
        if let Some((tp, _)) = &target {
            if tp.len() != params.len() {
                self.errs.semantic_error(
                    format!(
                        "lambda takes {} parameter(s) but the target type has {}",
                        params.len(),
                        tp.len()
                    ),
                    pos,
                )?;
            }
        }

        let mut param_defs = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            if p.variadic {
                self.errs
                    .semantic_error("lambda parameters cannot be variadic", p.pos)?;
            }
            let ty = match (&p.ty, &target) {
                (Some(ty), _) => self.resolve_checked(ty)?,
                (None, Some((tp, _))) if i < tp.len() => tp[i].clone(),
                (None, _) => {
                    self.errs.semantic_error(
                        format!("lambda parameter `{}` needs a type", p.name),
                        p.pos,
                    )?;
                    Type::Any
                }
            };
            param_defs.push(ParamDef {
                name: p.name.clone(),
                ty,
                pos: p.pos,
            });
        }

        // Result type: from the target type when known, otherwise
        // inferred from the first `return` in the body.
        let ret = match &target {
            Some((_, r)) => r.clone(),
            None => infer_lambda_ret(self, body, &param_defs)?,
        };

        let saved_frame = self.cur_frame;
        self.push_body(ret.clone(), SelfKind::None);
        self.cur_frame = self.push_frame(Some(saved_frame));
        for p in &param_defs {
            self.declare(&p.name, p.ty.clone());
        }
        let hbody = self.check_stmts(body)?;
        let state = self.bodies.pop().expect("lambda body was pushed");
        self.cur_frame = saved_frame;

        let index = *self.lambda_counter;
        *self.lambda_counter += 1;
        let name = format!("lambda${}", index);
        let param_tys: Vec<Type> = param_defs.iter().map(|p| p.ty.clone()).collect();
        let mangled = mangle(&name, &param_tys, None);
        self.lifted.push(MethodDef {
            name,
            mangled: mangled.clone(),
            params: param_defs,
            variadic: None,
            ret: ret.clone(),
            is_static: true,
            body: Some(hbody),
            locals: state.locals,
            is_lambda: true,
            pos,
        });

        let captures = state
            .captures
            .iter()
            .map(|c| {
                // A boxed capture travels as its cell pointer, not as
                // the value; `any` carries a raw pointer slot.
                let ty = if c.boxed { Type::Any } else { c.ty.clone() };
                match &c.source {
                    CaptureSource::Local(id) => HExpr {
                        kind: HExprKind::Local(*id),
                        ty,
                        pos,
                    },
                    CaptureSource::Env(i) => HExpr {
                        kind: HExprKind::Env { index: *i },
                        ty,
                        pos,
                    },
                }
            })
            .collect();
        Ok(HExpr {
            kind: HExprKind::MakeClosure {
                type_fqn: self.type_fqn.clone(),
                mangled,
                captures,
            },
            ty: Type::Function {
                params: param_tys,
                ret: Box::new(ret),
            },
            pos,
        })
    }

    // --------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------

    fn resolve_checked(&mut self, ty: &TypeRef) -> Result<Type, CoreError> {
        // Pass 2 runs with the registry complete, so resolution is
        // direct and misses are immediate errors.
        match &ty.kind {
            TypeRefKind::Name(name) => {
                if let Some(prim) = Type::from_name(name) {
                    return Ok(prim);
                }
                if self.index.contains_key(name.as_str()) {
                    return Ok(Type::Named(name.clone()));
                }
                if let Some(host) = self.universe.find_simple(name) {
                    return Ok(Type::Named(host.fqn.clone()));
                }
                self.errs
                    .semantic_error(format!("unresolved type name `{}`", name), ty.pos)?;
                Ok(Type::Any)
            }
            TypeRefKind::Fn { params, ret } => {
                let mut ps = Vec::new();
                for p in params {
                    ps.push(self.resolve_checked(p)?);
                }
                let ret = match ret {
                    Some(r) => self.resolve_checked(r)?,
                    None => Type::Unit,
                };
                Ok(Type::Function {
                    params: ps,
                    ret: Box::new(ret),
                })
            }
        }
    }

    fn convert_to(&mut self, expr: HExpr, to: &Type) -> Result<HExpr, CoreError> {
        let pos = expr.pos;
        match conversion_rank(&expr.ty, to) {
            Some(Rank::Exact) => Ok(expr),
            Some(Rank::Widening) => Ok(HExpr {
                kind: HExprKind::Convert {
                    value: Box::new(expr),
                },
                ty: to.clone(),
                pos,
            }),
            Some(_) => Ok(HExpr {
                kind: HExprKind::BoxAny {
                    value: Box::new(expr),
                },
                ty: Type::Any,
                pos,
            }),
            None => {
                self.errs.semantic_error(
                    format!("expected `{}`, found `{}`", to, expr.ty),
                    pos,
                )?;
                Ok(HExpr {
                    kind: expr.kind,
                    ty: to.clone(),
                    pos,
                })
            }
        }
    }

    fn expect_bool(&mut self, expr: HExpr) -> Result<HExpr, CoreError> {
        if expr.ty != Type::Bool {
            self.errs.semantic_error(
                format!("expected `bool`, found `{}`", expr.ty),
                expr.pos,
            )?;
        }
        Ok(expr)
    }
}

/// Result type of an unannotated lambda: the first `return` with a
/// value decides, a body without one is `unit`. The probe resolves
/// only the returned expression's type, against the lambda's own
/// parameters.
fn infer_lambda_ret(
    checker: &mut BodyChecker<'_>,
    body: &[Stmt],
    params: &[ParamDef],
) -> Result<Type, CoreError> {
    fn first_return(stmts: &[Stmt]) -> Option<Option<&Expr>> {
        for s in stmts {
            match &s.kind {
                StmtKind::Return(v) => return Some(v.as_ref()),
                StmtKind::If {
                    then_body,
                    elifs,
                    else_body,
                    ..
                } => {
                    if let Some(r) = first_return(then_body) {
                        return Some(r);
                    }
                    for (_, b) in elifs {
                        if let Some(r) = first_return(b) {
                            return Some(r);
                        }
                    }
                    if let Some(b) = else_body {
                        if let Some(r) = first_return(b) {
                            return Some(r);
                        }
                    }
                }
                StmtKind::While { body, .. } => {
                    if let Some(r) = first_return(body) {
                        return Some(r);
                    }
                }
                _ => {}
            }
        }
        None
    }

    match first_return(body) {
        None | Some(None) => Ok(Type::Unit),
        Some(Some(expr)) => {
            // Probe in a throwaway body with a scratch error manager;
            // the real pass re-checks the same expression and reports
            // anything wrong exactly once.
            let saved_frame = checker.cur_frame;
            let saved_lifted = checker.lifted.len();
            let saved_counter = *checker.lambda_counter;
            let mut scratch = ErrorManager::new(false);
            std::mem::swap(checker.errs, &mut scratch);

            checker.push_body(Type::Unit, SelfKind::None);
            checker.cur_frame = checker.push_frame(Some(saved_frame));
            for p in params {
                checker.declare(&p.name, p.ty.clone());
            }
            let probed = checker.check_expr(expr, None);

            checker.bodies.pop();
            checker.cur_frame = saved_frame;
            checker.lifted.truncate(saved_lifted);
            *checker.lambda_counter = saved_counter;
            std::mem::swap(checker.errs, &mut scratch);
            Ok(probed?.ty)
        }
    }
}

fn op_text(op: UnOp) -> &'static str {
    match op {
        UnOp::Neg => "-",
        UnOp::Not => "!",
        UnOp::BitNot => "~",
    }
}

// ------------------------------------------------------------------
// Syntactic prepass for the capture analysis
// ------------------------------------------------------------------

fn collect_assigned(stmts: &[Stmt], out: &mut HashSet<String>) {
    for s in stmts {
        match &s.kind {
            StmtKind::Let { init, .. } => {
                if let Some(e) = init {
                    collect_assigned_expr(e, out);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                elifs,
                else_body,
            } => {
                collect_assigned_expr(cond, out);
                collect_assigned(then_body, out);
                for (c, b) in elifs {
                    collect_assigned_expr(c, out);
                    collect_assigned(b, out);
                }
                if let Some(b) = else_body {
                    collect_assigned(b, out);
                }
            }
            StmtKind::While { cond, body } => {
                collect_assigned_expr(cond, out);
                collect_assigned(body, out);
            }
            StmtKind::Return(Some(e)) | StmtKind::Expr(e) => collect_assigned_expr(e, out),
            _ => {}
        }
    }
}

fn collect_assigned_expr(expr: &Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Binary { op, lhs, rhs } => {
            if *op == BinOp::Assign {
                if let ExprKind::Ident(name) = &lhs.kind {
                    out.insert(name.clone());
                }
            }
            collect_assigned_expr(lhs, out);
            collect_assigned_expr(rhs, out);
        }
        ExprKind::Unary { operand, .. } => collect_assigned_expr(operand, out),
        ExprKind::Call { callee, args } => {
            collect_assigned_expr(callee, out);
            for a in args {
                collect_assigned_expr(a, out);
            }
        }
        ExprKind::Index { target, index } => {
            collect_assigned_expr(target, out);
            collect_assigned_expr(index, out);
        }
        ExprKind::Member { target, .. } => collect_assigned_expr(target, out),
        ExprKind::Lambda { body, .. } => collect_assigned(body, out),
        _ => {}
    }
}

fn collect_lambda_idents(stmts: &[Stmt], in_lambda: bool, out: &mut HashSet<String>) {
    for s in stmts {
        match &s.kind {
            StmtKind::Let { init, .. } => {
                if let Some(e) = init {
                    collect_lambda_idents_expr(e, in_lambda, out);
                }
            }
            StmtKind::If {
                cond,
                then_body,
                elifs,
                else_body,
            } => {
                collect_lambda_idents_expr(cond, in_lambda, out);
                collect_lambda_idents(then_body, in_lambda, out);
                for (c, b) in elifs {
                    collect_lambda_idents_expr(c, in_lambda, out);
                    collect_lambda_idents(b, in_lambda, out);
                }
                if let Some(b) = else_body {
                    collect_lambda_idents(b, in_lambda, out);
                }
            }
            StmtKind::While { cond, body } => {
                collect_lambda_idents_expr(cond, in_lambda, out);
                collect_lambda_idents(body, in_lambda, out);
            }
            StmtKind::Return(Some(e)) | StmtKind::Expr(e) => {
                collect_lambda_idents_expr(e, in_lambda, out)
            }
            _ => {}
        }
    }
}

fn collect_lambda_idents_expr(expr: &Expr, in_lambda: bool, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::Ident(name) => {
            if in_lambda {
                out.insert(name.clone());
            }
        }
        ExprKind::Unary { operand, .. } => collect_lambda_idents_expr(operand, in_lambda, out),
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_lambda_idents_expr(lhs, in_lambda, out);
            collect_lambda_idents_expr(rhs, in_lambda, out);
        }
        ExprKind::Call { callee, args } => {
            collect_lambda_idents_expr(callee, in_lambda, out);
            for a in args {
                collect_lambda_idents_expr(a, in_lambda, out);
            }
        }
        ExprKind::Index { target, index } => {
            collect_lambda_idents_expr(target, in_lambda, out);
            collect_lambda_idents_expr(index, in_lambda, out);
        }
        ExprKind::Member { target, .. } => collect_lambda_idents_expr(target, in_lambda, out),
        ExprKind::Lambda { body, .. } => collect_lambda_idents(body, true, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::default_universe;
    use crate::lexer::{scan, ScanConfig};
    use crate::parser::parse;

    fn analyze_src(source: &str) -> (HProgram, ErrorManager) {
        let mut errs = ErrorManager::new(false);
        let tokens = scan(0, source, &ScanConfig::default(), &mut errs).expect("scan");
        let stmts = parse(&tokens, &mut errs).expect("parse");
        assert!(
            !errs.has_errors(),
            "source must parse cleanly: {:?}",
            errs.diagnostics()
        );
        let program = analyze(
            vec![SourceAst {
                script_name: String::from("Main"),
                stmts,
            }],
            &default_universe(),
            &mut errs,
        )
        .expect("analyze");
        (program, errs)
    }

    fn analyze_ok(source: &str) -> HProgram {
        let (program, errs) = analyze_src(source);
        assert!(
            !errs.has_errors(),
            "unexpected errors: {:?}",
            errs.diagnostics()
        );
        program
    }

    fn reports(source: &str, fragment: &str) {
        let (_, errs) = analyze_src(source);
        assert!(
            errs.diagnostics()
                .iter()
                .any(|d| d.message.contains(fragment)),
            "expected a diagnostic mentioning {:?}, got {:?}",
            fragment,
            errs.diagnostics()
        );
    }

    fn type_def<'a>(program: &'a HProgram, fqn: &str) -> &'a TypeDef {
        program
            .types
            .iter()
            .find(|t| t.fqn == fqn)
            .expect("type is registered")
    }

    fn main_method(program: &HProgram) -> &MethodDef {
        type_def(program, "Main")
            .methods
            .iter()
            .find(|m| m.name == "main")
            .expect("script entry point")
    }

    fn main_body(program: &HProgram) -> &[HStmt] {
        main_method(program).body.as_deref().expect("checked body")
    }

    fn call_in(stmt: &HStmt) -> &HExprKind {
        let HStmtKind::Expr(e) = &stmt.kind else {
            panic!("expected an expression statement, got {:?}", stmt.kind);
        };
        &e.kind
    }

    #[test]
    fn script_entry_falls_off_the_end_returning_zero() {
        let program = analyze_ok("let x = 1\n");
        let body = main_body(&program);
        let main = main_method(&program);
        assert_eq!(main.ret, Type::Int);
        assert!(main.is_static);
        assert!(matches!(
            body.last().map(|s| &s.kind),
            Some(HStmtKind::Return(Some(HExpr {
                kind: HExprKind::Int(0),
                ..
            })))
        ));
    }

    #[test]
    fn constructor_parameters_become_fields() {
        let program = analyze_ok("class Point(x: int, y: int)\n");
        let point = type_def(&program, "Point");
        let names: Vec<&str> = point.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        let ctor = point
            .methods
            .iter()
            .find(|m| m.name == "new")
            .expect("synthetic constructor");
        assert!(ctor.is_static);
        assert_eq!(ctor.ret, Type::Named(String::from("Point")));
        let body = ctor.body.as_deref().expect("constructor body");
        assert!(matches!(
            body.first().map(|s| &s.kind),
            Some(HStmtKind::Let { .. })
        ));
        assert!(matches!(
            body.last().map(|s| &s.kind),
            Some(HStmtKind::Return(Some(_)))
        ));
    }

    #[test]
    fn exact_overload_beats_widening() {
        let program = analyze_ok("Console.print(5)\nConsole.print(2.5)\n");
        let body = main_body(&program);
        let HExprKind::CallHost { mangled, .. } = call_in(&body[0]) else {
            panic!("expected a host call");
        };
        assert_eq!(mangled, "print__i");
        let HExprKind::CallHost { mangled, .. } = call_in(&body[1]) else {
            panic!("expected a host call");
        };
        assert_eq!(mangled, "print__d");
    }

    #[test]
    fn tied_overloads_are_ambiguous() {
        let source = "\
class A(v: int)
    static fn f(a: int, b: double): int
        return 0
    static fn f(a: double, b: int): int
        return 1
A.f(1, 2)
";
        reports(source, "ambiguous");
    }

    #[test]
    fn fixed_arity_beats_variadic() {
        let source = "\
class M(v: int)
    static fn f(a: int, b: int): int
        return a
    static fn f(xs: int...): int
        return 0
M.f(1, 2)
";
        let program = analyze_ok(source);
        let body = main_body(&program);
        let HExprKind::CallMethod { mangled, .. } = call_in(&body[0]) else {
            panic!("expected a static call");
        };
        assert_eq!(mangled, "f__ii");
    }

    #[test]
    fn variadic_tail_collapses_into_a_pack() {
        let program = analyze_ok("Math.maxOf(1, 2, 3)\n");
        let body = main_body(&program);
        let HExprKind::CallHost { mangled, args, .. } = call_in(&body[0]) else {
            panic!("expected a host call");
        };
        assert_eq!(mangled, "maxOf__vi");
        assert_eq!(args.len(), 1);
        let HExprKind::MakePack { elem, args } = &args[0].kind else {
            panic!("expected the tail to pack");
        };
        assert_eq!(*elem, Type::Int);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn forward_references_resolve_after_registration() {
        let program = analyze_ok("class A(b: B)\nclass B(x: int)\n");
        let a = type_def(&program, "A");
        assert_eq!(a.fields[0].ty, Type::Named(String::from("B")));
    }

    #[test]
    fn unresolved_type_name_is_reported() {
        reports("class A(b: Missing)\n", "Missing");
    }

    #[test]
    fn supertype_cycle_is_fatal() {
        let (_, errs) = analyze_src("class A(x: int) : B\nclass B(y: int) : A\n");
        assert!(errs.is_fatal());
    }

    #[test]
    fn missing_interface_method_is_reported() {
        let source = "\
interface Shape
    fn area(): int
class Circle(r: int) : Shape
";
        reports(source, "does not implement");
    }

    #[test]
    fn matching_interface_method_conforms() {
        let source = "\
interface Shape
    fn area(): int
class Circle(r: int) : Shape
    fn area(): int
        return r * r
";
        analyze_ok(source);
    }

    #[test]
    fn read_only_capture_stays_by_value() {
        let source = "\
let x = 1
let f = fn() => x + 1
f()
";
        let program = analyze_ok(source);
        let main = main_method(&program);
        let x = main
            .locals
            .iter()
            .find(|l| l.name == "x")
            .expect("local `x`");
        assert!(!x.boxed);
        let lambda = type_def(&program, "Main")
            .methods
            .iter()
            .find(|m| m.is_lambda)
            .expect("lifted lambda");
        assert_eq!(lambda.ret, Type::Int);
    }

    #[test]
    fn assigned_capture_lives_in_a_cell() {
        let source = "\
let x = 1
let f = fn() =>
    x = x + 2
f()
";
        let program = analyze_ok(source);
        let main = main_method(&program);
        let x = main
            .locals
            .iter()
            .find(|l| l.name == "x")
            .expect("local `x`");
        assert!(x.boxed);
        let lambda = type_def(&program, "Main")
            .methods
            .iter()
            .find(|m| m.is_lambda)
            .expect("lifted lambda");
        let body = lambda.body.as_deref().expect("lambda body");
        let HStmtKind::Expr(e) = &body[0].kind else {
            panic!("expected the assignment");
        };
        assert!(matches!(e.kind, HExprKind::CellSet { .. }));
    }

    #[test]
    fn dynamic_call_binds_a_unique_candidate() {
        let source = "\
class Greeter(n: int)
    fn hello(): int
        return n
let a: any = Greeter(1)
a.hello()
";
        let program = analyze_ok(source);
        let body = main_body(&program);
        let HExprKind::CallMethod {
            target,
            type_fqn,
            mangled,
            ..
        } = call_in(&body[1])
        else {
            panic!("expected a bound method call");
        };
        assert_eq!(type_fqn, "Greeter");
        assert_eq!(mangled, "hello__");
        let target = target.as_deref().expect("receiver");
        assert!(matches!(target.kind, HExprKind::UnboxAny { .. }));
    }

    #[test]
    fn dynamic_call_with_two_candidates_is_ambiguous() {
        let source = "\
class P1(x: int)
    fn m(): int
        return 0
class P2(x: int)
    fn m(): int
        return 1
let a: any = P1(1)
a.m()
";
        reports(source, "ambiguous dynamic");
    }

    #[test]
    fn overload_selection_is_stable() {
        let sigs = vec![
            Sig {
                params: vec![Type::Int],
                variadic: None,
            },
            Sig {
                params: vec![Type::Long],
                variadic: None,
            },
        ];
        for _ in 0..16 {
            match select(&sigs, &[Type::Int]) {
                Selection::Chosen(0) => {}
                _ => panic!("selection changed between runs"),
            }
        }
    }

    #[test]
    fn operators_route_to_conventional_methods() {
        let source = "\
class Vec2(x: int)
    fn add(o: Vec2): Vec2
        return Vec2(x + o.x)
let v = Vec2(1) + Vec2(2)
";
        let program = analyze_ok(source);
        let body = main_body(&program);
        let HStmtKind::Let { init, .. } = &body[0].kind else {
            panic!("expected the let");
        };
        let init = init.as_ref().expect("initializer");
        let HExprKind::CallMethod { mangled, .. } = &init.kind else {
            panic!("expected `+` to become an `add` call");
        };
        assert_eq!(mangled, "add__o");
        assert_eq!(init.ty, Type::Named(String::from("Vec2")));
    }

    #[test]
    fn int_literal_narrows_unless_long_is_expected() {
        analyze_ok("let a: long = 4294967296\n");
        reports("let b = 4294967296\n", "`L` suffix");
    }

    #[test]
    fn break_outside_a_loop_is_reported() {
        reports("break\n", "outside of a loop");
    }

    #[test]
    fn strings_concatenate_but_do_not_subtract() {
        let program = analyze_ok("let s = \"a\" + \"b\"\n");
        let main = main_method(&program);
        assert_eq!(main.locals[0].ty, Type::Str);
        reports("let t = \"a\" - \"b\"\n", "not defined");
    }

    #[test]
    fn function_arguments_bind_within_the_declaring_type() {
        let source = "\
fn twice(f: fn(int): int, x: int): int
    return f(f(x))
let g = fn(n: int) => n + 1
twice(g, 40)
";
        analyze_ok(source);
    }

    #[test]
    fn function_argument_to_another_type_is_rejected() {
        let source = "\
class Apply(v: int)
    static fn call(f: fn(int): int, x: int): int
        return f(x)
let g = fn(n: int) => n + 1
Apply.call(g, 41)
";
        reports(source, "cannot cross the boundary of `Apply`");
    }

    #[test]
    fn function_typed_constructor_argument_is_rejected() {
        let source = "\
class Holder(f: fn(int): int)
let h = Holder(fn(n: int) => n)
";
        reports(source, "cannot cross the boundary of `Holder`");
    }

    #[test]
    fn chained_assignment_names_the_real_problem() {
        let source = "\
let a = 0
let b = 0
a = b = 1
";
        let (_, errs) = analyze_src(source);
        assert!(
            errs.diagnostics()
                .iter()
                .any(|d| d.message.contains("assignment is not an expression")),
            "got {:?}",
            errs.diagnostics()
        );
        assert!(
            !errs.diagnostics().iter().any(|d| d.message.contains("expected")),
            "the unit mismatch should no longer surface: {:?}",
            errs.diagnostics()
        );
    }
}
