//! Code-generation context.
//!
//! [`Registry`] lives for a whole generation run and owns everything shared between units: named
//! globals, keyed constants, the alias table and the declarations of the shared types module.
//! [`Context`] is rebuilt per generated unit (a flow module, or one exported codec) and owns the
//! statement scopes, the local names in use and the naming hints for anonymous shapes.

use crate::error::SchemaError;
use crate::ir::{count_uses, Block, Decl, Expr, Local, Stmt};
use crate::naming;
use crate::value::Value;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, trace};

/// Host-side implementation of an external function referenced by generated code, used by the
/// interpreter.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

/// Run-wide registries. Everything is insertion-ordered so two runs over the same schema produce
/// the same declarations with the same names.
#[derive(Default)]
pub struct Registry {
    decls: Vec<Option<Decl>>,
    globals: HashMap<String, usize>,
    constants: HashMap<String, String>,
    aliases: HashMap<String, String>,
    functions: HashMap<String, NativeFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named global. The first registration wins; later calls return the same name
    /// without running `define`. The name is reserved before `define` runs, so a definition may
    /// refer to itself.
    pub fn register_global<F>(&mut self, name: &str, define: F) -> Result<String, SchemaError>
    where
        F: FnOnce(&mut Registry) -> Result<Decl, SchemaError>,
    {
        if self.globals.contains_key(name) {
            return Ok(name.to_string());
        }
        let slot = self.reserve(name);
        debug!(global = name, "registering global");
        let decl = define(self)?;
        self.decls[slot] = Some(decl);
        Ok(name.to_string())
    }

    /// Register a constant under a stable key. The same key always yields the same name; a
    /// distinct key whose desired name is taken gets a numeric suffix.
    pub fn register_constant<F>(
        &mut self,
        key: &str,
        desired: &str,
        define: F,
    ) -> Result<String, SchemaError>
    where
        F: FnOnce(&mut Registry, &str) -> Result<Decl, SchemaError>,
    {
        if let Some(name) = self.constants.get(key) {
            return Ok(name.clone());
        }
        let name = self.unique_name(desired);
        self.constants.insert(key.to_string(), name.clone());
        let slot = self.reserve(&name);
        debug!(constant = %name, key, "registering constant");
        let decl = define(self, &name)?;
        self.decls[slot] = Some(decl);
        Ok(name)
    }

    /// Map a wire-shape signature to a declared name. If the shape already has a name, that name
    /// is kept and returned.
    pub fn register_alias(&mut self, signature: &str, name: &str) -> String {
        if let Some(existing) = self.aliases.get(signature) {
            if existing != name {
                debug!(shape = signature, existing = %existing, requested = name, "sharing alias");
            }
            return existing.clone();
        }
        self.aliases.insert(signature.to_string(), name.to_string());
        name.to_string()
    }

    pub fn lookup_alias(&self, signature: &str) -> Option<&str> {
        self.aliases.get(signature).map(String::as_str)
    }

    pub fn register_function(&mut self, path: &str, f: NativeFn) {
        self.functions.entry(path.to_string()).or_insert(f);
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    pub fn decl(&self, name: &str) -> Option<&Decl> {
        self.globals.get(name).and_then(|&i| self.decls[i].as_ref())
    }

    /// Finished declarations in registration order, plus the native function table.
    pub fn into_parts(self) -> (Vec<Decl>, HashMap<String, NativeFn>) {
        (self.decls.into_iter().flatten().collect(), self.functions)
    }

    fn reserve(&mut self, name: &str) -> usize {
        let slot = self.decls.len();
        self.decls.push(None);
        self.globals.insert(name.to_string(), slot);
        slot
    }

    fn unique_name(&self, desired: &str) -> String {
        if !self.globals.contains_key(desired) {
            return desired.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}{}", desired, n);
            if !self.globals.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// A declared local binding.
#[derive(Debug)]
pub struct Binding {
    local: Local,
    used: Cell<bool>,
}

impl Binding {
    /// Use the binding.
    pub fn reference(&self) -> Expr {
        self.used.set(true);
        Expr::Local(self.local.clone())
    }

    pub fn is_referenced(&self) -> bool {
        self.used.get()
    }

    pub fn local(&self) -> &Local {
        &self.local
    }
}

#[derive(Default)]
struct Scope {
    stmts: Vec<Stmt>,
    /// (requested name, allocated local)
    names: Vec<(String, Local)>,
}

/// Active bit-slot group while a packed or flag struct is being generated.
struct SlotFrame {
    group: u64,
    raw: Option<Expr>,
}

/// Per-unit generation state.
pub struct Context<'r> {
    registry: &'r mut Registry,
    scopes: Vec<Scope>,
    next_local: u32,
    /// Every name handed out in the current function.
    taken: HashSet<String>,
    hints: Vec<String>,
    frames: Vec<SlotFrame>,
}

impl<'r> Context<'r> {
    pub fn new(registry: &'r mut Registry) -> Self {
        Context {
            registry,
            scopes: vec![Scope::default()],
            next_local: 0,
            taken: HashSet::new(),
            hints: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// A context for a unit of the shared types module, named after `hint`.
    pub fn nested(registry: &'r mut Registry, hint: &str) -> Self {
        let mut ctx = Context::new(registry);
        ctx.hints.push(hint.to_string());
        ctx
    }

    pub fn registry(&self) -> &Registry {
        &*self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut *self.registry
    }

    /// Start a new generated function: all scopes and bit-slot frames are discarded.
    pub fn begin_function(&mut self) {
        self.scopes = vec![Scope::default()];
        self.taken.clear();
        self.frames.clear();
    }

    /// Run `f` with a fresh statement buffer; returns the buffer and `f`'s result. Names declared
    /// inside go out of scope afterwards.
    pub fn capture<T, F>(&mut self, f: F) -> Result<(Vec<Stmt>, T), SchemaError>
    where
        F: FnOnce(&mut Self) -> Result<T, SchemaError>,
    {
        self.scoped(f).map(|(scope, v)| (scope.stmts, v))
    }

    fn scoped<T, F>(&mut self, f: F) -> Result<(Scope, T), SchemaError>
    where
        F: FnOnce(&mut Self) -> Result<T, SchemaError>,
    {
        self.scopes.push(Scope::default());
        let out = f(self);
        let scope = self.scopes.pop().unwrap_or_default();
        out.map(|v| (scope, v))
    }

    pub fn emit(&mut self, stmt: Stmt) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.stmts.push(stmt);
        }
    }

    /// Allocate a collision-free local. Names clash with reserved parameter names, keywords and
    /// every local already handed out in this function, so no binding ever shadows another;
    /// clashes get `_1`, `_2`, ... suffixes.
    pub fn alloc(&mut self, requested: &str) -> Local {
        let base = naming::binding_name(requested);
        let mut candidate = base.clone();
        // an escaped keyword no longer needs its trailing `_` once suffixed
        let stem = match base.trim_end_matches('_') {
            "" => base.as_str(),
            stem => stem,
        };
        let mut n = 1;
        while self.name_taken(&candidate) {
            candidate = format!("{}_{}", stem, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        let local = self.fresh(&candidate);
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.push((requested.to_string(), local.clone()));
        }
        local
    }

    /// A parameter with a fixed name (`self`, `value`).
    pub fn param(&mut self, name: &str) -> Local {
        self.taken.insert(name.to_string());
        self.fresh(name)
    }

    fn fresh(&mut self, name: &str) -> Local {
        let local = Local::new(self.next_local, name);
        self.next_local += 1;
        local
    }

    fn name_taken(&self, name: &str) -> bool {
        naming::RESERVED_LOCALS.contains(&name)
            || naming::is_keyword(name)
            || self.taken.contains(name)
    }

    /// Declare an immutable binding. The initializer runs in a nested capture so that the
    /// statements it needs land immediately before the binding.
    pub fn declare<F>(&mut self, name: &str, init: F) -> Result<Binding, SchemaError>
    where
        F: FnOnce(&mut Self) -> Result<Expr, SchemaError>,
    {
        // Supporting statements and their locals join the enclosing scope.
        let (inner, expr) = self.scoped(init)?;
        if let Some(scope) = self.scopes.last_mut() {
            scope.stmts.extend(inner.stmts);
            scope.names.extend(inner.names);
        }
        let local = self.alloc(name);
        self.emit(Stmt::Let { local: local.clone(), mutable: false, init: Some(expr) });
        Ok(Binding { local, used: Cell::new(false) })
    }

    /// Declare a mutable binding with an initial value.
    pub fn declare_mut(&mut self, name: &str, init: Expr) -> Local {
        let local = self.alloc(name);
        self.emit(Stmt::Let { local: local.clone(), mutable: true, init: Some(init) });
        local
    }

    /// Declare a binding assigned later (`let x;`).
    pub fn declare_deferred(&mut self, name: &str) -> Local {
        let local = self.alloc(name);
        self.emit(Stmt::Let { local: local.clone(), mutable: false, init: None });
        local
    }

    /// Find a visible binding by the name it was requested under, innermost first.
    pub fn lookup(&self, name: &str) -> Option<Expr> {
        self.scopes.iter().rev().find_map(|s| {
            s.names
                .iter()
                .rev()
                .find(|(requested, _)| requested == name)
                .map(|(_, l)| Expr::Local(l.clone()))
        })
    }

    /// Close a block: drop dead bindings, forward pure single-use bindings to their use, then
    /// inline trailing single-use bindings into the result where stream reads stay in order.
    pub fn finish(&self, stmts: Vec<Stmt>, result: Expr) -> Block {
        elide(stmts, result)
    }

    pub fn with_hint<T, F>(&mut self, hint: &str, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        self.hints.push(hint.to_string());
        let out = f(self);
        self.hints.pop();
        out
    }

    /// Type name derived from the enclosing packet/field path.
    pub fn hint_name(&self, fallback: &str) -> String {
        if self.hints.is_empty() {
            return naming::type_name(fallback);
        }
        self.hints.iter().map(|h| naming::type_name(h)).collect()
    }

    /// Innermost hint, for naming locals.
    pub fn last_hint(&self) -> Option<&str> {
        self.hints.last().map(String::as_str)
    }

    pub fn register_global<F>(&mut self, name: &str, define: F) -> Result<String, SchemaError>
    where
        F: FnOnce(&mut Registry) -> Result<Decl, SchemaError>,
    {
        self.registry.register_global(name, define)
    }

    pub fn register_constant<F>(
        &mut self,
        key: &str,
        desired: &str,
        define: F,
    ) -> Result<String, SchemaError>
    where
        F: FnOnce(&mut Registry, &str) -> Result<Decl, SchemaError>,
    {
        self.registry.register_constant(key, desired, define)
    }

    pub fn register_alias(&mut self, signature: &str, name: &str) -> String {
        self.registry.register_alias(signature, name)
    }

    pub fn lookup_alias(&self, signature: &str) -> Option<String> {
        self.registry.lookup_alias(signature).map(str::to_string)
    }

    pub fn register_function(&mut self, path: &str, f: NativeFn) {
        self.registry.register_function(path, f);
    }

    pub fn push_frame(&mut self, group: u64, raw: Option<Expr>) {
        self.frames.push(SlotFrame { group, raw });
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// `None` when the group is not being generated; `Some(None)` while encoding.
    pub fn frame(&self, group: u64) -> Option<Option<&Expr>> {
        self.frames.iter().rev().find(|f| f.group == group).map(|f| f.raw.as_ref())
    }
}

fn count_all(stmts: &[Stmt], result: &Expr) -> HashMap<u32, usize> {
    let mut counts = HashMap::new();
    count_uses(stmts, &mut counts);
    result.walk(&mut |e| {
        if let Expr::Local(l) = e {
            *counts.entry(l.id()).or_insert(0) += 1;
        }
    });
    counts
}

fn elide(mut stmts: Vec<Stmt>, mut result: Expr) -> Block {
    // Pass 1: drop unreferenced bindings until nothing changes.
    loop {
        let counts = count_all(&stmts, &result);
        let before = stmts.len();
        let mut kept = Vec::with_capacity(before);
        let mut changed = false;
        for stmt in stmts {
            match stmt {
                Stmt::Let { local, mutable: false, init: Some(init) }
                    if counts.get(&local.id()).copied().unwrap_or(0) == 0 =>
                {
                    changed = true;
                    if init.has_effect() {
                        trace!(binding = local.name(), "unused binding kept as expression");
                        kept.push(Stmt::Eval(init));
                    } else {
                        trace!(binding = local.name(), "dropped unused binding");
                    }
                }
                other => kept.push(other),
            }
        }
        stmts = kept;
        if !changed {
            break;
        }
    }

    forward_pure(&mut stmts, &mut result);

    // Pass 2: inline trailing single-use bindings into the result.
    let counts = count_all(&stmts, &result);
    loop {
        let Some(Stmt::Let { local, mutable: false, init: Some(init) }) = stmts.last() else {
            break;
        };
        if counts.get(&local.id()).copied().unwrap_or(0) != 1 || !references(&result, local) {
            break;
        }
        if init.has_effect() && effect_precedes(&result, local) {
            break;
        }
        let (local, init) = match stmts.pop() {
            Some(Stmt::Let { local, init: Some(init), .. }) => (local, init),
            _ => break,
        };
        trace!(binding = local.name(), "inlined binding");
        result.substitute(&local, &init);
    }
    Block { stmts, result }
}

/// Move pure single-use bindings into their use site, unless a local they read is assigned
/// between the binding and the use.
fn forward_pure(stmts: &mut Vec<Stmt>, result: &mut Expr) {
    let mut i = stmts.len();
    while i > 0 {
        i -= 1;
        let (local, init) = match &stmts[i] {
            Stmt::Let { local, mutable: false, init: Some(init) } if !init.has_effect() => {
                (local.clone(), init.clone())
            }
            _ => continue,
        };
        let counts = count_all(stmts, result);
        if counts.get(&local.id()).copied().unwrap_or(0) != 1 {
            continue;
        }
        let mut reads = HashSet::new();
        init.walk(&mut |e| {
            if let Expr::Local(l) = e {
                reads.insert(l.id());
            }
        });
        let mut assigned = HashSet::new();
        let mut target = None;
        for (j, s) in stmts.iter().enumerate().skip(i + 1) {
            s.assigned(&mut assigned);
            let mut found = false;
            for e in s.exprs() {
                found |= references(e, &local);
            }
            let mut nested = HashMap::new();
            for b in s.blocks() {
                count_uses(b, &mut nested);
            }
            if found || nested.contains_key(&local.id()) {
                target = Some(j);
                break;
            }
        }
        if reads.iter().any(|id| assigned.contains(id)) {
            continue;
        }
        let moved = match target {
            Some(j) => stmts[j].substitute(&local, &init),
            None => result.substitute(&local, &init),
        };
        if moved {
            trace!(binding = local.name(), "forwarded pure binding");
            stmts.remove(i);
        }
    }
}

fn references(expr: &Expr, local: &Local) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Local(l) = e {
            found |= l == local;
        }
    });
    found
}

/// Whether moving an effectful initializer to `target`'s position in `expr` would run it after
/// some other effect in `expr`, or only conditionally.
fn effect_precedes(expr: &Expr, target: &Local) -> bool {
    fn visit(e: &Expr, target: &Local, seen: &mut bool) -> Option<bool> {
        match e {
            Expr::Local(l) => return (l == target).then_some(*seen),
            Expr::Cond { cond, then, otherwise } => {
                if let Some(r) = visit(cond, target, seen) {
                    return Some(r);
                }
                if references(then, target) || references(otherwise, target) {
                    return Some(true);
                }
                *seen |= then.has_effect() || otherwise.has_effect();
                return None;
            }
            _ => {}
        }
        for child in e.children() {
            if let Some(r) = visit(child, target, seen) {
                return Some(r);
            }
        }
        if matches!(
            e,
            Expr::Read(_) | Expr::FromId { .. } | Expr::CallDecode(_) | Expr::Call { .. }
        ) {
            *seen = true;
        }
        None
    }
    visit(expr, target, &mut false).unwrap_or(true)
}
