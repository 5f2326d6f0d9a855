//! Name resolution.
//!
//! Every function-like node gets a [`Scope`] holding its locals, the locals captured by nested
//! scopes (cells) and the variables it captures itself (frees). Module level names are always
//! globals.

use std::collections::{BTreeMap, HashSet};

use super::ast::*;

/// Index of the module scope in a [`ScopeTable`].
pub const MODULE_SCOPE: ScopeId = 0;

/// Name of the hidden parameter a comprehension receives its first iterator in.
pub const COMPREHENSION_ARG: &str = ".0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Parameters first, then other bound names in binding order.
    pub locals: Vec<String>,
    pub argcount: usize,
    pub globals: HashSet<String>,
    uses: Vec<String>,
    pub cells: Vec<String>,
    pub frees: Vec<String>,
}

/// Where a name lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRef {
    Fast(u32),
    Deref(u32),
    Global,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Scope {
            kind,
            parent,
            locals: Vec::new(),
            argcount: 0,
            globals: HashSet::new(),
            uses: Vec::new(),
            cells: Vec::new(),
            frees: Vec::new(),
        }
    }

    fn bind(&mut self, name: &str) {
        if !self.globals.contains(name) && !self.locals.iter().any(|l| l == name) {
            self.locals.push(name.to_owned());
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.kind == ScopeKind::Function
            && !self.globals.contains(name)
            && self.locals.iter().any(|l| l == name)
    }

    pub fn resolve(&self, name: &str) -> NameRef {
        if self.kind == ScopeKind::Module || self.globals.contains(name) {
            return NameRef::Global;
        }
        if let Some(i) = self.cells.iter().position(|c| c == name) {
            return NameRef::Deref(i as u32);
        }
        if let Some(i) = self.frees.iter().position(|f| f == name) {
            return NameRef::Deref((self.cells.len() + i) as u32);
        }
        if let Some(i) = self.locals.iter().position(|l| l == name) {
            return NameRef::Fast(i as u32);
        }
        NameRef::Global
    }
}

/// Scopes of one module, keyed by the ids the parser assigned.
#[derive(Debug)]
pub struct ScopeTable {
    scopes: BTreeMap<ScopeId, Scope>,
}

impl ScopeTable {
    pub fn analyze(body: &Block) -> ScopeTable {
        let mut collector = Collector {
            scopes: BTreeMap::new(),
            current: MODULE_SCOPE,
        };
        collector
            .scopes
            .insert(MODULE_SCOPE, Scope::new(ScopeKind::Module, None));
        collector.block(body);

        let mut table = ScopeTable {
            scopes: collector.scopes,
        };
        table.resolve_captures();
        table
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[&id]
    }

    /// Marks captured names as cells in the defining scope and as frees in every scope
    /// between the use and the definition.
    fn resolve_captures(&mut self) {
        let ids: Vec<ScopeId> = self.scopes.keys().copied().collect();
        for id in ids {
            let scope = &self.scopes[&id];
            if scope.kind == ScopeKind::Module {
                continue;
            }
            let wanted: Vec<String> = scope
                .uses
                .iter()
                .filter(|name| !scope.is_local(name) && !scope.globals.contains(*name))
                .cloned()
                .collect();

            for name in wanted {
                let mut chain = vec![id];
                let mut cursor = self.scopes[&id].parent;
                let mut owner = None;
                while let Some(parent) = cursor {
                    let scope = &self.scopes[&parent];
                    if scope.kind == ScopeKind::Module || scope.globals.contains(&name) {
                        break;
                    }
                    if scope.is_local(&name) {
                        owner = Some(parent);
                        break;
                    }
                    chain.push(parent);
                    cursor = scope.parent;
                }
                let Some(owner) = owner else {
                    continue;
                };
                if let Some(scope) = self.scopes.get_mut(&owner) {
                    if !scope.cells.contains(&name) {
                        scope.cells.push(name.clone());
                    }
                }
                for link in chain {
                    if let Some(scope) = self.scopes.get_mut(&link) {
                        if !scope.frees.contains(&name) {
                            scope.frees.push(name.clone());
                        }
                    }
                }
            }
        }
    }
}

struct Collector {
    scopes: BTreeMap<ScopeId, Scope>,
    current: ScopeId,
}

impl Collector {
    fn scope(&mut self) -> &mut Scope {
        self.scopes
            .entry(self.current)
            .or_insert_with(|| Scope::new(ScopeKind::Function, None))
    }

    fn bind(&mut self, name: &str) {
        self.scope().bind(name);
    }

    fn use_name(&mut self, name: &str) {
        let scope = self.scope();
        if !scope.uses.iter().any(|u| u == name) {
            scope.uses.push(name.to_owned());
        }
    }

    fn enter(&mut self, id: ScopeId, params: &[String]) -> ScopeId {
        let mut scope = Scope::new(ScopeKind::Function, Some(self.current));
        for param in params {
            scope.bind(param);
        }
        scope.argcount = params.len();
        self.scopes.insert(id, scope);
        std::mem::replace(&mut self.current, id)
    }

    fn block(&mut self, body: &Block) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(name) => self.bind(name),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.target(item);
                }
            }
            _ => self.expr(target),
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) => self.expr(e),
            StmtKind::Assign { targets, value } => {
                self.expr(value);
                for target in targets {
                    self.target(target);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.expr(value);
                if let ExprKind::Name(name) = &target.kind {
                    self.use_name(name);
                }
                self.target(target);
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::While { test, body } => {
                self.expr(test);
                self.block(body);
            }
            StmtKind::For { target, iter, body } => {
                self.expr(iter);
                self.target(target);
                self.block(body);
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Pass => {}
            StmtKind::Def(def) => {
                for param in &def.params {
                    if let Some(default) = &param.default {
                        self.expr(default);
                    }
                }
                self.bind(&def.name);
                let names: Vec<String> = def.params.iter().map(|p| p.name.clone()).collect();
                let saved = self.enter(def.id, &names);
                self.block(&def.body);
                self.current = saved;
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Global(names) => {
                let scope = self.scope();
                for name in names {
                    scope.globals.insert(name.clone());
                }
            }
            StmtKind::Try { body, handlers } => {
                self.block(body);
                for handler in handlers {
                    if let Some(class) = &handler.class {
                        self.expr(class);
                    }
                    if let Some(name) = &handler.name {
                        self.bind(name);
                    }
                    self.block(&handler.body);
                }
            }
            StmtKind::Raise(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Import { module, alias } => {
                self.bind(alias.as_ref().unwrap_or(module));
            }
            StmtKind::ImportFrom { names, .. } => {
                for (name, alias) in names {
                    self.bind(alias.as_ref().unwrap_or(name));
                }
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::None
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => {}
            ExprKind::Name(name) => self.use_name(name),
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Dict(items) => {
                for (key, value) in items {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::BinOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.expr(value);
                }
            }
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.expr(left);
                for comparator in comparators {
                    self.expr(comparator);
                }
            }
            ExprKind::Call { func, args, kwargs } => {
                self.expr(func);
                for arg in args {
                    self.expr(arg);
                }
                for (_, value) in kwargs {
                    self.expr(value);
                }
            }
            ExprKind::Attribute { value, .. } => self.expr(value),
            ExprKind::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part);
                }
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            ExprKind::Lambda { id, params, body } => {
                for param in params {
                    if let Some(default) = &param.default {
                        self.expr(default);
                    }
                }
                let names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
                let saved = self.enter(*id, &names);
                self.expr(body);
                self.current = saved;
            }
            ExprKind::ListComp {
                id,
                elt,
                generators,
            } => {
                // the first iterable is evaluated in the enclosing scope
                if let Some(first) = generators.first() {
                    self.expr(&first.iter);
                }
                let saved = self.enter(*id, &[COMPREHENSION_ARG.to_owned()]);
                for (i, generator) in generators.iter().enumerate() {
                    if i > 0 {
                        self.expr(&generator.iter);
                    }
                    self.target(&generator.target);
                    for cond in &generator.ifs {
                        self.expr(cond);
                    }
                }
                self.expr(elt);
                self.current = saved;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse_module;

    fn analyze(src: &str) -> ScopeTable {
        ScopeTable::analyze(&parse_module("t", src).unwrap())
    }

    #[test]
    fn module_names_are_global() {
        let table = analyze("x = 1\ndef f(a):\n    b = a + x\n    return b\n");
        let f = table.get(1);
        assert_eq!(f.resolve("a"), NameRef::Fast(0));
        assert_eq!(f.resolve("b"), NameRef::Fast(1));
        assert_eq!(f.resolve("x"), NameRef::Global);
        assert_eq!(table.get(MODULE_SCOPE).resolve("x"), NameRef::Global);
    }

    #[test]
    fn captured_locals_become_cells_and_frees() {
        let src = "def outer(n):\n    def mid():\n        def inner():\n            return n\n        return inner\n    return mid\n";
        let table = analyze(src);
        let (outer, mid, inner) = (table.get(1), table.get(2), table.get(3));
        assert_eq!(outer.cells, vec!["n".to_owned()]);
        assert_eq!(outer.resolve("n"), NameRef::Deref(0));
        assert_eq!(mid.frees, vec!["n".to_owned()]);
        assert_eq!(inner.frees, vec!["n".to_owned()]);
        assert_eq!(inner.resolve("n"), NameRef::Deref(0));
    }

    #[test]
    fn global_declaration_wins() {
        let table = analyze("count = 0\ndef bump():\n    global count\n    count += 1\n");
        assert_eq!(table.get(1).resolve("count"), NameRef::Global);
    }

    #[test]
    fn comprehension_targets_stay_local() {
        let table = analyze("def f(xs, k):\n    return [x * k for x in xs]\n");
        let comp = table.get(2);
        assert_eq!(comp.resolve(COMPREHENSION_ARG), NameRef::Fast(0));
        assert_eq!(comp.resolve("x"), NameRef::Fast(1));
        assert_eq!(comp.resolve("k"), NameRef::Deref(0));
        assert_eq!(table.get(1).cells, vec!["k".to_owned()]);
    }
}
