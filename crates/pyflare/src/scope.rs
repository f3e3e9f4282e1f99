//! Name and scope analysis.
//!
//! A single pre-pass over a module classifies every name in every function
//! before code generation starts. For each scope-introducing node (the
//! module, each `def`, each `class`) it produces a [`ScopeInfo`]:
//!
//! - `locals`: names bound in the scope; parameters, assignment targets,
//!   `for` variables, `except … as` names, nested `def`/`class` names, and
//!   `from … import` aliases;
//! - `globals`: names the scope reads without binding, plus any name a
//!   nested function reads that neither it nor this scope binds (these keep
//!   propagating upward);
//! - `exports`: locals some nested function closes over (they live in the
//!   activation object rather than a register), plus class names;
//! - `imports`: the aliases bound by import statements;
//! - `publics`: `(package, name, kind)` for `@package(…)`-decorated
//!   definitions, recorded for linkage;
//! - `slots`: the strings of a class-level `__slots__` assignment.
//!
//! Scopes are analyzed bottom-up; results are stored in a side table keyed
//! by the node's byte offset, since the parser's nodes cannot carry
//! annotations.

use std::collections::HashMap;

use indexmap::IndexSet;
use ruff_python_ast::{self as ast, Expr, Stmt};
use ruff_text_size::Ranged;

use crate::library::PropKind;

/// Name classification for one scope.
#[derive(Debug, Default, Clone)]
pub struct ScopeInfo {
    pub locals: IndexSet<String>,
    pub globals: IndexSet<String>,
    pub exports: IndexSet<String>,
    pub imports: IndexSet<String>,
    pub publics: Vec<(String, String, PropKind)>,
    pub slots: Option<Vec<String>>,
}

/// Key of the module scope in a [`ScopeMap`]; real nodes key by offset.
const MODULE_KEY: u32 = u32::MAX;

/// Side table of scope analyses, keyed by node start offset.
pub struct ScopeMap {
    map: HashMap<u32, ScopeInfo>,
}

impl ScopeMap {
    pub fn module(&self) -> &ScopeInfo {
        &self.map[&MODULE_KEY]
    }

    /// The analysis for the `def`/`class` starting at `offset`.
    pub fn of(&self, offset: u32) -> &ScopeInfo {
        self.map
            .get(&offset)
            .expect("scope analysis missing for a node the generator visits")
    }
}

/// Analyze a module body.
pub fn analyze_module(body: &[Stmt]) -> ScopeMap {
    let mut map = HashMap::new();
    let info = analyze(body, &[], ScopeKind::Module, &mut map);
    map.insert(MODULE_KEY, info);
    ScopeMap { map }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Class,
    Function,
}

/// The decorator's bare name (`classmethod`) or call name (`package`).
pub fn decorator_name(dec: &ast::Decorator) -> Option<&str> {
    match &dec.expression {
        Expr::Name(name) => Some(name.id.as_str()),
        Expr::Call(call) => match call.func.as_ref() {
            Expr::Name(name) => Some(name.id.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// The decorator's first argument, when it is a string literal.
pub fn decorator_str_arg(dec: &ast::Decorator) -> Option<String> {
    if let Expr::Call(call) = &dec.expression {
        if let Some(Expr::StringLiteral(s)) = call.arguments.args.first() {
            return Some(s.value.to_string());
        }
    }
    None
}

struct Analyzer {
    locals: IndexSet<String>,
    referenced: IndexSet<String>,
    exports: IndexSet<String>,
    imports: IndexSet<String>,
    publics: Vec<(String, String, PropKind)>,
    slots: Option<Vec<String>>,
    /// Global sets of directly nested functions and classes, for upward
    /// propagation.
    nested_globals: Vec<IndexSet<String>>,
    kind: ScopeKind,
}

fn analyze(
    body: &[Stmt],
    params: &[String],
    kind: ScopeKind,
    map: &mut HashMap<u32, ScopeInfo>,
) -> ScopeInfo {
    let mut a = Analyzer {
        locals: params.iter().cloned().collect(),
        referenced: IndexSet::new(),
        exports: IndexSet::new(),
        imports: IndexSet::new(),
        publics: Vec::new(),
        slots: None,
        nested_globals: Vec::new(),
        kind,
    };
    for stmt in body {
        a.visit_stmt(stmt, map);
    }

    let mut info = ScopeInfo {
        locals: a.locals,
        globals: IndexSet::new(),
        exports: a.exports,
        imports: a.imports,
        publics: a.publics,
        slots: a.slots,
    };
    // A nested function's free names force an export when this scope binds
    // them, and keep propagating upward when it does not.
    for nested in &a.nested_globals {
        for name in nested {
            if info.locals.contains(name) {
                info.exports.insert(name.clone());
            } else {
                info.globals.insert(name.clone());
            }
        }
    }
    for name in &a.referenced {
        if !info.locals.contains(name) {
            info.globals.insert(name.clone());
        }
    }
    info
}

impl Analyzer {
    fn bind(&mut self, name: &str) {
        self.locals.insert(name.to_owned());
    }

    fn bind_target(&mut self, target: &Expr) {
        match target {
            Expr::Name(name) => self.bind(name.id.as_str()),
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.bind_target(elt);
                }
            }
            Expr::List(list) => {
                for elt in &list.elts {
                    self.bind_target(elt);
                }
            }
            // Attribute/subscript targets bind nothing; their bases are
            // visited as references.
            _ => {}
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt, map: &mut HashMap<u32, ScopeInfo>) {
        match stmt {
            Stmt::FunctionDef(func) => {
                let params = param_names(&func.parameters);
                let info = analyze(&func.body, &params, ScopeKind::Function, map);
                self.nested_globals.push(info.globals.clone());
                map.insert(func.range().start().to_u32(), info);
                self.bind(func.name.as_str());
                // Top-level functions are published by the script, so like
                // classes they live as properties, never in a register.
                if self.kind == ScopeKind::Module {
                    self.exports.insert(func.name.to_string());
                }
                for dec in &func.decorator_list {
                    if decorator_name(dec) == Some("package") {
                        if let Some(pkg) = decorator_str_arg(dec) {
                            self.publics
                                .push((pkg, func.name.to_string(), PropKind::Function));
                        }
                    }
                }
            }
            Stmt::ClassDef(class) => {
                let info = analyze(&class.body, &[], ScopeKind::Class, map);
                self.nested_globals.push(info.globals.clone());
                map.insert(class.range().start().to_u32(), info);
                self.bind(class.name.as_str());
                // Class objects are built at run time, so nested scopes
                // reach them through the file namespace, never a register.
                self.exports.insert(class.name.to_string());
                for dec in &class.decorator_list {
                    if decorator_name(dec) == Some("package") {
                        if let Some(pkg) = decorator_str_arg(dec) {
                            self.publics
                                .push((pkg, class.name.to_string(), PropKind::Class));
                        }
                    }
                }
                if let Some(args) = &class.arguments {
                    for base in &args.args {
                        self.visit_expr(base);
                    }
                }
            }
            Stmt::Assign(assign) => {
                if self.kind == ScopeKind::Class {
                    if let [Expr::Name(name)] = assign.targets.as_slice() {
                        if name.id.as_str() == "__slots__" {
                            self.slots = Some(slot_strings(&assign.value));
                        }
                    }
                }
                for target in &assign.targets {
                    self.bind_target(target);
                    self.visit_expr(target);
                }
                self.visit_expr(&assign.value);
            }
            Stmt::AugAssign(aug) => {
                self.bind_target(&aug.target);
                self.visit_expr(&aug.target);
                self.visit_expr(&aug.value);
            }
            Stmt::ImportFrom(import) => {
                for alias in &import.names {
                    let bound = alias
                        .asname
                        .as_ref()
                        .map(|n| n.as_str())
                        .unwrap_or(alias.name.as_str());
                    self.imports.insert(bound.to_owned());
                }
            }
            Stmt::For(for_stmt) => {
                self.bind_target(&for_stmt.target);
                self.visit_expr(&for_stmt.iter);
                for s in &for_stmt.body {
                    self.visit_stmt(s, map);
                }
                for s in &for_stmt.orelse {
                    self.visit_stmt(s, map);
                }
            }
            Stmt::While(while_stmt) => {
                self.visit_expr(&while_stmt.test);
                for s in &while_stmt.body {
                    self.visit_stmt(s, map);
                }
                for s in &while_stmt.orelse {
                    self.visit_stmt(s, map);
                }
            }
            Stmt::If(if_stmt) => {
                self.visit_expr(&if_stmt.test);
                for s in &if_stmt.body {
                    self.visit_stmt(s, map);
                }
                for clause in &if_stmt.elif_else_clauses {
                    if let Some(test) = &clause.test {
                        self.visit_expr(test);
                    }
                    for s in &clause.body {
                        self.visit_stmt(s, map);
                    }
                }
            }
            Stmt::Try(try_stmt) => {
                for s in &try_stmt.body {
                    self.visit_stmt(s, map);
                }
                for handler in &try_stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.visit_expr(type_);
                    }
                    if let Some(name) = &h.name {
                        self.bind(name.as_str());
                    }
                    for s in &h.body {
                        self.visit_stmt(s, map);
                    }
                }
                for s in &try_stmt.orelse {
                    self.visit_stmt(s, map);
                }
                for s in &try_stmt.finalbody {
                    self.visit_stmt(s, map);
                }
            }
            Stmt::Expr(e) => self.visit_expr(&e.value),
            Stmt::Return(ret) => {
                if let Some(value) = &ret.value {
                    self.visit_expr(value);
                }
            }
            Stmt::Raise(raise) => {
                if let Some(exc) = &raise.exc {
                    self.visit_expr(exc);
                }
            }
            Stmt::Delete(del) => {
                for target in &del.targets {
                    self.visit_expr(target);
                }
            }
            _ => {}
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Name(name) => {
                self.referenced.insert(name.id.to_string());
            }
            Expr::Attribute(attr) => self.visit_expr(&attr.value),
            Expr::Subscript(sub) => {
                self.visit_expr(&sub.value);
                self.visit_expr(&sub.slice);
            }
            Expr::Call(call) => {
                self.visit_expr(&call.func);
                for arg in &call.arguments.args {
                    self.visit_expr(arg);
                }
                for kw in &call.arguments.keywords {
                    self.visit_expr(&kw.value);
                }
            }
            Expr::BinOp(binop) => {
                self.visit_expr(&binop.left);
                self.visit_expr(&binop.right);
            }
            Expr::UnaryOp(unary) => self.visit_expr(&unary.operand),
            Expr::BoolOp(boolop) => {
                for value in &boolop.values {
                    self.visit_expr(value);
                }
            }
            Expr::Compare(cmp) => {
                self.visit_expr(&cmp.left);
                for comparator in &cmp.comparators {
                    self.visit_expr(comparator);
                }
            }
            Expr::If(ifexp) => {
                self.visit_expr(&ifexp.test);
                self.visit_expr(&ifexp.body);
                self.visit_expr(&ifexp.orelse);
            }
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.visit_expr(elt);
                }
            }
            Expr::List(list) => {
                for elt in &list.elts {
                    self.visit_expr(elt);
                }
            }
            Expr::Dict(dict) => {
                for item in &dict.items {
                    if let Some(key) = &item.key {
                        self.visit_expr(key);
                    }
                    self.visit_expr(&item.value);
                }
            }
            _ => {}
        }
    }
}

/// Parameter names in register order, the vararg last.
pub fn param_names(parameters: &ast::Parameters) -> Vec<String> {
    let mut names: Vec<String> = parameters
        .args
        .iter()
        .map(|p| p.parameter.name.to_string())
        .collect();
    if let Some(vararg) = &parameters.vararg {
        names.push(vararg.name.to_string());
    }
    names
}

fn slot_strings(value: &Expr) -> Vec<String> {
    let elts = match value {
        Expr::Tuple(tuple) => &tuple.elts,
        Expr::List(list) => &list.elts,
        _ => return Vec::new(),
    };
    elts.iter()
        .filter_map(|e| match e {
            Expr::StringLiteral(s) => Some(s.value.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruff_python_parser::parse_module;

    fn module(source: &str) -> (ast::ModModule, ScopeMap) {
        let parsed = parse_module(source).unwrap().into_syntax();
        let scopes = analyze_module(&parsed.body);
        (parsed, scopes)
    }

    fn func_info<'m>(
        parsed: &ast::ModModule,
        scopes: &'m ScopeMap,
        index: usize,
    ) -> &'m ScopeInfo {
        match &parsed.body[index] {
            Stmt::FunctionDef(f) => scopes.of(f.range().start().to_u32()),
            other => panic!("expected a def, found {other:?}"),
        }
    }

    #[test]
    fn assigned_names_and_params_are_locals() {
        let (parsed, scopes) = module("def f(a, b):\n    c = a + b\n    return c\n");
        let info = func_info(&parsed, &scopes, 0);
        for name in ["a", "b", "c"] {
            assert!(info.locals.contains(name), "{name} should be local");
        }
        assert!(!info.globals.contains("c"));
    }

    #[test]
    fn read_but_unbound_names_are_globals() {
        let (parsed, scopes) = module("def f(x):\n    return x + other\n");
        let info = func_info(&parsed, &scopes, 0);
        assert!(info.globals.contains("other"));
        assert!(!info.globals.contains("x"));
    }

    #[test]
    fn closed_over_locals_become_exports() {
        let source = "def outer(x):\n    def inner():\n        return x\n    return inner\n";
        let (parsed, scopes) = module(source);
        let info = func_info(&parsed, &scopes, 0);
        assert!(info.exports.contains("x"));
        assert!(info.locals.contains("inner"));
    }

    #[test]
    fn rebinding_in_the_nested_function_defeats_the_export() {
        let source = "def outer(x):\n    def inner():\n        x = 2\n        return x\n    return inner\n";
        let (parsed, scopes) = module(source);
        let info = func_info(&parsed, &scopes, 0);
        assert!(!info.exports.contains("x"));
    }

    #[test]
    fn nested_free_names_propagate_past_nonbinding_scopes() {
        let source = "def a(x):\n    def b():\n        def c():\n            return x\n        return c\n    return b\n";
        let (parsed, scopes) = module(source);
        let info = func_info(&parsed, &scopes, 0);
        assert!(info.exports.contains("x"));
    }

    #[test]
    fn for_and_except_variables_are_locals() {
        let source = "def f(d):\n    for k in keys(d):\n        pass\n    try:\n        g()\n    except Error as e:\n        h(e)\n";
        let (parsed, scopes) = module(source);
        let info = func_info(&parsed, &scopes, 0);
        assert!(info.locals.contains("k"));
        assert!(info.locals.contains("e"));
        assert!(info.globals.contains("g"));
    }

    #[test]
    fn import_aliases_are_tracked() {
        let source = "from flash.display import Sprite as Sp\n";
        let (_, scopes) = module(source);
        assert!(scopes.module().imports.contains("Sp"));
    }

    #[test]
    fn package_decorated_defs_are_public() {
        let source = "@package('game')\nclass Main(Sprite):\n    pass\n\n@package('game')\ndef helper():\n    pass\n";
        let (_, scopes) = module(source);
        let publics = &scopes.module().publics;
        assert!(publics.contains(&("game".into(), "Main".into(), PropKind::Class)));
        assert!(publics.contains(&("game".into(), "helper".into(), PropKind::Function)));
    }

    #[test]
    fn class_slots_are_captured() {
        let source = "class P:\n    __slots__ = ('x', 'y', '__dict__')\n";
        let (parsed, scopes) = module(source);
        let info = match &parsed.body[0] {
            Stmt::ClassDef(c) => scopes.of(c.range().start().to_u32()),
            _ => unreachable!(),
        };
        assert_eq!(
            info.slots.as_deref(),
            Some(&["x".to_owned(), "y".to_owned(), "__dict__".to_owned()][..])
        );
    }

    #[test]
    fn class_names_are_exported_from_the_module() {
        let (_, scopes) = module("class A:\n    pass\n");
        assert!(scopes.module().exports.contains("A"));
        assert!(scopes.module().locals.contains("A"));
    }

    #[test]
    fn tuple_targets_bind_every_name() {
        let (parsed, scopes) = module("def f(p):\n    a, b = p\n    return a + b\n");
        let info = func_info(&parsed, &scopes, 0);
        assert!(info.locals.contains("a"));
        assert!(info.locals.contains("b"));
    }
}
