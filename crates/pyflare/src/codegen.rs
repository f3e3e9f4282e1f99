//! Code generation: walking the syntax tree and emitting bytecode.
//!
//! A [`CompileUnit`] owns everything produced for one source file: the
//! growing [`AbcFile`], the namespace-frame arena (parent scope chains are
//! vectors of frame indices, so nested fragments never borrow each other),
//! the line index, and the scope analysis. A [`CodeFragment`] builds one
//! method body: it carries the instruction list, the fragment's namespace
//! frame, the loop-label stack, the accumulated exception handlers, and a
//! pool of recyclable temporary registers.
//!
//! A fragment runs in one of six modes which fix the meaning of its
//! top-level names: `Global` (file top-level; exports become file-private
//! properties), `ClassBody` (runs once at class initialization; names are
//! class properties), `Method`/`Function` (parameters in registers,
//! closed-over locals in activation slots), and the `Eval`/`EvalChildFunc`
//! pair, where unknown names fall back to a dictionary scope pushed with
//! `pushwith`.

use std::collections::HashMap;

use indexmap::IndexMap;
use ruff_python_ast::{self as ast, Expr, Stmt};
use ruff_text_size::{Ranged, TextRange};

use crate::abc::{
    AbcFile, ClassId, ClassInfo, ConstValue, ExceptionHandler, InstanceFlags, InstanceInfo,
    Metadata, MethodBody, MethodFlags, MethodId, MethodInfo, Multiname, Namespace, Trait,
    TraitAttrs, TraitKind,
};
use crate::diagnostic::LineIndex;
use crate::error::{Error, Location, Result};
use crate::library::{ClassRecord, Library, MethodTrait, PropKind};
use crate::ops::{Label, LabelGen, Op, Reg};
use crate::scope::{self, ScopeInfo, ScopeMap};
use crate::verify;

/// Metadata entry name used for method annotations carried into the file.
pub const METADATA_NAME: &str = "pyflare";

/// How a name in scope resolves.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A local register.
    Register(Reg),
    /// `self` of a classmethod; calling it constructs through the class.
    ClsRegister(Reg),
    /// A slot in the heap activation object.
    ClosureSlot { index: u32, name: String },
    /// A property reached through the scope chain by qualified name.
    Property(Multiname),
    /// A property of the eval dictionary scope.
    LocalProperty(Multiname),
    /// An imported class.
    Class(Box<ClassRecord>),
    /// A class declared by this compilation.
    NewClass { qname: Multiname, class: ClassId },
    /// A module-level function declared by this compilation.
    NewFunction { qname: Multiname, method: MethodId },
    /// An instance method of the enclosing class body.
    Method {
        method: MethodId,
        ns: Namespace,
        metadata: Vec<(String, String)>,
    },
    /// A static method or classmethod of the enclosing class body.
    ClassMethod {
        method: MethodId,
        metadata: Vec<(String, String)>,
    },
    /// A compiler intrinsic.
    Builtin(Builtin),
    /// A compile-time constant.
    Const(ConstValue),
}

/// The recognized intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Range,
    Keys,
    Values,
    Items,
    Abs,
    Min,
    Max,
    Len,
    IsInstance,
}

impl Builtin {
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "range" => Builtin::Range,
            "keys" => Builtin::Keys,
            "values" => Builtin::Values,
            "items" => Builtin::Items,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "len" => Builtin::Len,
            "isinstance" => Builtin::IsInstance,
            _ => return None,
        })
    }
}

/// Arena of namespace frames. A fragment's lookup chain is a vector of
/// frame indices, own frame first, the global frame last.
#[derive(Default)]
pub struct Scopes {
    frames: Vec<IndexMap<String, Binding>>,
}

impl Scopes {
    pub fn new_frame(&mut self) -> usize {
        self.frames.push(IndexMap::new());
        self.frames.len() - 1
    }

    pub fn frame(&self, id: usize) -> &IndexMap<String, Binding> {
        &self.frames[id]
    }

    pub fn insert(&mut self, frame: usize, name: impl Into<String>, binding: Binding) {
        self.frames[frame].insert(name.into(), binding);
    }

    /// First frame along `chain` that binds `name`.
    pub fn lookup(&self, chain: &[usize], name: &str) -> Option<(usize, &Binding)> {
        for &frame in chain {
            if let Some(binding) = self.frames[frame].get(name) {
                return Some((frame, binding));
            }
        }
        None
    }
}

/// Everything produced while compiling one source file.
pub struct CompileUnit {
    pub abc: AbcFile,
    pub scopes: Scopes,
    /// Filename as written into `debugfile` and private namespaces.
    pub filename: String,
    /// Full path used in error locations.
    pub source_path: String,
    pub lines: LineIndex,
    pub scope_map: ScopeMap,
}

impl CompileUnit {
    pub fn new(source: &str, filename: String, source_path: String, scope_map: ScopeMap) -> Self {
        Self {
            abc: AbcFile::new(),
            scopes: Scopes::default(),
            filename,
            source_path,
            lines: LineIndex::new(source),
            scope_map,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Global,
    ClassBody,
    Method,
    Function,
    Eval,
    EvalChildFunc,
}

/// Register classes for the temporary pool. Integer loop counters get their
/// own class so `inclocal_i` always works on a register that only ever held
/// ints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RegClass {
    Any,
    Int,
}

/// Everything needed to start a fragment.
pub struct FragmentSpec {
    pub mode: Mode,
    pub parent_chain: Vec<usize>,
    /// Names by register position; `None` marks the receiver slot.
    pub arguments: Vec<Option<String>>,
    pub vararg: Option<String>,
    pub classmethod: bool,
    /// Enclosing class name, for `@debuginfo` expansion inside methods.
    pub enclosing_class: Option<String>,
    pub display_name: String,
    pub first_line: u32,
    pub info: ScopeInfo,
}

pub struct CodeFragment {
    ops: Vec<Op>,
    mode: Mode,
    frame: usize,
    chain: Vec<usize>,
    loop_stack: Vec<(Label, Label)>,
    exceptions: Vec<ExceptionHandler>,
    free_regs: HashMap<RegClass, Vec<Reg>>,
    labels: LabelGen,
    next_temp: u32,
    activation: Option<Reg>,
    arguments: Vec<Option<String>>,
    vararg: Option<String>,
    classmethod: bool,
    enclosing_class: Option<String>,
    display_name: String,
    current_line: Option<u32>,
}

impl CodeFragment {
    /// Compile `body` into a fragment. The fragment's namespace frame stays
    /// alive in the unit's arena after [`CodeFragment::finish`], which is
    /// how class bodies publish their members.
    pub fn compile(
        unit: &mut CompileUnit,
        lib: &mut Library,
        body: &[Stmt],
        spec: FragmentSpec,
    ) -> Result<Self> {
        let frame = unit.scopes.new_frame();
        let mut chain = vec![frame];
        chain.extend_from_slice(&spec.parent_chain);

        let mut frag = Self {
            ops: vec![
                Op::DebugFile(unit.filename.clone()),
                Op::DebugLine(spec.first_line),
                Op::GetLocal0,
                Op::PushScope,
            ],
            mode: spec.mode,
            frame,
            chain,
            loop_stack: Vec::new(),
            exceptions: Vec::new(),
            free_regs: HashMap::new(),
            labels: LabelGen::new(),
            next_temp: 0,
            activation: None,
            arguments: spec.arguments,
            vararg: spec.vararg,
            classmethod: spec.classmethod,
            enclosing_class: spec.enclosing_class,
            display_name: spec.display_name,
            current_line: Some(spec.first_line),
        };
        let info = spec.info;

        match frag.mode {
            Mode::ClassBody => {
                if !info.exports.is_empty() {
                    return Err(Error::Syntax {
                        message: format!(
                            "class-body name '{}' cannot be captured by a nested function",
                            info.exports.first().map(String::as_str).unwrap_or("")
                        ),
                        location: Location::new(unit.source_path.clone(), spec.first_line as usize, 0),
                    });
                }
                for name in &info.locals {
                    unit.scopes.insert(
                        frame,
                        name.clone(),
                        Binding::Property(Multiname::qname(name.clone())),
                    );
                }
            }
            Mode::Eval => {
                frag.emit(Op::GetLocal0);
                frag.emit(Op::PushWith);
                for name in &info.locals {
                    unit.scopes.insert(
                        frame,
                        name.clone(),
                        Binding::LocalProperty(Multiname::qname(name.clone())),
                    );
                }
            }
            _ => {
                for name in &info.locals {
                    if !info.exports.contains(name) {
                        let reg = frag.fresh_temp();
                        unit.scopes.insert(frame, name.clone(), Binding::Register(reg));
                    }
                }
            }
        }
        for name in &info.imports {
            unit.scopes.insert(
                frame,
                name.clone(),
                Binding::Property(Multiname::qname(name.clone())),
            );
        }
        if !info.exports.is_empty() {
            match frag.mode {
                Mode::Global => {
                    for name in &info.exports {
                        let qname = Multiname::QName {
                            ns: Namespace::Private(unit.filename.clone()),
                            name: name.clone(),
                        };
                        unit.scopes
                            .insert(frame, name.clone(), Binding::Property(qname));
                    }
                }
                Mode::Method | Mode::Function | Mode::EvalChildFunc => {
                    let act = frag.fresh_temp();
                    frag.activation = Some(act);
                    frag.emit(Op::NewActivation);
                    frag.emit(Op::Dup);
                    frag.emit(Op::PushScope);
                    frag.emit(Op::SetLocal(act));
                    for (index, name) in info.exports.iter().enumerate() {
                        unit.scopes.insert(
                            frame,
                            name.clone(),
                            Binding::ClosureSlot {
                                index: index as u32 + 1,
                                name: name.clone(),
                            },
                        );
                    }
                }
                Mode::Eval => {}
                Mode::ClassBody => unreachable!("rejected above"),
            }
        }

        // Bind parameters (and the vararg, which sits just past them).
        let params: Vec<(u32, String)> = frag
            .arguments
            .iter()
            .cloned()
            .chain(frag.vararg.clone().map(Some))
            .enumerate()
            .filter_map(|(i, name)| name.map(|n| (i as u32, n)))
            .collect();
        for (i, name) in params {
            if frag.mode == Mode::Eval {
                frag.emit(Op::GetLocal0);
                frag.emit(Op::GetLocal(Reg::Fixed(i)));
                frag.emit(Op::SetProperty(Multiname::qname(name)));
            } else if let Some(Binding::ClosureSlot { index, .. }) =
                unit.scopes.frame(frame).get(&name).cloned()
            {
                let act = frag.activation.expect("exports imply an activation");
                frag.emit(Op::GetLocal(act));
                frag.emit(Op::GetLocal(Reg::Fixed(i)));
                frag.emit(Op::SetSlot(index));
            } else {
                unit.scopes
                    .insert(frame, name, Binding::Register(Reg::Fixed(i)));
            }
        }
        if frag.classmethod {
            if let Some(Some(first)) = frag.arguments.first().cloned() {
                unit.scopes
                    .insert(frame, first, Binding::ClsRegister(Reg::Fixed(0)));
            }
        }

        for (pkg, name, kind) in &info.publics {
            lib.add_name(pkg, name, *kind);
        }

        if frag.mode == Mode::Eval {
            if let Some((last, rest)) = body.split_last() {
                frag.exec_suite(unit, lib, rest)?;
                if let Stmt::Expr(expr) = last {
                    let line = frag.stmt_line(unit, last);
                    frag.set_line(line);
                    frag.eval_expr(unit, lib, &expr.value, false)?;
                    frag.emit(Op::ReturnValue);
                } else {
                    frag.exec_stmt(unit, lib, last)?;
                }
            }
        } else {
            frag.exec_suite(unit, lib, body)?;
        }
        frag.emit(Op::ReturnVoid);
        Ok(frag)
    }

    /// Close the fragment: compact registers, verify the stack, and attach
    /// the method info and body to the file. Returns the method id and the
    /// fragment's namespace frame.
    pub fn finish(
        mut self,
        unit: &mut CompileUnit,
        options: Vec<ConstValue>,
    ) -> Result<(MethodId, usize)> {
        let mut reserved = self.arguments.len() as u32;
        if self.vararg.is_some() {
            reserved += 1;
        }
        let named: Vec<(String, Reg)> = unit
            .scopes
            .frame(self.frame)
            .iter()
            .filter_map(|(name, binding)| match binding {
                Binding::Register(reg @ Reg::Temp(_)) => Some((name.clone(), *reg)),
                _ => None,
            })
            .collect();
        let local_count = verify::compact_registers(&mut self.ops, reserved, &named);
        let limits = verify::verify(&self.ops, &self.display_name, 0)?;

        let mut flags = MethodFlags::empty();
        if self.activation.is_some() {
            flags |= MethodFlags::NEED_ACTIVATION;
        }
        if self.vararg.is_some() {
            flags |= MethodFlags::NEED_REST;
        }
        let param_count = self.arguments.len().saturating_sub(1);
        let method = unit.abc.add_method(MethodInfo {
            param_types: vec![Multiname::Any; param_count],
            return_type: Multiname::Any,
            name: self.display_name.clone(),
            flags,
            options,
            param_names: Vec::new(),
        });

        let mut traits = Vec::new();
        for (name, binding) in unit.scopes.frame(self.frame) {
            if let Binding::ClosureSlot { index, .. } = binding {
                traits.push(Trait::new(
                    Multiname::QName {
                        ns: Namespace::Private(unit.filename.clone()),
                        name: name.clone(),
                    },
                    TraitKind::Slot {
                        slot_id: *index,
                        type_name: Multiname::Any,
                        value: None,
                    },
                ));
            }
        }

        unit.abc.add_body(MethodBody {
            method,
            max_stack: limits.max_stack,
            local_count,
            init_scope_depth: 0,
            max_scope_depth: limits.max_scope_depth,
            code: self.ops,
            exceptions: self.exceptions,
            traits,
        });
        Ok((method, self.frame))
    }

    // ----------------------------------------------------------------
    // Small helpers
    // ----------------------------------------------------------------

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    fn fresh_temp(&mut self) -> Reg {
        self.next_temp += 1;
        Reg::Temp(self.next_temp)
    }

    fn get_extra_reg(&mut self, class: RegClass) -> Reg {
        match self.free_regs.get_mut(&class).and_then(Vec::pop) {
            Some(reg) => reg,
            None => self.fresh_temp(),
        }
    }

    fn free_extra_reg(&mut self, reg: Reg, class: RegClass) {
        self.emit(Op::Kill(reg));
        self.free_regs.entry(class).or_default().push(reg);
    }

    fn loc(&self, unit: &CompileUnit, range: TextRange) -> Location {
        let (line, column) = unit.lines.line_col(range.start().to_u32() as usize);
        Location::new(unit.source_path.clone(), line, column)
    }

    fn stmt_line(&self, unit: &CompileUnit, node: &impl Ranged) -> u32 {
        unit.lines.line(node.range().start().to_u32() as usize) as u32
    }

    fn set_line(&mut self, line: u32) {
        if self.current_line != Some(line) {
            self.emit(Op::DebugLine(line));
            self.current_line = Some(line);
        }
    }

    fn qpriv(&self, unit: &CompileUnit, name: &str) -> Multiname {
        Multiname::QName {
            ns: Namespace::Private(unit.filename.clone()),
            name: name.to_owned(),
        }
    }

    /// Resolve a name through the scope chain. Eval fragments invent a
    /// binding for unknown names instead of failing.
    fn find_name(
        &self,
        unit: &mut CompileUnit,
        name: &str,
        range: TextRange,
    ) -> Result<(usize, Binding)> {
        if let Some((frame, binding)) = unit.scopes.lookup(&self.chain, name) {
            return Ok((frame, binding.clone()));
        }
        match self.mode {
            Mode::Eval => {
                let binding = Binding::LocalProperty(Multiname::qname(name));
                unit.scopes.insert(self.frame, name, binding.clone());
                Ok((self.frame, binding))
            }
            Mode::EvalChildFunc => {
                let binding = Binding::Property(Multiname::qname(name));
                unit.scopes.insert(self.frame, name, binding.clone());
                Ok((self.frame, binding))
            }
            _ => Err(Error::Name {
                name: name.to_owned(),
                location: self.loc(unit, range),
            }),
        }
    }

    // ----------------------------------------------------------------
    // Statements
    // ----------------------------------------------------------------

    fn exec_suite(&mut self, unit: &mut CompileUnit, lib: &mut Library, body: &[Stmt]) -> Result<()> {
        for stmt in body {
            self.exec_stmt(unit, lib, stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, unit: &mut CompileUnit, lib: &mut Library, stmt: &Stmt) -> Result<()> {
        let line = self.stmt_line(unit, stmt);
        self.set_line(line);
        match stmt {
            Stmt::Expr(e) => self.eval_expr(unit, lib, &e.value, true),
            Stmt::Assign(assign) => self.visit_assign(unit, lib, assign),
            Stmt::AugAssign(aug) => self.visit_aug_assign(unit, lib, aug),
            Stmt::Delete(del) => {
                for target in &del.targets {
                    self.visit_delete(unit, lib, target)?;
                }
                Ok(())
            }
            Stmt::Return(ret) => {
                match &ret.value {
                    Some(value) => {
                        self.eval_expr(unit, lib, value, false)?;
                        self.emit(Op::ReturnValue);
                    }
                    None => self.emit(Op::ReturnVoid),
                }
                Ok(())
            }
            Stmt::Raise(raise) => self.visit_raise(unit, lib, raise),
            Stmt::If(if_stmt) => self.visit_if(unit, lib, if_stmt),
            Stmt::While(while_stmt) => self.visit_while(unit, lib, while_stmt),
            Stmt::For(for_stmt) => self.visit_for(unit, lib, for_stmt),
            Stmt::Try(try_stmt) => self.visit_try(unit, lib, try_stmt),
            Stmt::Break(b) => match self.loop_stack.last() {
                Some(&(_, break_label)) => {
                    self.emit(Op::Jump(break_label));
                    Ok(())
                }
                None => Err(Error::Syntax {
                    message: "'break' outside loop".into(),
                    location: self.loc(unit, b.range()),
                }),
            },
            Stmt::Continue(c) => match self.loop_stack.last() {
                Some(&(continue_label, _)) => {
                    self.emit(Op::Jump(continue_label));
                    Ok(())
                }
                None => Err(Error::Syntax {
                    message: "'continue' outside loop".into(),
                    location: self.loc(unit, c.range()),
                }),
            },
            Stmt::FunctionDef(func) => self.visit_function(unit, lib, func),
            Stmt::ClassDef(class) => self.visit_class(unit, lib, class),
            Stmt::ImportFrom(import) => self.visit_import(unit, lib, import),
            Stmt::Pass(_) => Ok(()),
            other => Err(Error::Syntax {
                message: "statement is not supported by this language subset".into(),
                location: self.loc(unit, other.range()),
            }),
        }
    }

    fn visit_raise(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        raise: &ast::StmtRaise,
    ) -> Result<()> {
        match &raise.exc {
            Some(exc) => {
                self.eval_expr(unit, lib, exc, false)?;
                self.emit(Op::Throw);
                Ok(())
            }
            None => Err(Error::Syntax {
                message: "bare 'raise' is not supported".into(),
                location: self.loc(unit, raise.range()),
            }),
        }
    }

    fn visit_import(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        import: &ast::StmtImportFrom,
    ) -> Result<()> {
        let package = match &import.module {
            Some(module) => module.to_string(),
            None => {
                return Err(Error::Syntax {
                    message: "relative imports are not supported".into(),
                    location: self.loc(unit, import.range()),
                })
            }
        };
        for alias in &import.names {
            let name = alias.name.to_string();
            let bound = alias
                .asname
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| name.clone());
            match lib.property_type(&package, &name) {
                Some(PropKind::Class) => {
                    let record = lib.get_class(&package, &name).cloned().ok_or_else(|| {
                        Error::Import {
                            name: format!("{package}:{name}"),
                            location: self.loc(unit, alias.range()),
                        }
                    })?;
                    unit.scopes
                        .insert(self.frame, bound, Binding::Class(Box::new(record)));
                }
                Some(PropKind::Function) => {
                    unit.scopes.insert(
                        self.frame,
                        bound,
                        Binding::Property(Multiname::package(package.clone(), name)),
                    );
                }
                None => {
                    return Err(Error::Import {
                        name: format!("{package}:{name}"),
                        location: self.loc(unit, alias.range()),
                    })
                }
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Assignment protocol
    // ----------------------------------------------------------------

    /// Emit an assignment: the target's preamble, the old value for an
    /// augmented assignment, the right-hand side via `rhs`, the augmenting
    /// operator, and the store.
    fn assign(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        target: &Expr,
        aug: Option<Op>,
        rhs: impl FnOnce(&mut Self, &mut CompileUnit, &mut Library) -> Result<()>,
    ) -> Result<()> {
        match target {
            Expr::Name(name_expr) => {
                self.assign_name(unit, lib, name_expr.id.as_str(), name_expr.range(), aug, rhs)?;
            }
            Expr::Attribute(attr) => {
                self.eval_expr(unit, lib, &attr.value, false)?;
                let qname = Multiname::qname(attr.attr.as_str());
                if let Some(op) = &aug {
                    self.emit(Op::Dup);
                    self.emit(Op::GetProperty(qname.clone()));
                    rhs(self, unit, lib)?;
                    self.emit(op.clone());
                } else {
                    rhs(self, unit, lib)?;
                }
                self.emit(Op::SetProperty(qname));
            }
            Expr::Subscript(sub) => {
                if aug.is_some() {
                    return Err(Error::Syntax {
                        message: "augmented assignment to a subscript is not supported".into(),
                        location: self.loc(unit, sub.range()),
                    });
                }
                self.eval_expr(unit, lib, &sub.value, false)?;
                self.eval_expr(unit, lib, &sub.slice, false)?;
                rhs(self, unit, lib)?;
                self.emit(Op::SetProperty(Multiname::subscript()));
            }
            Expr::Tuple(tuple) => {
                if aug.is_some() {
                    return Err(Error::Syntax {
                        message: "augmented assignment to a tuple is not supported".into(),
                        location: self.loc(unit, tuple.range()),
                    });
                }
                rhs(self, unit, lib)?;
                let count = tuple.elts.len();
                for (index, elt) in tuple.elts.iter().enumerate() {
                    if index < count - 1 {
                        self.emit(Op::Dup);
                    }
                    self.emit(Op::PushByte(index as u8));
                    self.emit(Op::GetProperty(Multiname::subscript()));
                    self.assign_tos(unit, lib, elt)?;
                }
            }
            other => {
                return Err(Error::Syntax {
                    message: "assignment target is not supported".into(),
                    location: self.loc(unit, other.range()),
                })
            }
        }
        Ok(())
    }

    /// The assignment protocol for a target known only by name: preamble,
    /// the old value for an augmented form, the right-hand side, the store.
    fn assign_name(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        name: &str,
        range: TextRange,
        aug: Option<Op>,
        rhs: impl FnOnce(&mut Self, &mut CompileUnit, &mut Library) -> Result<()>,
    ) -> Result<()> {
        let (_, binding) = self.find_name(unit, name, range)?;
        match binding {
            Binding::Register(reg) => {
                if let Some(op) = &aug {
                    self.emit(Op::GetLocal(reg));
                    rhs(self, unit, lib)?;
                    self.emit(op.clone());
                } else {
                    rhs(self, unit, lib)?;
                }
                self.emit(Op::CoerceA);
                self.emit(Op::SetLocal(reg));
            }
            Binding::ClosureSlot { index, .. } => {
                let act = self.activation.expect("closure slot without activation");
                self.emit(Op::GetLocal(act));
                if let Some(op) = &aug {
                    self.emit(Op::Dup);
                    self.emit(Op::GetSlot(index));
                    rhs(self, unit, lib)?;
                    self.emit(op.clone());
                } else {
                    rhs(self, unit, lib)?;
                }
                self.emit(Op::CoerceA);
                self.emit(Op::SetSlot(index));
            }
            Binding::Property(qname)
            | Binding::NewClass { qname, .. }
            | Binding::NewFunction { qname, .. } => {
                if aug.is_some() {
                    return Err(Error::Syntax {
                        message: format!(
                            "augmented assignment to property '{name}' is not supported"
                        ),
                        location: self.loc(unit, range),
                    });
                }
                self.emit(Op::GetScopeObject(0));
                rhs(self, unit, lib)?;
                self.emit(Op::CoerceA);
                self.emit(Op::InitProperty(qname));
            }
            Binding::LocalProperty(qname) => {
                if aug.is_some() {
                    return Err(Error::Syntax {
                        message: format!(
                            "augmented assignment to '{name}' in eval scope is not supported"
                        ),
                        location: self.loc(unit, range),
                    });
                }
                self.assign_local_property(unit, lib, qname, rhs)?;
            }
            _ => {
                return Err(Error::Syntax {
                    message: format!("cannot assign to '{name}'"),
                    location: self.loc(unit, range),
                })
            }
        }
        Ok(())
    }

    /// Store the value already on top of the stack into the named binding.
    fn assign_tos_name(&mut self, unit: &mut CompileUnit, name: &str, range: TextRange) -> Result<()> {
        let (_, binding) = self.find_name(unit, name, range)?;
        match binding {
            Binding::Register(reg) => {
                self.emit(Op::CoerceA);
                self.emit(Op::SetLocal(reg));
            }
            Binding::ClosureSlot { index, .. } => {
                let act = self.activation.expect("closure slot without activation");
                self.emit(Op::GetLocal(act));
                self.emit(Op::Swap);
                self.emit(Op::CoerceA);
                self.emit(Op::SetSlot(index));
            }
            Binding::Property(qname) => {
                self.emit(Op::GetScopeObject(0));
                self.emit(Op::Swap);
                self.emit(Op::CoerceA);
                self.emit(Op::InitProperty(qname));
            }
            _ => {
                return Err(Error::Syntax {
                    message: format!("cannot assign to '{name}'"),
                    location: self.loc(unit, range),
                })
            }
        }
        Ok(())
    }

    /// Store the value already on top of the stack into `target`.
    fn assign_tos(&mut self, unit: &mut CompileUnit, lib: &mut Library, target: &Expr) -> Result<()> {
        match target {
            Expr::Name(name_expr) => {
                self.assign_tos_name(unit, name_expr.id.as_str(), name_expr.range())?;
            }
            Expr::Attribute(attr) => {
                self.eval_expr(unit, lib, &attr.value, false)?;
                self.emit(Op::Swap);
                self.emit(Op::SetProperty(Multiname::qname(attr.attr.as_str())));
            }
            Expr::Tuple(tuple) => {
                let count = tuple.elts.len();
                for (index, elt) in tuple.elts.iter().enumerate() {
                    if index < count - 1 {
                        self.emit(Op::Dup);
                    }
                    self.emit(Op::PushByte(index as u8));
                    self.emit(Op::GetProperty(Multiname::subscript()));
                    self.assign_tos(unit, lib, elt)?;
                }
            }
            other => {
                return Err(Error::Syntax {
                    message: "assignment target is not supported".into(),
                    location: self.loc(unit, other.range()),
                })
            }
        }
        Ok(())
    }

    /// Assignment to an eval-scope name: probe the scope chain for the
    /// property under a `ReferenceError` guard; a hit captures the owning
    /// scope object, a miss falls back to the local dictionary scope.
    fn assign_local_property(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        qname: Multiname,
        rhs: impl FnOnce(&mut Self, &mut CompileUnit, &mut Library) -> Result<()>,
    ) -> Result<()> {
        let extra = self.get_extra_reg(RegClass::Any);
        let start = self.fresh_label();
        let end_try = self.fresh_label();
        let end_catch = self.fresh_label();
        self.exceptions.push(ExceptionHandler {
            from: start,
            to: end_try,
            target: end_try,
            exc_type: Multiname::qname("ReferenceError"),
            var_name: None,
        });
        let exc_index = self.exceptions.len() as u32 - 1;
        self.emit(Op::Mark(start));
        self.emit(Op::FindPropStrict(qname.clone()));
        self.emit(Op::CoerceA);
        self.emit(Op::SetLocal(extra));
        self.emit(Op::Jump(end_catch));
        self.emit(Op::Mark(end_try));
        self.emit(Op::GetLocal0);
        self.emit(Op::PushScope);
        self.emit(Op::GetLocal0);
        self.emit(Op::PushWith);
        self.emit(Op::NewCatch(exc_index));
        self.emit(Op::Pop);
        self.emit(Op::Pop);
        self.emit(Op::GetLocal0);
        self.emit(Op::CoerceA);
        self.emit(Op::SetLocal(extra));
        self.emit(Op::Mark(end_catch));
        self.emit(Op::GetLocal(extra));
        rhs(self, unit, lib)?;
        self.emit(Op::CoerceA);
        self.emit(Op::SetProperty(qname));
        self.free_extra_reg(extra, RegClass::Any);
        Ok(())
    }

    fn visit_assign(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        assign: &ast::StmtAssign,
    ) -> Result<()> {
        let target = match assign.targets.as_slice() {
            [single] => single,
            _ => {
                return Err(Error::Syntax {
                    message: "chained assignment is not supported".into(),
                    location: self.loc(unit, assign.range()),
                })
            }
        };
        // `__slots__` is consumed by the scope analyzer, not executed.
        if self.mode == Mode::ClassBody {
            if let Expr::Name(name) = target {
                if name.id.as_str() == "__slots__" {
                    return Ok(());
                }
            }
        }
        self.assign(unit, lib, target, None, |frag, unit, lib| {
            frag.eval_expr(unit, lib, &assign.value, false)
        })
    }

    fn visit_aug_assign(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        aug: &ast::StmtAugAssign,
    ) -> Result<()> {
        let op = match aug.op {
            ast::Operator::Add => Op::Add,
            ast::Operator::Sub => Op::Subtract,
            ast::Operator::Mult => Op::Multiply,
            ast::Operator::Div => Op::Divide,
            ast::Operator::Mod => Op::Modulo,
            _ => {
                return Err(Error::Syntax {
                    message: "augmented operator is not supported".into(),
                    location: self.loc(unit, aug.range()),
                })
            }
        };
        self.assign(unit, lib, &aug.target, Some(op), |frag, unit, lib| {
            frag.eval_expr(unit, lib, &aug.value, false)
        })
    }

    fn visit_delete(&mut self, unit: &mut CompileUnit, lib: &mut Library, target: &Expr) -> Result<()> {
        match target {
            Expr::Name(name_expr) => {
                let name = name_expr.id.as_str();
                let (_, binding) = self.find_name(unit, name, name_expr.range())?;
                match binding {
                    Binding::ClosureSlot { index, .. } => {
                        let act = self.activation.expect("closure slot without activation");
                        self.emit(Op::GetLocal(act));
                        self.emit(Op::PushUndefined);
                        self.emit(Op::SetSlot(index));
                    }
                    Binding::Property(qname) | Binding::LocalProperty(qname) => {
                        self.emit(Op::GetScopeObject(0));
                        self.emit(Op::DeleteProperty(qname));
                        self.emit(Op::Pop);
                    }
                    Binding::Register(reg) => self.emit(Op::Kill(reg)),
                    _ => {
                        return Err(Error::Syntax {
                            message: format!("cannot delete '{name}'"),
                            location: self.loc(unit, name_expr.range()),
                        })
                    }
                }
            }
            Expr::Attribute(attr) => {
                self.eval_expr(unit, lib, &attr.value, false)?;
                self.emit(Op::DeleteProperty(Multiname::qname(attr.attr.as_str())));
                self.emit(Op::Pop);
            }
            Expr::Subscript(sub) => {
                self.eval_expr(unit, lib, &sub.value, false)?;
                self.eval_expr(unit, lib, &sub.slice, false)?;
                self.emit(Op::DeleteProperty(Multiname::subscript()));
                self.emit(Op::Pop);
            }
            Expr::Tuple(tuple) => {
                for elt in &tuple.elts {
                    self.visit_delete(unit, lib, elt)?;
                }
            }
            other => {
                return Err(Error::Syntax {
                    message: "cannot delete this expression".into(),
                    location: self.loc(unit, other.range()),
                })
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Control flow
    // ----------------------------------------------------------------

    fn visit_if(&mut self, unit: &mut CompileUnit, lib: &mut Library, if_stmt: &ast::StmtIf) -> Result<()> {
        let end = self.fresh_label();
        let mut arms: Vec<(Option<&Expr>, &[Stmt])> =
            vec![(Some(&*if_stmt.test), if_stmt.body.as_slice())];
        for clause in &if_stmt.elif_else_clauses {
            arms.push((clause.test.as_ref(), clause.body.as_slice()));
        }
        for (test, body) in arms {
            match test {
                Some(test) => {
                    self.eval_expr(unit, lib, test, false)?;
                    let next = self.fresh_label();
                    self.emit(Op::IfFalse(next));
                    self.exec_suite(unit, lib, body)?;
                    self.emit(Op::Jump(end));
                    self.emit(Op::Mark(next));
                }
                None => {
                    self.exec_suite(unit, lib, body)?;
                }
            }
        }
        self.emit(Op::Mark(end));
        Ok(())
    }

    fn visit_ternary(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        ifexp: &ast::ExprIf,
        void: bool,
    ) -> Result<()> {
        let end = self.fresh_label();
        let alt = self.fresh_label();
        self.eval_expr(unit, lib, &ifexp.test, false)?;
        self.emit(Op::IfFalse(alt));
        self.eval_expr(unit, lib, &ifexp.body, false)?;
        self.emit(Op::CoerceA);
        self.emit(Op::Jump(end));
        // Unreachable; keeps the linear stack model balanced across the arm
        // boundary.
        self.emit(Op::Pop);
        self.emit(Op::Mark(alt));
        self.eval_expr(unit, lib, &ifexp.orelse, false)?;
        self.emit(Op::CoerceA);
        self.emit(Op::Mark(end));
        if void {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn visit_while(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        while_stmt: &ast::StmtWhile,
    ) -> Result<()> {
        let continue_label = self.fresh_label();
        let else_label = self.fresh_label();
        let end = self.fresh_label();
        self.emit(Op::Label(continue_label));
        self.eval_expr(unit, lib, &while_stmt.test, false)?;
        self.emit(Op::IfFalse(else_label));
        self.loop_stack.push((continue_label, end));
        self.exec_suite(unit, lib, &while_stmt.body)?;
        self.loop_stack.pop();
        self.emit(Op::Jump(continue_label));
        self.emit(Op::Mark(else_label));
        self.exec_suite(unit, lib, &while_stmt.orelse)?;
        self.emit(Op::Mark(end));
        Ok(())
    }

    fn visit_for(&mut self, unit: &mut CompileUnit, lib: &mut Library, for_stmt: &ast::StmtFor) -> Result<()> {
        const MESSAGE: &str = "for loops iterate over range(), keys(), values() or items()";
        let call = match for_stmt.iter.as_ref() {
            Expr::Call(call) => call,
            other => {
                return Err(Error::Syntax {
                    message: MESSAGE.into(),
                    location: self.loc(unit, other.range()),
                })
            }
        };
        let func_name = match call.func.as_ref() {
            Expr::Name(name) => name,
            other => {
                return Err(Error::Syntax {
                    message: MESSAGE.into(),
                    location: self.loc(unit, other.range()),
                })
            }
        };
        let (_, binding) = self.find_name(unit, func_name.id.as_str(), func_name.range())?;
        match binding {
            Binding::Builtin(Builtin::Range) => self.loop_range(unit, lib, for_stmt, call),
            Binding::Builtin(Builtin::Keys) => {
                self.loop_objectiter(unit, lib, for_stmt, call, IterKind::Keys)
            }
            Binding::Builtin(Builtin::Values) => {
                self.loop_objectiter(unit, lib, for_stmt, call, IterKind::Values)
            }
            Binding::Builtin(Builtin::Items) => {
                self.loop_objectiter(unit, lib, for_stmt, call, IterKind::Items)
            }
            _ => Err(Error::Syntax {
                message: MESSAGE.into(),
                location: self.loc(unit, for_stmt.iter.range()),
            }),
        }
    }

    fn loop_range(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        for_stmt: &ast::StmtFor,
        call: &ast::ExprCall,
    ) -> Result<()> {
        enum Step {
            One,
            Const(i64),
            Dynamic,
        }

        let args = &call.arguments.args;
        if args.is_empty() || args.len() > 3 {
            return Err(Error::Syntax {
                message: "range() takes one to three arguments".into(),
                location: self.loc(unit, call.range()),
            });
        }
        let (start, stop) = if args.len() == 1 {
            (None, &args[0])
        } else {
            (Some(&args[0]), &args[1])
        };
        // A literal step (possibly negated) has a known direction; anything
        // else needs the runtime sign check.
        fn const_int(expr: &Expr) -> Option<i64> {
            match expr {
                Expr::NumberLiteral(n) => match &n.value {
                    ast::Number::Int(i) => i.as_i64(),
                    _ => None,
                },
                Expr::UnaryOp(unary) if unary.op == ast::UnaryOp::USub => {
                    const_int(&unary.operand).map(|v| -v)
                }
                _ => None,
            }
        }
        let step = if args.len() == 3 {
            match const_int(&args[2]) {
                Some(1) => Step::One,
                Some(0) => {
                    return Err(Error::Syntax {
                        message: "range() step cannot be zero".into(),
                        location: self.loc(unit, args[2].range()),
                    })
                }
                Some(v) => Step::Const(v),
                None => Step::Dynamic,
            }
        } else {
            Step::One
        };

        let line = self.stmt_line(unit, for_stmt);
        let end = self.fresh_label();
        let else_label = self.fresh_label();
        let body_label = self.fresh_label();
        let continue_label = self.fresh_label();
        let cond_label = self.fresh_label();

        let step_reg = self.get_extra_reg(RegClass::Int);
        let iter_reg = self.get_extra_reg(RegClass::Int);
        let stop_reg = self.get_extra_reg(RegClass::Int);

        match start {
            Some(start) => self.eval_expr(unit, lib, start, false)?,
            None => self.emit(Op::PushByte(0)),
        }
        self.emit(Op::ConvertI);
        self.emit(Op::SetLocal(iter_reg));
        self.eval_expr(unit, lib, stop, false)?;
        self.emit(Op::ConvertI);
        self.emit(Op::SetLocal(stop_reg));
        if !matches!(step, Step::One) {
            self.eval_expr(unit, lib, &args[2], false)?;
            self.emit(Op::ConvertI);
            self.emit(Op::SetLocal(step_reg));
        }
        self.emit(Op::Jump(cond_label));
        self.emit(Op::Label(body_label));
        self.assign(unit, lib, &for_stmt.target, None, move |frag, _, _| {
            frag.emit(Op::GetLocal(iter_reg));
            Ok(())
        })?;
        self.loop_stack.push((continue_label, end));
        self.exec_suite(unit, lib, &for_stmt.body)?;
        self.loop_stack.pop();
        self.emit(Op::Mark(continue_label));
        self.emit(Op::DebugLine(line));
        match &step {
            Step::One => self.emit(Op::IncLocalI(iter_reg)),
            _ => {
                self.emit(Op::GetLocal(iter_reg));
                self.emit(Op::GetLocal(step_reg));
                self.emit(Op::AddI);
                self.emit(Op::SetLocal(iter_reg));
            }
        }
        self.emit(Op::Mark(cond_label));
        self.emit(Op::DebugLine(line));
        match &step {
            Step::One => {
                self.emit(Op::GetLocal(iter_reg));
                self.emit(Op::GetLocal(stop_reg));
                self.emit(Op::IfLt(body_label));
            }
            Step::Const(v) => {
                self.emit(Op::GetLocal(iter_reg));
                self.emit(Op::GetLocal(stop_reg));
                if *v > 0 {
                    self.emit(Op::IfLt(body_label));
                } else {
                    self.emit(Op::IfGt(body_label));
                }
            }
            Step::Dynamic => {
                // Direction is only known at run time: test the step's sign.
                let negative = self.fresh_label();
                self.emit(Op::PushByte(0));
                self.emit(Op::GetLocal(step_reg));
                self.emit(Op::IfGt(negative));
                self.emit(Op::GetLocal(iter_reg));
                self.emit(Op::GetLocal(stop_reg));
                self.emit(Op::IfLt(body_label));
                self.emit(Op::Jump(else_label));
                self.emit(Op::Mark(negative));
                self.emit(Op::GetLocal(iter_reg));
                self.emit(Op::GetLocal(stop_reg));
                self.emit(Op::IfGt(body_label));
            }
        }
        self.emit(Op::Mark(else_label));
        self.exec_suite(unit, lib, &for_stmt.orelse)?;
        self.emit(Op::Mark(end));
        self.free_extra_reg(stop_reg, RegClass::Int);
        self.free_extra_reg(iter_reg, RegClass::Int);
        self.free_extra_reg(step_reg, RegClass::Int);
        Ok(())
    }

    fn loop_objectiter(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        for_stmt: &ast::StmtFor,
        call: &ast::ExprCall,
        kind: IterKind,
    ) -> Result<()> {
        let args = &call.arguments.args;
        if args.len() != 1 {
            return Err(Error::Syntax {
                message: "iterator builtins take exactly one argument".into(),
                location: self.loc(unit, call.range()),
            });
        }
        let end = self.fresh_label();
        let else_label = self.fresh_label();
        let continue_label = self.fresh_label();
        let body_label = self.fresh_label();

        let obj_reg = self.get_extra_reg(RegClass::Any);
        let index_reg = self.get_extra_reg(RegClass::Int);

        self.eval_expr(unit, lib, &args[0], false)?;
        self.emit(Op::CoerceA);
        self.emit(Op::SetLocal(obj_reg));
        self.emit(Op::PushByte(0));
        self.emit(Op::SetLocal(index_reg));
        self.emit(Op::Jump(continue_label));
        self.emit(Op::Label(body_label));
        match kind {
            IterKind::Keys | IterKind::Values => {
                let next = if kind == IterKind::Keys {
                    Op::NextName
                } else {
                    Op::NextValue
                };
                self.assign(unit, lib, &for_stmt.target, None, move |frag, _, _| {
                    frag.emit(Op::GetLocal(obj_reg));
                    frag.emit(Op::GetLocal(index_reg));
                    frag.emit(next);
                    Ok(())
                })?;
            }
            IterKind::Items => {
                let (key_target, value_target) = match for_stmt.target.as_ref() {
                    Expr::Tuple(tuple) if tuple.elts.len() == 2 => (&tuple.elts[0], &tuple.elts[1]),
                    other => {
                        return Err(Error::Syntax {
                            message: "items() unpacks into exactly two targets".into(),
                            location: self.loc(unit, other.range()),
                        })
                    }
                };
                self.assign(unit, lib, key_target, None, |frag, _, _| {
                    frag.emit(Op::GetLocal(obj_reg));
                    frag.emit(Op::GetLocal(index_reg));
                    frag.emit(Op::NextName);
                    Ok(())
                })?;
                self.assign(unit, lib, value_target, None, |frag, _, _| {
                    frag.emit(Op::GetLocal(obj_reg));
                    frag.emit(Op::GetLocal(index_reg));
                    frag.emit(Op::NextValue);
                    Ok(())
                })?;
            }
        }
        self.loop_stack.push((continue_label, end));
        self.exec_suite(unit, lib, &for_stmt.body)?;
        self.loop_stack.pop();
        self.emit(Op::Mark(continue_label));
        self.emit(Op::HasNext2 {
            object: obj_reg,
            index: index_reg,
        });
        self.emit(Op::IfTrue(body_label));
        self.emit(Op::Mark(else_label));
        self.exec_suite(unit, lib, &for_stmt.orelse)?;
        self.emit(Op::Mark(end));
        self.free_extra_reg(index_reg, RegClass::Int);
        self.free_extra_reg(obj_reg, RegClass::Any);
        Ok(())
    }

    fn visit_try(&mut self, unit: &mut CompileUnit, lib: &mut Library, try_stmt: &ast::StmtTry) -> Result<()> {
        if !try_stmt.finalbody.is_empty() {
            return Err(Error::Syntax {
                message: "'finally' is not supported".into(),
                location: self.loc(unit, try_stmt.range()),
            });
        }
        let start = self.fresh_label();
        let end_body = self.fresh_label();
        let else_label = self.fresh_label();
        let end = self.fresh_label();

        self.emit(Op::Mark(start));
        self.exec_suite(unit, lib, &try_stmt.body)?;
        self.emit(Op::Mark(end_body));
        self.emit(Op::Jump(else_label));

        for handler in &try_stmt.handlers {
            let ast::ExceptHandler::ExceptHandler(h) = handler;
            let catch_label = self.fresh_label();
            let exc_type = match &h.type_ {
                Some(type_expr) => {
                    let name = match type_expr.as_ref() {
                        Expr::Name(name) => name,
                        other => {
                            return Err(Error::Syntax {
                                message: "exception type must be a class name".into(),
                                location: self.loc(unit, other.range()),
                            })
                        }
                    };
                    let (_, binding) = self.find_name(unit, name.id.as_str(), name.range())?;
                    match binding {
                        Binding::Class(record) => record.name.clone(),
                        Binding::NewClass { qname, .. } => qname,
                        _ => {
                            return Err(Error::NotAClass {
                                name: name.id.to_string(),
                                location: self.loc(unit, name.range()),
                            })
                        }
                    }
                }
                None => Multiname::Any,
            };
            let var_name = h.name.as_ref().map(|n| Multiname::qname(n.as_str()));
            self.exceptions.push(ExceptionHandler {
                from: start,
                to: end_body,
                target: catch_label,
                exc_type,
                var_name,
            });
            let exc_index = self.exceptions.len() as u32 - 1;

            self.emit(Op::Mark(catch_label));
            self.emit(Op::GetLocal0);
            self.emit(Op::PushScope);
            if let Some(act) = self.activation {
                self.emit(Op::GetLocal(act));
                self.emit(Op::PushScope);
            }
            self.emit(Op::NewCatch(exc_index));
            self.emit(Op::Pop);
            match &h.name {
                Some(var) => self.assign_tos_name(unit, var.as_str(), var.range())?,
                None => self.emit(Op::Pop),
            }
            self.exec_suite(unit, lib, &h.body)?;
            self.emit(Op::Jump(end));
        }
        self.emit(Op::Mark(else_label));
        self.exec_suite(unit, lib, &try_stmt.orelse)?;
        self.emit(Op::Mark(end));
        Ok(())
    }

    // ----------------------------------------------------------------
    // Expressions
    // ----------------------------------------------------------------

    fn eval_expr(&mut self, unit: &mut CompileUnit, lib: &mut Library, expr: &Expr, void: bool) -> Result<()> {
        match expr {
            Expr::NumberLiteral(n) => {
                if !void {
                    self.push_number(unit, n)?;
                }
            }
            Expr::StringLiteral(s) => {
                if !void {
                    self.emit(Op::PushString(s.value.to_string()));
                }
            }
            Expr::BooleanLiteral(b) => {
                if !void {
                    self.emit(if b.value { Op::PushTrue } else { Op::PushFalse });
                }
            }
            Expr::NoneLiteral(_) => {
                if !void {
                    self.emit(Op::PushNull);
                }
            }
            Expr::Name(name) => {
                if !void {
                    self.visit_varname(unit, name)?;
                }
            }
            Expr::Attribute(attr) => {
                if !void {
                    self.eval_expr(unit, lib, &attr.value, false)?;
                    self.emit(Op::GetProperty(Multiname::qname(attr.attr.as_str())));
                }
            }
            Expr::Subscript(sub) => {
                if !void {
                    self.eval_expr(unit, lib, &sub.value, false)?;
                    self.eval_expr(unit, lib, &sub.slice, false)?;
                    self.emit(Op::GetProperty(Multiname::subscript()));
                }
            }
            Expr::Call(call) => self.visit_call(unit, lib, call, void)?,
            Expr::BinOp(binop) => {
                let op = match binop.op {
                    ast::Operator::Add => Op::Add,
                    ast::Operator::Sub => Op::Subtract,
                    ast::Operator::Mult => Op::Multiply,
                    ast::Operator::Div => Op::Divide,
                    ast::Operator::Mod => Op::Modulo,
                    _ => {
                        return Err(Error::Syntax {
                            message: "binary operator is not supported".into(),
                            location: self.loc(unit, binop.range()),
                        })
                    }
                };
                if void {
                    self.eval_expr(unit, lib, &binop.left, true)?;
                    self.eval_expr(unit, lib, &binop.right, true)?;
                } else {
                    self.eval_expr(unit, lib, &binop.left, false)?;
                    self.eval_expr(unit, lib, &binop.right, false)?;
                    self.emit(op);
                }
            }
            Expr::UnaryOp(unary) => match unary.op {
                ast::UnaryOp::Not => {
                    if void {
                        self.eval_expr(unit, lib, &unary.operand, true)?;
                    } else {
                        self.eval_expr(unit, lib, &unary.operand, false)?;
                        self.emit(Op::Not);
                    }
                }
                ast::UnaryOp::USub => {
                    if void {
                        self.eval_expr(unit, lib, &unary.operand, true)?;
                    } else {
                        self.eval_expr(unit, lib, &unary.operand, false)?;
                        self.emit(Op::Negate);
                    }
                }
                _ => {
                    return Err(Error::Syntax {
                        message: "unary operator is not supported".into(),
                        location: self.loc(unit, unary.range()),
                    })
                }
            },
            Expr::Compare(cmp) => self.visit_compare(unit, lib, cmp, void)?,
            Expr::BoolOp(boolop) => self.visit_boolop(unit, lib, boolop, void)?,
            Expr::If(ifexp) => self.visit_ternary(unit, lib, ifexp, void)?,
            Expr::List(list) => {
                if void {
                    for elt in &list.elts {
                        self.eval_expr(unit, lib, elt, true)?;
                    }
                } else {
                    for elt in &list.elts {
                        self.eval_expr(unit, lib, elt, false)?;
                    }
                    self.emit(Op::NewArray {
                        num_args: list.elts.len() as u32,
                    });
                }
            }
            Expr::Tuple(tuple) => {
                if void {
                    for elt in &tuple.elts {
                        self.eval_expr(unit, lib, elt, true)?;
                    }
                } else {
                    for elt in &tuple.elts {
                        self.eval_expr(unit, lib, elt, false)?;
                    }
                    self.emit(Op::NewArray {
                        num_args: tuple.elts.len() as u32,
                    });
                }
            }
            Expr::Dict(dict) => {
                if void {
                    for item in &dict.items {
                        if let Some(key) = &item.key {
                            self.eval_expr(unit, lib, key, true)?;
                        }
                        self.eval_expr(unit, lib, &item.value, true)?;
                    }
                } else {
                    for item in &dict.items {
                        let key = item.key.as_ref().ok_or_else(|| Error::Syntax {
                            message: "dict unpacking is not supported".into(),
                            location: self.loc(unit, item.value.range()),
                        })?;
                        self.eval_expr(unit, lib, key, false)?;
                        self.eval_expr(unit, lib, &item.value, false)?;
                    }
                    self.emit(Op::NewObject {
                        num_args: dict.items.len() as u32,
                    });
                }
            }
            other => {
                return Err(Error::Syntax {
                    message: "expression is not supported by this language subset".into(),
                    location: self.loc(unit, other.range()),
                })
            }
        }
        Ok(())
    }

    fn push_number(&mut self, unit: &CompileUnit, n: &ast::ExprNumberLiteral) -> Result<()> {
        match &n.value {
            ast::Number::Int(int) => match int.as_i64() {
                Some(v) if (0..128).contains(&v) => self.emit(Op::PushByte(v as u8)),
                Some(v) if (0..65536).contains(&v) => self.emit(Op::PushShort(v as u32)),
                Some(v) if i32::try_from(v).is_ok() => self.emit(Op::PushInt(v as i32)),
                _ => {
                    return Err(Error::Syntax {
                        message: "integer literal out of range".into(),
                        location: self.loc(unit, n.range()),
                    })
                }
            },
            ast::Number::Float(f) => self.emit(Op::PushDouble(*f)),
            ast::Number::Complex { .. } => {
                return Err(Error::Syntax {
                    message: "complex literals are not supported".into(),
                    location: self.loc(unit, n.range()),
                })
            }
        }
        Ok(())
    }

    fn visit_varname(&mut self, unit: &mut CompileUnit, name_expr: &ast::ExprName) -> Result<()> {
        let name = name_expr.id.as_str();
        let (frame, binding) = self.find_name(unit, name, name_expr.range())?;
        match binding {
            Binding::Const(value) => self.emit(match value {
                ConstValue::True => Op::PushTrue,
                ConstValue::False => Op::PushFalse,
                ConstValue::Null => Op::PushNull,
                _ => Op::PushUndefined,
            }),
            Binding::Register(reg) | Binding::ClsRegister(reg) => {
                if frame != self.frame {
                    return Err(Error::Name {
                        name: name.to_owned(),
                        location: self.loc(unit, name_expr.range()),
                    });
                }
                self.emit(Op::GetLocal(reg));
            }
            Binding::ClosureSlot { index, name: slot } => {
                if frame == self.frame {
                    let act = self.activation.expect("closure slot without activation");
                    self.emit(Op::GetLocal(act));
                    self.emit(Op::GetSlot(index));
                } else {
                    // A captured variable of an enclosing function: the
                    // activation object is on the scope chain, so the
                    // private name resolves lexically.
                    let qname = self.qpriv(unit, &slot);
                    self.emit(Op::GetLex(qname));
                }
            }
            // Properties always resolve lexically; the defining scope
            // object is on the scope chain wherever the read happens.
            Binding::Property(qname) | Binding::LocalProperty(qname) => {
                self.emit(Op::GetLex(qname));
            }
            Binding::Class(record) => self.emit(Op::GetLex(record.name.clone())),
            Binding::NewClass { qname, .. } => self.emit(Op::GetLex(qname)),
            Binding::NewFunction { qname, .. } => self.emit(Op::GetLex(qname)),
            Binding::Method { .. } | Binding::ClassMethod { .. } | Binding::Builtin(_) => {
                return Err(Error::Syntax {
                    message: format!("'{name}' cannot be used as a value"),
                    location: self.loc(unit, name_expr.range()),
                })
            }
        }
        Ok(())
    }

    fn visit_compare(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        cmp: &ast::ExprCompare,
        void: bool,
    ) -> Result<()> {
        if cmp.ops.len() != 1 {
            return Err(Error::Syntax {
                message: "chained comparisons are not supported".into(),
                location: self.loc(unit, cmp.range()),
            });
        }
        if void {
            self.eval_expr(unit, lib, &cmp.left, true)?;
            self.eval_expr(unit, lib, &cmp.comparators[0], true)?;
            return Ok(());
        }
        self.eval_expr(unit, lib, &cmp.left, false)?;
        self.eval_expr(unit, lib, &cmp.comparators[0], false)?;
        match cmp.ops[0] {
            ast::CmpOp::Eq => self.emit(Op::StrictEquals),
            ast::CmpOp::NotEq => {
                self.emit(Op::StrictEquals);
                self.emit(Op::Not);
            }
            ast::CmpOp::Gt => self.emit(Op::GreaterThan),
            ast::CmpOp::GtE => self.emit(Op::GreaterEquals),
            ast::CmpOp::Lt => self.emit(Op::LessThan),
            ast::CmpOp::LtE => self.emit(Op::LessEquals),
            _ => {
                return Err(Error::Syntax {
                    message: "comparison operator is not supported".into(),
                    location: self.loc(unit, cmp.range()),
                })
            }
        }
        Ok(())
    }

    fn visit_boolop(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        boolop: &ast::ExprBoolOp,
        void: bool,
    ) -> Result<()> {
        let end = self.fresh_label();
        let last = boolop.values.len() - 1;
        for (i, value) in boolop.values.iter().enumerate() {
            self.eval_expr(unit, lib, value, false)?;
            self.emit(Op::CoerceA);
            if i < last {
                self.emit(Op::Dup);
                self.emit(match boolop.op {
                    ast::BoolOp::Or => Op::IfTrue(end),
                    ast::BoolOp::And => Op::IfFalse(end),
                });
                self.emit(Op::Pop);
            }
        }
        self.emit(Op::Mark(end));
        if void {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Calls
    // ----------------------------------------------------------------

    fn visit_call(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        call: &ast::ExprCall,
        void: bool,
    ) -> Result<()> {
        if !call.arguments.keywords.is_empty() {
            return Err(Error::Syntax {
                message: "keyword arguments are not supported".into(),
                location: self.loc(unit, call.range()),
            });
        }
        if let Expr::Attribute(attr) = call.func.as_ref() {
            return self.visit_method_call(unit, lib, attr, call, void);
        }
        if let Expr::Name(name) = call.func.as_ref() {
            let (_, binding) = self.find_name(unit, name.id.as_str(), name.range())?;
            match binding {
                Binding::Class(record) => {
                    self.emit(Op::GetLex(record.name.clone()));
                    self.push_args(unit, lib, call)?;
                    self.emit(Op::Construct {
                        num_args: call.arguments.args.len() as u32,
                    });
                    if void {
                        self.emit(Op::Pop);
                    }
                    return Ok(());
                }
                Binding::NewClass { qname, .. } => {
                    self.emit(Op::GetLex(qname));
                    self.push_args(unit, lib, call)?;
                    self.emit(Op::Construct {
                        num_args: call.arguments.args.len() as u32,
                    });
                    if void {
                        self.emit(Op::Pop);
                    }
                    return Ok(());
                }
                Binding::ClsRegister(reg) => {
                    self.emit(Op::GetLocal(reg));
                    self.push_args(unit, lib, call)?;
                    self.emit(Op::Construct {
                        num_args: call.arguments.args.len() as u32,
                    });
                    if void {
                        self.emit(Op::Pop);
                    }
                    return Ok(());
                }
                Binding::Builtin(builtin) => {
                    return self.call_builtin(unit, lib, builtin, call, void);
                }
                Binding::Property(qname)
                | Binding::LocalProperty(qname)
                | Binding::NewFunction { qname, .. } => {
                    // A name that resolves through the scope chain: look the
                    // function up strictly, then call it as a property of
                    // its home object.
                    self.emit(Op::FindPropStrict(qname.clone()));
                    self.push_args(unit, lib, call)?;
                    let num_args = call.arguments.args.len() as u32;
                    if void {
                        self.emit(Op::CallPropVoid {
                            name: qname,
                            num_args,
                        });
                    } else {
                        self.emit(Op::CallProperty {
                            name: qname,
                            num_args,
                        });
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        // `Class(expr)(args)`: coerce an expression to a class object and
        // construct through it.
        if let Expr::Call(inner) = call.func.as_ref() {
            if let Expr::Name(name) = inner.func.as_ref() {
                if name.id.as_str() == "Class" && inner.arguments.args.len() == 1 {
                    self.eval_expr(unit, lib, &inner.arguments.args[0], false)?;
                    self.emit(Op::Coerce(Multiname::qname("Class")));
                    self.push_args(unit, lib, call)?;
                    self.emit(Op::Construct {
                        num_args: call.arguments.args.len() as u32,
                    });
                    if void {
                        self.emit(Op::Pop);
                    }
                    return Ok(());
                }
            }
        }
        // Anything else: evaluate to a function object, call with a null
        // receiver.
        self.eval_expr(unit, lib, &call.func, false)?;
        self.emit(Op::PushNull);
        self.push_args(unit, lib, call)?;
        self.emit(Op::Call {
            num_args: call.arguments.args.len() as u32,
        });
        if void {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn push_args(&mut self, unit: &mut CompileUnit, lib: &mut Library, call: &ast::ExprCall) -> Result<()> {
        for arg in &call.arguments.args {
            self.eval_expr(unit, lib, arg, false)?;
        }
        Ok(())
    }

    /// Is this attribute receiver the call `super()`?
    fn super_receiver(expr: &Expr) -> bool {
        if let Expr::Call(call) = expr {
            if let Expr::Name(name) = call.func.as_ref() {
                return name.id.as_str() == "super" && call.arguments.args.is_empty();
            }
        }
        false
    }

    fn visit_method_call(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        attr: &ast::ExprAttribute,
        call: &ast::ExprCall,
        void: bool,
    ) -> Result<()> {
        let method_name = attr.attr.as_str();
        let num_args = call.arguments.args.len() as u32;

        if Self::super_receiver(&attr.value) {
            if method_name == "__init__" {
                if !void {
                    return Err(Error::Syntax {
                        message: "the result of super().__init__() cannot be used".into(),
                        location: self.loc(unit, call.range()),
                    });
                }
                self.emit(Op::GetLocal0);
                self.push_args(unit, lib, call)?;
                self.emit(Op::ConstructSuper { num_args });
                return Ok(());
            }
            self.emit(Op::GetLocal0);
            self.push_args(unit, lib, call)?;
            let name = Multiname::qname(method_name);
            if void {
                self.emit(Op::CallSuperVoid { name, num_args });
            } else {
                self.emit(Op::CallSuper { name, num_args });
            }
            return Ok(());
        }

        // `@debuginfo`-annotated methods get source-context literals
        // prepended to their arguments.
        let debuginfo = self.method_metadata(unit, lib, attr, "debuginfo");
        self.eval_expr(unit, lib, &attr.value, false)?;
        let mut num_args = num_args;
        if let Some(parts) = debuginfo {
            let line = self.stmt_line(unit, call);
            for part in parts.split(',') {
                match part {
                    "line" => self.emit(Op::PushInt(line as i32)),
                    "file" => self.emit(Op::PushString(unit.filename.clone())),
                    "class" => self.emit(Op::PushString(
                        self.enclosing_class.clone().unwrap_or_default(),
                    )),
                    "method" => self.emit(Op::PushString(self.display_name.clone())),
                    other => {
                        return Err(Error::Syntax {
                            message: format!("unknown debuginfo field '{other}'"),
                            location: self.loc(unit, call.range()),
                        })
                    }
                }
                num_args += 1;
            }
        }
        self.push_args(unit, lib, call)?;
        let name = Multiname::qname(method_name);
        if void {
            self.emit(Op::CallPropVoid { name, num_args });
        } else {
            self.emit(Op::CallProperty { name, num_args });
        }
        Ok(())
    }

    /// When the receiver is a class (imported or declared) and the named
    /// method carries compiler metadata, fetch one item from it.
    fn method_metadata(
        &self,
        unit: &CompileUnit,
        lib: &Library,
        attr: &ast::ExprAttribute,
        key: &str,
    ) -> Option<String> {
        let receiver = match attr.value.as_ref() {
            Expr::Name(name) => name,
            _ => return None,
        };
        let (_, binding) = unit.scopes.lookup(&self.chain, receiver.id.as_str())?;
        let record = match binding {
            Binding::Class(record) => record.as_ref().clone(),
            Binding::NewClass { qname, .. } => {
                let (pkg, name) = qname_key(qname);
                lib.get_class(&pkg, &name)?.clone()
            }
            _ => return None,
        };
        let qname = Multiname::qname(attr.attr.as_str());
        let method = record.method_trait(&qname)?;
        method
            .metadata
            .iter()
            .find(|m| m.name == METADATA_NAME)
            .and_then(|m| m.item(key))
            .map(str::to_owned)
    }

    // ----------------------------------------------------------------
    // Builtin calls
    // ----------------------------------------------------------------

    fn call_builtin(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        builtin: Builtin,
        call: &ast::ExprCall,
        void: bool,
    ) -> Result<()> {
        let args = &call.arguments.args;
        let expected = match builtin {
            Builtin::Abs => 1,
            Builtin::Min | Builtin::Max | Builtin::IsInstance => 2,
            _ => 0,
        };
        if expected != 0 && args.len() != expected {
            return Err(Error::Syntax {
                message: format!("builtin takes exactly {expected} argument(s)"),
                location: self.loc(unit, call.range()),
            });
        }
        match builtin {
            Builtin::Abs => {
                let end = self.fresh_label();
                self.eval_expr(unit, lib, &args[0], false)?;
                self.emit(Op::CoerceA);
                self.emit(Op::Dup);
                self.emit(Op::PushByte(0));
                self.emit(Op::IfGe(end));
                self.emit(Op::Negate);
                self.emit(Op::CoerceA);
                self.emit(Op::Mark(end));
            }
            Builtin::Min | Builtin::Max => {
                let end = self.fresh_label();
                self.eval_expr(unit, lib, &args[0], false)?;
                self.emit(Op::CoerceA);
                self.emit(Op::Dup);
                let reg = self.get_extra_reg(RegClass::Any);
                self.eval_expr(unit, lib, &args[1], false)?;
                self.emit(Op::Dup);
                self.emit(Op::CoerceA);
                self.emit(Op::SetLocal(reg));
                self.emit(if builtin == Builtin::Min {
                    Op::IfLe(end)
                } else {
                    Op::IfGe(end)
                });
                self.emit(Op::Pop);
                self.emit(Op::GetLocal(reg));
                self.free_extra_reg(reg, RegClass::Any);
                self.emit(Op::Mark(end));
            }
            Builtin::IsInstance => {
                self.eval_expr(unit, lib, &args[0], false)?;
                self.eval_expr(unit, lib, &args[1], false)?;
                self.emit(Op::IsTypeLate);
            }
            Builtin::Range | Builtin::Keys | Builtin::Values | Builtin::Items | Builtin::Len => {
                return Err(Error::Syntax {
                    message: "this builtin is only usable as a for-loop iterable".into(),
                    location: self.loc(unit, call.range()),
                })
            }
        }
        if void {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Definitions
    // ----------------------------------------------------------------

    fn visit_function(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        func: &ast::StmtFunctionDef,
    ) -> Result<()> {
        if self.mode == Mode::ClassBody {
            self.visit_method_def(unit, lib, func)
        } else {
            self.visit_function_def(unit, lib, func)
        }
    }

    fn param_defaults(
        &self,
        unit: &CompileUnit,
        parameters: &ast::Parameters,
    ) -> Result<Vec<ConstValue>> {
        let mut options = Vec::new();
        for param in &parameters.args {
            if let Some(default) = &param.default {
                options.push(self.const_default(unit, default)?);
            }
        }
        Ok(options)
    }

    fn const_default(&self, unit: &CompileUnit, expr: &Expr) -> Result<ConstValue> {
        Ok(match expr {
            Expr::NumberLiteral(n) => match &n.value {
                ast::Number::Int(int) => match int.as_i64().and_then(|v| i32::try_from(v).ok()) {
                    Some(v) => ConstValue::Int(v),
                    None => {
                        return Err(Error::Syntax {
                            message: "default value out of range".into(),
                            location: self.loc(unit, expr.range()),
                        })
                    }
                },
                ast::Number::Float(f) => ConstValue::Double(*f),
                ast::Number::Complex { .. } => {
                    return Err(Error::Syntax {
                        message: "complex default values are not supported".into(),
                        location: self.loc(unit, expr.range()),
                    })
                }
            },
            Expr::StringLiteral(s) => ConstValue::Utf8(s.value.to_string()),
            Expr::BooleanLiteral(b) => {
                if b.value {
                    ConstValue::True
                } else {
                    ConstValue::False
                }
            }
            Expr::NoneLiteral(_) => ConstValue::Null,
            Expr::Name(name) if name.id.as_str() == "undefined" => ConstValue::Undefined,
            Expr::UnaryOp(unary) if unary.op == ast::UnaryOp::USub => {
                match self.const_default(unit, &unary.operand)? {
                    ConstValue::Int(v) => ConstValue::Int(-v),
                    ConstValue::Double(v) => ConstValue::Double(-v),
                    _ => {
                        return Err(Error::Syntax {
                            message: "default value must be a constant".into(),
                            location: self.loc(unit, expr.range()),
                        })
                    }
                }
            }
            _ => {
                return Err(Error::Syntax {
                    message: "default value must be a constant".into(),
                    location: self.loc(unit, expr.range()),
                })
            }
        })
    }

    /// A `def` inside a class body: an instance method, classmethod, or
    /// static method, decided by decorators.
    fn visit_method_def(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        func: &ast::StmtFunctionDef,
    ) -> Result<()> {
        let mut classmethod = false;
        let mut staticmethod = false;
        let mut metadata: Vec<(String, String)> = Vec::new();
        let mut method_ns = Namespace::public();
        for dec in &func.decorator_list {
            match scope::decorator_name(dec) {
                Some("classmethod") => classmethod = true,
                Some("staticmethod") => staticmethod = true,
                Some("debuglevel") => {
                    if let Some(arg) = scope::decorator_str_arg(dec) {
                        metadata.push(("debuglevel".into(), arg));
                    }
                }
                Some("debuginfo") => {
                    let parts = decorator_str_args(dec);
                    metadata.push(("debuginfo".into(), parts.join(",")));
                }
                Some("nsuser") => {
                    if let Some(arg) = scope::decorator_str_arg(dec) {
                        method_ns = Namespace::User(arg);
                    }
                }
                _ => {
                    return Err(Error::Syntax {
                        message: "unknown method decorator".into(),
                        location: self.loc(unit, dec.range()),
                    })
                }
            }
        }

        let mut arguments: Vec<Option<String>> = Vec::new();
        if staticmethod {
            arguments.push(None);
        }
        arguments.extend(
            func.parameters
                .args
                .iter()
                .map(|p| Some(p.parameter.name.to_string())),
        );
        let vararg = func.parameters.vararg.as_ref().map(|v| v.name.to_string());

        let class_name = self
            .enclosing_class
            .clone()
            .expect("class body fragments carry their class name");
        let info = unit.scope_map.of(func.range().start().to_u32()).clone();
        let spec = FragmentSpec {
            mode: Mode::Method,
            // Methods see the scopes around the class, not the class body.
            parent_chain: self.chain[1..].to_vec(),
            arguments,
            vararg,
            classmethod,
            enclosing_class: Some(class_name.clone()),
            display_name: format!("{}/{}", class_name, func.name),
            first_line: self.stmt_line(unit, func),
            info,
        };
        let fragment = CodeFragment::compile(unit, lib, &func.body, spec)?;
        let options = self.param_defaults(unit, &func.parameters)?;
        let (method, _) = fragment.finish(unit, options)?;

        let binding = if classmethod || staticmethod {
            Binding::ClassMethod { method, metadata }
        } else {
            Binding::Method {
                method,
                ns: method_ns,
                metadata,
            }
        };
        unit.scopes
            .insert(self.frame, func.name.to_string(), binding);
        Ok(())
    }

    /// A `def` outside any class body: a top-level function published as a
    /// script trait, or a nested function materialized with `newfunction`.
    fn visit_function_def(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        func: &ast::StmtFunctionDef,
    ) -> Result<()> {
        let mut package_ns = Namespace::Private(unit.filename.clone());
        let mut bare_method = false;
        let mut mode = if matches!(self.mode, Mode::Eval | Mode::EvalChildFunc) {
            Mode::EvalChildFunc
        } else {
            Mode::Function
        };
        for dec in &func.decorator_list {
            match scope::decorator_name(dec) {
                Some("package") => {
                    if let Some(pkg) = scope::decorator_str_arg(dec) {
                        package_ns = Namespace::Package(pkg);
                    }
                }
                Some("private") => package_ns = Namespace::Private(unit.filename.clone()),
                Some("method") => bare_method = true,
                Some("__eval__") => mode = Mode::Eval,
                _ => {
                    return Err(Error::Syntax {
                        message: "unknown function decorator".into(),
                        location: self.loc(unit, dec.range()),
                    })
                }
            }
        }

        let mut arguments: Vec<Option<String>> = Vec::new();
        if !bare_method {
            arguments.push(None);
        }
        arguments.extend(
            func.parameters
                .args
                .iter()
                .map(|p| Some(p.parameter.name.to_string())),
        );
        let vararg = func.parameters.vararg.as_ref().map(|v| v.name.to_string());

        let line = self.stmt_line(unit, func);
        let info = unit.scope_map.of(func.range().start().to_u32()).clone();
        let spec = FragmentSpec {
            mode,
            parent_chain: self.chain.clone(),
            arguments,
            vararg,
            classmethod: false,
            enclosing_class: self.enclosing_class.clone(),
            display_name: format!("{}${}:{}", unit.filename, line, func.name),
            first_line: line,
            info,
        };
        let fragment = CodeFragment::compile(unit, lib, &func.body, spec)?;
        let options = self.param_defaults(unit, &func.parameters)?;
        let (method, _) = fragment.finish(unit, options)?;

        let name = func.name.to_string();
        let binding = unit.scopes.frame(self.frame).get(&name).cloned();
        if self.mode == Mode::Global && matches!(binding, Some(Binding::Property(_))) {
            // Top-level functions become script traits; the script object
            // carries them like methods, so no store is emitted.
            let qname = Multiname::QName {
                ns: package_ns,
                name: name.clone(),
            };
            unit.scopes
                .insert(self.frame, name, Binding::NewFunction { qname, method });
        } else {
            self.assign_name(
                unit,
                lib,
                &name,
                func.name.range(),
                None,
                move |frag, _, _| {
                    frag.emit(Op::NewFunction(method));
                    Ok(())
                },
            )?;
        }
        Ok(())
    }

    fn visit_class(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        class: &ast::StmtClassDef,
    ) -> Result<()> {
        let class_name = class.name.to_string();
        let mut package_ns = Namespace::Private(unit.filename.clone());
        for dec in &class.decorator_list {
            match scope::decorator_name(dec) {
                Some("package") => {
                    if let Some(pkg) = scope::decorator_str_arg(dec) {
                        package_ns = Namespace::Package(pkg);
                    }
                }
                Some("private") => package_ns = Namespace::Private(unit.filename.clone()),
                _ => {
                    return Err(Error::Syntax {
                        message: "unknown class decorator".into(),
                        location: self.loc(unit, dec.range()),
                    })
                }
            }
        }

        let info = unit.scope_map.of(class.range().start().to_u32()).clone();
        let slots = info.slots.clone();
        let spec = FragmentSpec {
            mode: Mode::ClassBody,
            parent_chain: self.chain.clone(),
            arguments: vec![None],
            vararg: None,
            classmethod: false,
            enclosing_class: Some(class_name.clone()),
            display_name: class_name.clone(),
            first_line: self.stmt_line(unit, class),
            info,
        };
        let fragment = CodeFragment::compile(unit, lib, &class.body, spec)?;
        let (cinit, class_frame) = fragment.finish(unit, Vec::new())?;

        // Resolve the base (the platform Object when none is named) and
        // collect the full ancestor chain, immediate base first.
        let base_count = class.arguments.as_ref().map_or(0, |a| a.args.len());
        if base_count > 1 {
            return Err(Error::Syntax {
                message: "multiple inheritance is not supported".into(),
                location: self.loc(unit, class.range()),
            });
        }
        let bases: Vec<ClassRecord> = if base_count == 0 {
            let object = lib
                .get_class("", "Object")
                .cloned()
                .ok_or_else(|| Error::Import {
                    name: ":Object".into(),
                    location: self.loc(unit, class.range()),
                })?;
            self.collect_ancestors(unit, lib, object, class.range())?
        } else {
            let base_expr = &class.arguments.as_ref().expect("checked above").args[0];
            let base_name = match base_expr {
                Expr::Name(name) => name,
                other => {
                    return Err(Error::Syntax {
                        message: "base class must be a name".into(),
                        location: self.loc(unit, other.range()),
                    })
                }
            };
            let (_, binding) = self.find_name(unit, base_name.id.as_str(), base_name.range())?;
            let record = match binding {
                Binding::Class(record) => *record,
                Binding::NewClass { qname, .. } => {
                    let (pkg, name) = qname_key(&qname);
                    lib.get_class(&pkg, &name)
                        .cloned()
                        .ok_or_else(|| Error::NotAClass {
                            name: base_name.id.to_string(),
                            location: self.loc(unit, base_name.range()),
                        })?
                }
                _ => {
                    return Err(Error::NotAClass {
                        name: base_name.id.to_string(),
                        location: self.loc(unit, base_name.range()),
                    })
                }
            };
            self.collect_ancestors(unit, lib, record, base_name.range())?
        };

        let qname = Multiname::QName {
            ns: package_ns,
            name: class_name.clone(),
        };
        let class_id = self.build_class(unit, lib, &qname, &bases, class_frame, cinit, slots)?;

        unit.scopes.insert(
            self.frame,
            class_name.clone(),
            Binding::NewClass {
                qname: qname.clone(),
                class: class_id,
            },
        );

        // Run the class-creation protocol: push every ancestor's scope
        // (deepest first), build the class against the immediate base, and
        // publish it under its qualified name.
        let base_names: Vec<Multiname> = bases.iter().map(|b| b.name.clone()).collect();
        self.assign_name(
            unit,
            lib,
            &class_name,
            class.name.range(),
            None,
            move |frag, _, _| {
                for base in base_names.iter().rev() {
                    frag.emit(Op::GetLex(base.clone()));
                    frag.emit(Op::PushScope);
                }
                frag.emit(Op::GetLex(base_names[0].clone()));
                frag.emit(Op::NewClass(class_id));
                for _ in &base_names {
                    frag.emit(Op::PopScope);
                }
                Ok(())
            },
        )
    }

    fn collect_ancestors(
        &self,
        unit: &mut CompileUnit,
        lib: &Library,
        first: ClassRecord,
        range: TextRange,
    ) -> Result<Vec<ClassRecord>> {
        let mut chain = Vec::new();
        let mut current = first;
        loop {
            let super_key = current.super_key();
            chain.push(current);
            match super_key {
                Some((pkg, name)) => {
                    current = lib.get_class(&pkg, &name).cloned().ok_or_else(|| {
                        Error::Import {
                            name: format!("{pkg}:{name}"),
                            location: self.loc(unit, range),
                        }
                    })?;
                }
                None => return Ok(chain),
            }
        }
    }

    /// Assemble the instance/class info pair from a finished class-body
    /// fragment and register the class with the library.
    #[allow(clippy::too_many_arguments)]
    fn build_class(
        &mut self,
        unit: &mut CompileUnit,
        lib: &mut Library,
        qname: &Multiname,
        bases: &[ClassRecord],
        class_frame: usize,
        cinit: MethodId,
        slots: Option<Vec<String>>,
    ) -> Result<ClassId> {
        let mut static_traits = Vec::new();
        let mut instance_traits = Vec::new();
        let mut record_methods = Vec::new();
        let mut iinit = None;

        let members: Vec<(String, Binding)> = unit
            .scopes
            .frame(class_frame)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, binding) in members {
            match binding {
                Binding::Method { method, ns, metadata } => {
                    let fullname = Multiname::QName {
                        ns,
                        name: name.clone(),
                    };
                    if name == "__init__" {
                        iinit = Some(method);
                        continue;
                    }
                    let mut attr = TraitAttrs::empty();
                    let mut disp_id = 0;
                    for base in bases {
                        if let Some(base_trait) = base.method_trait(&fullname) {
                            attr |= TraitAttrs::OVERRIDE;
                            disp_id = base_trait.disp_id;
                            break;
                        }
                    }
                    let mut t = Trait::new(fullname.clone(), TraitKind::Method { disp_id, method });
                    t.attr = attr;
                    let meta_records = self.attach_metadata(unit, &metadata, &mut t);
                    record_methods.push(MethodTrait {
                        name: fullname,
                        disp_id,
                        metadata: meta_records,
                    });
                    instance_traits.push(t);
                }
                Binding::ClassMethod { method, metadata } => {
                    if name == "__init__" {
                        iinit = Some(method);
                        continue;
                    }
                    let mut t = Trait::new(
                        Multiname::qname(name.clone()),
                        TraitKind::Method { disp_id: 0, method },
                    );
                    self.attach_metadata(unit, &metadata, &mut t);
                    static_traits.push(t);
                }
                Binding::Property(_) => {
                    if name != "__init__" {
                        static_traits.push(Trait::new(
                            Multiname::qname(name.clone()),
                            TraitKind::slot(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let mut flags = InstanceFlags::empty();
        if let Some(slots) = &slots {
            let mut sealed = true;
            for slot in slots {
                if slot == "__dict__" {
                    sealed = false;
                    continue;
                }
                instance_traits.push(Trait::new(Multiname::qname(slot.clone()), TraitKind::slot()));
            }
            if sealed {
                flags |= InstanceFlags::SEALED;
            }
        }

        let iinit = match iinit {
            Some(method) => method,
            // No `__init__`: synthesize a constructor that defers to the
            // base class.
            None => self.synthesize_default_init(unit, qname)?,
        };

        let class_id = unit.abc.add_class(
            InstanceInfo {
                name: qname.clone(),
                super_name: bases[0].name.clone(),
                flags,
                protected_ns: None,
                interfaces: Vec::new(),
                iinit,
                traits: instance_traits,
            },
            ClassInfo {
                cinit,
                traits: static_traits,
            },
        );

        lib.add_class_record(ClassRecord {
            name: qname.clone(),
            super_name: bases[0].name.clone(),
            interface: false,
            methods: record_methods,
            source: unit.source_path.clone(),
        });
        Ok(class_id)
    }

    fn attach_metadata(
        &self,
        unit: &mut CompileUnit,
        items: &[(String, String)],
        t: &mut Trait,
    ) -> Vec<Metadata> {
        if items.is_empty() {
            return Vec::new();
        }
        let metadata = Metadata {
            name: METADATA_NAME.to_owned(),
            items: items.to_vec(),
        };
        let id = unit.abc.add_metadata(metadata.clone());
        t.metadata.push(id);
        vec![metadata]
    }

    fn synthesize_default_init(
        &self,
        unit: &mut CompileUnit,
        qname: &Multiname,
    ) -> Result<MethodId> {
        let name = format!("{}/__init__", qname.name().unwrap_or_default());
        let method = unit.abc.add_method(MethodInfo {
            param_types: Vec::new(),
            return_type: Multiname::Any,
            name,
            flags: MethodFlags::empty(),
            options: Vec::new(),
            param_names: Vec::new(),
        });
        let code = vec![
            Op::GetLocal0,
            Op::PushScope,
            Op::GetLocal0,
            Op::ConstructSuper { num_args: 0 },
            Op::ReturnVoid,
        ];
        let limits = verify::verify(&code, "synthesized constructor", 0)?;
        unit.abc.add_body(MethodBody {
            method,
            max_stack: limits.max_stack,
            local_count: 1,
            init_scope_depth: 0,
            max_scope_depth: limits.max_scope_depth,
            code,
            exceptions: Vec::new(),
            traits: Vec::new(),
        });
        Ok(method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterKind {
    Keys,
    Values,
    Items,
}

fn decorator_str_args(dec: &ast::Decorator) -> Vec<String> {
    if let Expr::Call(call) = &dec.expression {
        call.arguments
            .args
            .iter()
            .filter_map(|arg| match arg {
                Expr::StringLiteral(s) => Some(s.value.to_string()),
                _ => None,
            })
            .collect()
    } else {
        Vec::new()
    }
}

fn qname_key(qname: &Multiname) -> (String, String) {
    match qname {
        Multiname::QName { ns, name } => (ns.name().to_owned(), name.clone()),
        _ => (String::new(), String::new()),
    }
}

