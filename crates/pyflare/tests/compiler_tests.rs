//! End-to-end shapes: compile a source, re-read the emitted ABC, and check
//! the instruction sequences and structures the generator must produce.

use pyflare::abc::{
    AbcFile, InstanceFlags, MethodBody, MethodFlags, Multiname, Namespace, TraitAttrs, TraitKind,
};
use pyflare::compile::{compile_source, Options};
use pyflare::error::Error;
use pyflare::library::{ClassRecord, Library, MethodTrait};
use pyflare::ops::Op;

/// Assert that the listed patterns appear in `ops` in order (with anything
/// allowed in between).
macro_rules! assert_ops_in_order {
    ($ops:expr, $($pat:pat $(if $guard:expr)?),+ $(,)?) => {{
        let ops: &[Op] = &$ops;
        let mut iter = ops.iter();
        $(
            assert!(
                iter.any(|op| matches!(op, $pat $(if $guard)?)),
                "missing `{}` (in order) in:\n{:#?}",
                stringify!($pat),
                ops
            );
        )+
    }};
}

fn compile_with(source: &str, lib: &mut Library) -> AbcFile {
    let doabc = compile_source(source, "test.py", lib, &Options::default())
        .unwrap_or_else(|e| panic!("compilation failed: {e}"));
    doabc.parse_abc().unwrap()
}

fn compile(source: &str) -> AbcFile {
    compile_with(source, &mut Library::new())
}

fn script_body(abc: &AbcFile) -> &MethodBody {
    abc.body_of(abc.scripts[0].init).unwrap()
}

fn body_named<'a>(abc: &'a AbcFile, name: &str) -> &'a MethodBody {
    let (id, _) = abc
        .methods
        .iter()
        .enumerate()
        .find(|(_, m)| m.name == name)
        .unwrap_or_else(|| panic!("no method named {name}"));
    abc.body_of(pyflare::abc::MethodId(id as u32)).unwrap()
}

fn record(pkg: &str, name: &str, base: Option<(&str, &str)>) -> ClassRecord {
    ClassRecord {
        name: Multiname::package(pkg, name),
        super_name: match base {
            Some((bp, bn)) => Multiname::package(bp, bn),
            None => Multiname::Any,
        },
        interface: false,
        methods: Vec::new(),
        source: "testlib".into(),
    }
}

// ---------------------------------------------------------------------
// E1: module-level expression statement
// ---------------------------------------------------------------------

#[test]
fn module_level_print_call() {
    let abc = compile("print(2 * 3 + 4)\n");
    let body = script_body(&abc);
    assert_ops_in_order!(
        body.code,
        Op::FindPropStrict(Multiname::QName { name, .. }) if name == "print",
        Op::PushByte(2),
        Op::PushByte(3),
        Op::Multiply,
        Op::PushByte(4),
        Op::Add,
        Op::CallPropVoid { name: Multiname::QName { name, .. }, num_args: 1 } if name == "print",
    );
    assert_eq!(body.max_stack, 3);
}

// ---------------------------------------------------------------------
// E2: class generation and super calls
// ---------------------------------------------------------------------

fn library_with_a() -> Library {
    let mut lib = Library::new();
    let mut a = record("", "A", None);
    a.methods.push(MethodTrait {
        name: Multiname::qname("m"),
        disp_id: 2,
        metadata: Vec::new(),
    });
    lib.add_class_record(a);
    lib
}

#[test]
fn class_generation_pushes_the_ancestor_scopes() {
    let mut lib = library_with_a();
    let abc = compile_with(
        "class B(A):\n    def __init__(self):\n        super().__init__()\n    def m(self):\n        super().m()\n",
        &mut lib,
    );
    let body = script_body(&abc);
    assert_ops_in_order!(
        body.code,
        Op::GetScopeObject(0),
        Op::GetLex(Multiname::QName { name, .. }) if name == "A",
        Op::PushScope,
        Op::GetLex(Multiname::QName { name, .. }) if name == "A",
        Op::NewClass(_),
        Op::PopScope,
        Op::InitProperty(Multiname::QName { name, .. }) if name == "B",
    );

    let m = body_named(&abc, "B/m");
    assert_ops_in_order!(
        m.code,
        Op::GetLocal0,
        Op::CallSuperVoid { name: Multiname::QName { name, .. }, num_args: 0 } if name == "m",
    );

    let init = body_named(&abc, "B/__init__");
    assert_ops_in_order!(init.code, Op::GetLocal0, Op::ConstructSuper { num_args: 0 });
}

#[test]
fn overriding_method_inherits_the_dispatch_id() {
    let mut lib = library_with_a();
    let abc = compile_with(
        "class B(A):\n    def __init__(self):\n        super().__init__()\n    def m(self):\n        pass\n    def fresh(self):\n        pass\n",
        &mut lib,
    );
    let instance = &abc.instances[0];
    let m = instance
        .traits
        .iter()
        .find(|t| t.name.name() == Some("m"))
        .unwrap();
    assert!(m.attr.contains(TraitAttrs::OVERRIDE));
    assert!(matches!(m.kind, TraitKind::Method { disp_id: 2, .. }));

    let fresh = instance
        .traits
        .iter()
        .find(|t| t.name.name() == Some("fresh"))
        .unwrap();
    assert!(!fresh.attr.contains(TraitAttrs::OVERRIDE));
    assert!(matches!(fresh.kind, TraitKind::Method { disp_id: 0, .. }));

    // Instance and class info pair up at the same index, and the new class
    // is published by the script.
    assert_eq!(abc.instances.len(), abc.classes.len());
    assert!(abc.scripts[0]
        .traits
        .iter()
        .any(|t| matches!(t.kind, TraitKind::Class { .. })));
}

// ---------------------------------------------------------------------
// E3: integer range loops
// ---------------------------------------------------------------------

#[test]
fn range_loop_counts_with_integer_registers() {
    let abc = compile("def f(n):\n    for i in range(3):\n        n = n + 1\n    return n\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::PushByte(0),
        Op::ConvertI,
        Op::SetLocal(_),
        Op::PushByte(3),
        Op::ConvertI,
        Op::SetLocal(_),
        Op::Jump(_),
        Op::Label(_),
        Op::GetLocal(_),
        Op::CoerceA,
        Op::SetLocal(_),
        Op::IncLocalI(_),
        Op::GetLocal(_),
        Op::GetLocal(_),
        Op::IfLt(_),
    );
}

#[test]
fn negative_constant_step_compares_downward() {
    let abc = compile("def f():\n    for i in range(10, 0, -2):\n        pass\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(body.code, Op::AddI, Op::IfGt(_));
}

#[test]
fn dynamic_step_tests_the_sign_at_runtime() {
    let abc = compile("def f(s):\n    for i in range(0, 10, s):\n        pass\n");
    let body = body_named(&abc, "test.py$1:f");
    // Both direction checks are present.
    assert_ops_in_order!(
        body.code,
        Op::PushByte(0),
        Op::GetLocal(_),
        Op::IfGt(_),
        Op::IfLt(_),
        Op::IfGt(_),
    );
}

// ---------------------------------------------------------------------
// E4: try / except
// ---------------------------------------------------------------------

#[test]
fn try_except_builds_the_exception_table() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "E", None));
    lib.add_name("", "g", pyflare::library::PropKind::Function);
    lib.add_name("", "h", pyflare::library::PropKind::Function);
    let abc = compile_with(
        "def f():\n    try:\n        g()\n    except E as e:\n        h(e)\n",
        &mut lib,
    );
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::CallPropVoid { name: Multiname::QName { name, .. }, num_args: 0 } if name == "g",
        Op::Jump(_),
        Op::GetLocal0,
        Op::PushScope,
        Op::NewCatch(0),
        Op::Pop,
        Op::CoerceA,
        Op::SetLocal(_),
        Op::GetLocal(_),
        Op::CallPropVoid { name: Multiname::QName { name, .. }, num_args: 1 } if name == "h",
        Op::Jump(_),
    );
    assert_eq!(body.exceptions.len(), 1);
    let handler = &body.exceptions[0];
    assert_eq!(handler.exc_type.name(), Some("E"));
    assert_eq!(
        handler.var_name.as_ref().and_then(|v| v.name()),
        Some("e")
    );
}

#[test]
fn bare_except_catches_the_any_type() {
    let mut lib = Library::new();
    lib.add_name("", "g", pyflare::library::PropKind::Function);
    let abc = compile_with(
        "def f():\n    try:\n        g()\n    except:\n        pass\n",
        &mut lib,
    );
    let body = body_named(&abc, "test.py$1:f");
    assert!(matches!(body.exceptions[0].exc_type, Multiname::Any));
    assert!(body.exceptions[0].var_name.is_none());
}

// ---------------------------------------------------------------------
// E5: closures and the activation object
// ---------------------------------------------------------------------

#[test]
fn closures_go_through_the_activation_object() {
    let abc = compile("def outer(x):\n    def inner():\n        return x\n    return inner\n");

    let outer = body_named(&abc, "test.py$1:outer");
    assert_ops_in_order!(
        outer.code,
        Op::NewActivation,
        Op::Dup,
        Op::PushScope,
        Op::SetLocal(_),
        Op::GetLocal(_),
        Op::GetLocal(_),
        Op::SetSlot(1),
        Op::NewFunction(_),
        Op::CoerceA,
        Op::ReturnValue,
    );
    let (outer_id, _) = abc
        .methods
        .iter()
        .enumerate()
        .find(|(_, m)| m.name == "test.py$1:outer")
        .unwrap();
    assert!(abc.methods[outer_id]
        .flags
        .contains(MethodFlags::NEED_ACTIVATION));
    // The captured variable occupies a stable activation slot declared as a
    // body trait under the file-private namespace.
    assert!(outer.traits.iter().any(|t| {
        matches!(&t.kind, TraitKind::Slot { slot_id: 1, .. })
            && matches!(
                &t.name,
                Multiname::QName {
                    ns: Namespace::Private(_),
                    name,
                } if name == "x"
            )
    }));

    let inner = body_named(&abc, "test.py$2:inner");
    assert_ops_in_order!(
        inner.code,
        Op::GetLex(Multiname::QName { ns: Namespace::Private(_), name }) if name == "x",
        Op::ReturnValue,
    );
}

// ---------------------------------------------------------------------
// E6: tuple unpacking
// ---------------------------------------------------------------------

#[test]
fn tuple_assignment_indexes_the_value_positionally() {
    let abc = compile("def f():\n    a, b = [1, 2]\n    return a\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::PushByte(1),
        Op::PushByte(2),
        Op::NewArray { num_args: 2 },
        Op::Dup,
        Op::PushByte(0),
        Op::GetProperty(Multiname::MultinameL { .. }),
        Op::SetLocal(_),
        Op::PushByte(1),
        Op::GetProperty(Multiname::MultinameL { .. }),
        Op::SetLocal(_),
    );
}

// ---------------------------------------------------------------------
// Iteration over object properties
// ---------------------------------------------------------------------

#[test]
fn keys_loop_uses_hasnext2() {
    let abc = compile("def f(d):\n    for k in keys(d):\n        pass\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::CoerceA,
        Op::SetLocal(_),
        Op::PushByte(0),
        Op::SetLocal(_),
        Op::Jump(_),
        Op::Label(_),
        Op::NextName,
        Op::HasNext2 { .. },
        Op::IfTrue(_),
    );
}

#[test]
fn items_loop_reads_name_and_value() {
    let abc = compile("def f(d):\n    for k, v in items(d):\n        pass\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(body.code, Op::NextName, Op::NextValue, Op::HasNext2 { .. });
}

// ---------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------

#[test]
fn abs_is_inlined_with_a_branch() {
    let abc = compile("def f(x):\n    return abs(x)\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::CoerceA,
        Op::Dup,
        Op::PushByte(0),
        Op::IfGe(_),
        Op::Negate,
        Op::ReturnValue,
    );
}

#[test]
fn min_spills_through_a_spare_register() {
    let abc = compile("def f(a, b):\n    return min(a, b)\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::Dup,
        Op::SetLocal(_),
        Op::IfLe(_),
        Op::Pop,
        Op::GetLocal(_),
        Op::Kill(_),
    );
}

#[test]
fn isinstance_lowers_to_istypelate() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "T", None));
    let abc = compile_with("def f(x):\n    return isinstance(x, T)\n", &mut lib);
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(body.code, Op::GetLocal(_), Op::GetLex(_), Op::IsTypeLate);
}

#[test]
fn iterator_builtins_reject_call_position() {
    let err = compile_source(
        "def f(d):\n    x = keys(d)\n",
        "test.py",
        &mut Library::new(),
        &Options::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
}

// ---------------------------------------------------------------------
// Slots and sealing
// ---------------------------------------------------------------------

#[test]
fn slots_seal_the_class() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "Object", None));
    let abc = compile_with(
        "class P:\n    __slots__ = ('x', 'y')\n    def __init__(self):\n        super().__init__()\n",
        &mut lib,
    );
    let instance = &abc.instances[0];
    assert!(instance.flags.contains(InstanceFlags::SEALED));
    let slot_names: Vec<_> = instance
        .traits
        .iter()
        .filter(|t| matches!(t.kind, TraitKind::Slot { .. }))
        .filter_map(|t| t.name.name())
        .collect();
    assert_eq!(slot_names, vec!["x", "y"]);
}

#[test]
fn a_dict_slot_opts_out_of_sealing() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "Object", None));
    let abc = compile_with(
        "class P:\n    __slots__ = ('x', '__dict__')\n    def __init__(self):\n        super().__init__()\n",
        &mut lib,
    );
    let instance = &abc.instances[0];
    assert!(!instance.flags.contains(InstanceFlags::SEALED));
    assert!(instance
        .traits
        .iter()
        .all(|t| t.name.name() != Some("__dict__")));
}

// ---------------------------------------------------------------------
// Classes without __init__, defaults, varargs
// ---------------------------------------------------------------------

#[test]
fn a_class_without_init_gets_a_default_constructor() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "Object", None));
    let abc = compile_with("class P:\n    def go(self):\n        return 1\n", &mut lib);
    let iinit = abc.instances[0].iinit;
    let body = abc.body_of(iinit).unwrap();
    assert_ops_in_order!(body.code, Op::GetLocal0, Op::ConstructSuper { num_args: 0 });
}

#[test]
fn parameter_defaults_become_option_details() {
    let abc = compile("def f(a, b=2, c='x'):\n    return a\n");
    let method = abc
        .methods
        .iter()
        .find(|m| m.name.ends_with(":f"))
        .unwrap();
    assert_eq!(method.options.len(), 2);
    assert!(method.flags.contains(MethodFlags::HAS_OPTIONAL));
    assert_eq!(method.param_types.len(), 3);
}

#[test]
fn varargs_set_need_rest() {
    let abc = compile("def f(a, *rest):\n    return a\n");
    let method = abc
        .methods
        .iter()
        .find(|m| m.name.ends_with(":f"))
        .unwrap();
    assert!(method.flags.contains(MethodFlags::NEED_REST));
}

// ---------------------------------------------------------------------
// Control flow odds and ends
// ---------------------------------------------------------------------

#[test]
fn while_loop_heads_carry_a_wire_label() {
    let mut lib = Library::new();
    lib.add_name("", "g", pyflare::library::PropKind::Function);
    let abc = compile_with("def f(n):\n    while n > 0:\n        g()\n", &mut lib);
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::Label(_),
        Op::GreaterThan,
        Op::IfFalse(_),
        Op::Jump(_),
    );
}

#[test]
fn ternary_balances_both_arms() {
    let abc = compile("def f(c):\n    return 1 if c else 2\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::IfFalse(_),
        Op::PushByte(1),
        Op::CoerceA,
        Op::Jump(_),
        Op::Pop,
        Op::PushByte(2),
        Op::CoerceA,
        Op::ReturnValue,
    );
}

#[test]
fn and_or_short_circuit_with_dup() {
    let abc = compile("def f(a, b):\n    return a and b\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(body.code, Op::CoerceA, Op::Dup, Op::IfFalse(_), Op::Pop);
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let err = compile_source(
        "def f():\n    break\n",
        "test.py",
        &mut Library::new(),
        &Options::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
}

// ---------------------------------------------------------------------
// Debug info decorators
// ---------------------------------------------------------------------

#[test]
fn debuginfo_methods_receive_source_context_arguments() {
    let mut lib = Library::new();
    let mut logger = record("", "Log", None);
    logger.methods.push(MethodTrait {
        name: Multiname::qname("info"),
        disp_id: 0,
        metadata: vec![pyflare::abc::Metadata {
            name: "pyflare".into(),
            items: vec![("debuginfo".into(), "file,line".into())],
        }],
    });
    lib.add_class_record(logger);
    let abc = compile_with("Log.info('hello')\n", &mut lib);
    let body = script_body(&abc);
    assert_ops_in_order!(
        body.code,
        Op::GetLex(Multiname::QName { name, .. }) if name == "Log",
        Op::PushString(file) if file == "test.py",
        Op::PushInt(1),
        Op::PushString(msg) if msg == "hello",
        Op::CallPropVoid { name: Multiname::QName { name, .. }, num_args: 3 } if name == "info",
    );
}

// ---------------------------------------------------------------------
// Imports and name errors
// ---------------------------------------------------------------------

#[test]
fn imports_resolve_against_the_library() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "Object", None));
    lib.add_class_record(record("flash.display", "Sprite", Some(("", "Object"))));
    let abc = compile_with(
        "from flash.display import Sprite\n\nclass Main(Sprite):\n    def __init__(self):\n        super().__init__()\n",
        &mut lib,
    );
    let body = script_body(&abc);
    // Both Sprite and Object scopes are pushed, deepest first.
    assert_ops_in_order!(
        body.code,
        Op::GetLex(Multiname::QName { name, .. }) if name == "Object",
        Op::PushScope,
        Op::GetLex(Multiname::QName { name, .. }) if name == "Sprite",
        Op::PushScope,
        Op::GetLex(Multiname::QName { name, .. }) if name == "Sprite",
        Op::NewClass(_),
        Op::PopScope,
        Op::PopScope,
    );
}

#[test]
fn a_missing_import_is_an_import_error() {
    let err = compile_source(
        "from flash.display import Sprite\n",
        "test.py",
        &mut Library::new(),
        &Options::default(),
    )
    .unwrap_err();
    match err {
        Error::Import { name, location } => {
            assert_eq!(name, "flash.display:Sprite");
            assert_eq!(location.line, 1);
        }
        other => panic!("expected an import error, got {other}"),
    }
}

#[test]
fn a_non_class_base_is_rejected() {
    let mut lib = Library::new();
    lib.add_name("", "helper", pyflare::library::PropKind::Function);
    let err = compile_source(
        "class C(helper):\n    pass\n",
        "test.py",
        &mut lib,
        &Options::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotAClass { .. }));
}

#[test]
fn compiled_classes_are_visible_to_later_files() {
    let mut lib = Library::new();
    lib.add_class_record(record("", "Object", None));
    let options = Options::default();
    compile_source(
        "@package('game')\nclass Base:\n    def __init__(self):\n        super().__init__()\n",
        "base.py",
        &mut lib,
        &options,
    )
    .unwrap();
    // The second file imports the class the first one declared.
    let abc = {
        let doabc = compile_source(
            "from game import Base\n\nclass Child(Base):\n    def __init__(self):\n        super().__init__()\n",
            "child.py",
            &mut lib,
            &options,
        )
        .unwrap();
        doabc.parse_abc().unwrap()
    };
    assert_eq!(abc.instances[0].super_name.name(), Some("Base"));
}

// ---------------------------------------------------------------------
// Augmented assignment and attribute stores
// ---------------------------------------------------------------------

#[test]
fn augmented_assignment_loads_the_old_value() {
    let abc = compile("def f(x):\n    x += 1\n    return x\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::GetLocal(_),
        Op::PushByte(1),
        Op::Add,
        Op::CoerceA,
        Op::SetLocal(_),
    );
}

#[test]
fn attribute_augmented_assignment_dups_the_receiver() {
    let abc = compile("def f(o):\n    o.count += 1\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::GetLocal(_),
        Op::Dup,
        Op::GetProperty(Multiname::QName { name, .. }) if name == "count",
        Op::PushByte(1),
        Op::Add,
        Op::SetProperty(Multiname::QName { name, .. }) if name == "count",
    );
}

#[test]
fn subscript_stores_use_the_runtime_name() {
    let abc = compile("def f(o, k, v):\n    o[k] = v\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::GetLocal(_),
        Op::GetLocal(_),
        Op::GetLocal(_),
        Op::SetProperty(Multiname::MultinameL { .. }),
    );
}

#[test]
fn del_kills_registers_and_deletes_properties() {
    let abc = compile("def f(o, x):\n    del x\n    del o.field\n");
    let body = body_named(&abc, "test.py$1:f");
    assert_ops_in_order!(
        body.code,
        Op::Kill(_),
        Op::GetLocal(_),
        Op::DeleteProperty(Multiname::QName { name, .. }) if name == "field",
        Op::Pop,
    );
}

// ---------------------------------------------------------------------
// Eval mode
// ---------------------------------------------------------------------

#[test]
fn eval_functions_route_lookups_through_pushwith() {
    let abc = compile("@__eval__\ndef run(code):\n    result = code\n    result\n");
    let body = body_named(&abc, "test.py$1:run");
    assert_ops_in_order!(
        body.code,
        Op::GetLocal0,
        Op::PushWith,
        // The argument lands in the dictionary scope, not a register.
        Op::GetLocal0,
        Op::GetLocal(_),
        Op::SetProperty(Multiname::QName { name, .. }) if name == "code",
        // Assignment probes the chain under a ReferenceError guard.
        Op::FindPropStrict(Multiname::QName { name, .. }) if name == "result",
        Op::NewCatch(_),
        Op::SetProperty(Multiname::QName { name, .. }) if name == "result",
        // The trailing expression becomes the return value.
        Op::GetLex(Multiname::QName { name, .. }) if name == "result",
        Op::ReturnValue,
    );
    assert_eq!(body.exceptions.len(), 1);
    assert_eq!(body.exceptions[0].exc_type.name(), Some("ReferenceError"));
}

// ---------------------------------------------------------------------
// Module-level functions and the script
// ---------------------------------------------------------------------

#[test]
fn package_functions_publish_as_script_traits() {
    let abc = compile("@package('app')\ndef go(n):\n    return n\n");
    let script = &abc.scripts[0];
    let t = script
        .traits
        .iter()
        .find(|t| t.name.name() == Some("go"))
        .unwrap();
    assert!(matches!(t.kind, TraitKind::Method { .. }));
    assert!(matches!(
        t.name.namespace(),
        Some(Namespace::Package(pkg)) if pkg == "app"
    ));
}

#[test]
fn module_locals_live_in_script_registers() {
    let abc = compile("x = 1\ny = x + 2\n");
    let body = script_body(&abc);
    assert_ops_in_order!(
        body.code,
        Op::PushByte(1),
        Op::CoerceA,
        Op::SetLocal(_),
        Op::GetLocal(_),
        Op::PushByte(2),
        Op::Add,
        Op::SetLocal(_),
    );
    assert!(body.local_count >= 3);
}
