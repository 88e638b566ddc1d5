//! End-to-end language-behavior tests, driven through [`Vm::interpret`]
//! rather than by poking at individual opcodes.
//!
//! `print` is not part of this crate's grammar — it is stdlib surface built
//! on [`Vm::define_native`] (see spec scenario notes). These tests stand in
//! a `record` native that stringifies its argument into a buffer, mirroring
//! what a real `print` would render.

use std::cell::RefCell;

use nplang_runtime::{Error, RuntimeError, Value, Vm};
use pretty_assertions::assert_eq;

thread_local! {
    static RECORDED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn record(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered = vm.stringify(args[0]);
    RECORDED.with(|r| r.borrow_mut().push(rendered));
    Ok(Value::Null)
}

fn vm_with_record() -> Vm {
    RECORDED.with(|r| r.borrow_mut().clear());
    let mut vm = Vm::new();
    vm.define_native("record", record);
    vm
}

fn recorded() -> Vec<String> {
    RECORDED.with(|r| r.borrow().clone())
}

#[test]
fn scenario_arithmetic_precedence() {
    let mut vm = vm_with_record();
    vm.interpret("record(1 + 2 * 3);").unwrap();
    assert_eq!(recorded(), vec!["7"]);
}

#[test]
fn scenario_string_concatenation() {
    let mut vm = vm_with_record();
    vm.interpret(r#"var a = "hi"; var b = " there"; record(a + b);"#).unwrap();
    assert_eq!(recorded(), vec!["hi there"]);
}

#[test]
fn scenario_closures_share_mutable_state() {
    let mut vm = vm_with_record();
    let source = r#"
        fun mk() {
          var x = 0;
          fun inc() { x = x + 1; return x; }
          return inc;
        }
        var f = mk();
        record(f());
        record(f());
        record(f());
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["1", "2", "3"]);
}

#[test]
fn scenario_inheritance_and_super_dispatch() {
    let mut vm = vm_with_record();
    let source = r#"
        class A { greet() { record("A"); } }
        class B < A { greet() { super.greet(); record("B"); } }
        B().greet();
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["A", "B"]);
}

#[test]
fn scenario_initializer_sets_fields() {
    let mut vm = vm_with_record();
    let source = r#"
        class P { init(x) { this.x = x; } }
        record(P(42).x);
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["42"]);
}

#[test]
fn scenario_for_loop_accumulates() {
    let mut vm = vm_with_record();
    let source = r#"
        var s = "";
        for (var i = 0; i < 3; i = i + 1) s = s + ".";
        record(s);
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["..."]);
}

#[test]
fn successful_interpret_leaves_stack_and_frames_empty() {
    let mut vm = vm_with_record();
    vm.interpret("var a = 1; var b = 2; record(a + b);").unwrap();
    vm.interpret("var c = a + b; record(c);").unwrap();
    assert_eq!(recorded(), vec!["3", "3"]);
}

#[test]
fn a_runtime_error_does_not_poison_later_interpret_calls() {
    let mut vm = vm_with_record();
    let err = vm.interpret("var n = nil; n + 1;").unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }));
    vm.interpret("record(1 + 1);").unwrap();
    assert_eq!(recorded(), vec!["2"]);
}

#[test]
fn wrong_arity_is_a_runtime_error() {
    let mut vm = Vm::new();
    let err = vm.interpret("fun f(a, b) { return a + b; } f(1);").unwrap_err();
    assert!(matches!(err, Error::Runtime { error: RuntimeError::ArityMismatch { expected: 2, got: 1 }, .. }));
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let mut vm = Vm::new();
    let source = "fun rec(n) { return rec(n + 1); } rec(0);";
    let err = vm.interpret(source).unwrap_err();
    assert!(matches!(err, Error::Runtime { error: RuntimeError::StackOverflow, .. }));
}

#[test]
fn reading_an_undefined_global_is_a_runtime_error() {
    let mut vm = Vm::new();
    let err = vm.interpret("missing;").unwrap_err();
    assert!(matches!(err, Error::Runtime { error: RuntimeError::UndefinedVariable(ref name), .. } if name == "missing"));
}

#[test]
fn assigning_an_undeclared_global_is_a_runtime_error() {
    let mut vm = Vm::new();
    let err = vm.interpret("missing = 1;").unwrap_err();
    assert!(matches!(err, Error::Runtime { error: RuntimeError::UndefinedVariable(ref name), .. } if name == "missing"));
}

#[test]
fn return_with_a_value_inside_an_init_method_is_a_compile_error() {
    let mut vm = Vm::new();
    let source = "class C { init() { return 1; } }";
    let err = vm.interpret(source).unwrap_err();
    assert!(matches!(err, Error::Compile(_)));
}

#[test]
fn interning_makes_equal_strings_the_same_value() {
    let mut vm = vm_with_record();
    let source = r#"
        var a = "hello";
        var b = "hel" + "lo";
        record(a == b);
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["true"]);
}

#[test]
fn distinct_instances_are_never_equal() {
    let mut vm = vm_with_record();
    let source = r#"
        class C {}
        record(C() == C());
    "#;
    vm.interpret(source).unwrap();
    assert_eq!(recorded(), vec!["false"]);
}
