//! tests/integration.rs — end-to-end scenarios for the Cave language core.
//!
//! Exercises the public embedding surface only (`cave::{Vm, interpret,
//! Error}`), mirroring the teacher's `vitte-core/tests/integration.rs`
//! convention of one integration test file per crate. The concrete
//! program -> stdout scenarios are taken verbatim from spec.md §8;
//! `print` (not a top-level `return`, which spec.md §4.2 makes a compile
//! error) is how each program surfaces its result, so every test here
//! runs against a small capturing [`cave::vm::Host`] rather than
//! inspecting `interpret`'s return value.

use std::cell::RefCell;
use std::rc::Rc;

use cave::vm::{Host, Vm};
use cave::{Error, NativeResult, Value};
use indoc::indoc;
use pretty_assertions::assert_eq;

#[derive(Clone, Default)]
struct CapturingHost(Rc<RefCell<Vec<String>>>);

impl Host for CapturingHost {
    fn print(&mut self, text: &str) {
        self.0.borrow_mut().push(text.to_string());
    }
}

fn run(source: &str) -> (cave::Result<Value>, Vec<String>) {
    let sink = CapturingHost::default();
    let mut vm = Vm::new().with_host(Box::new(sink.clone()));
    let result = vm.interpret(source.as_bytes());
    let lines = sink.0.borrow().clone();
    (result, lines)
}

#[test]
fn scenario_arithmetic_and_precedence() {
    let (result, lines) = run("print 1 + 2 * 3 - 4 / 2;");
    result.expect("script runs");
    assert_eq!(lines, vec!["5"]);
}

#[test]
fn scenario_locals_conditionals_compound_assignment() {
    let src = "var x = 10; if (x > 5) { x += 2; } else { x -= 2; } print x;";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["12"]);
}

#[test]
fn scenario_while_with_break_and_continue() {
    let src = indoc! {"
        var i = 0; var s = 0;
        while (i < 10) {
            i += 1;
            if (i == 5) continue;
            if (i == 8) break;
            s += i;
        }
        print s;
    "};
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["22"]);
}

#[test]
fn scenario_string_interpolation() {
    let src = "var n = 3; print \"there are ${n + 1} items\";";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["there are 4 items"]);
}

#[test]
fn scenario_function_call_with_return() {
    let src = "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["120"]);
}

#[test]
fn scenario_substring_slicing() {
    let src = "var s = \"abcdef\"; print s[1:5]; print s[::-1];";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["bcde", "fedcba"]);
}

#[test]
fn do_while_loop_runs_body_at_least_once() {
    let src = "var n = 0; do { n += 1; } while (n < 3); print n;";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn for_loop_increment_runs_after_body_each_iteration() {
    let src = "var total = 0; for (var i = 0; i < 5; i += 1) { total += i; } print total;";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["10"]);
}

#[test]
fn ternary_and_logical_operators_short_circuit() {
    let src = indoc! {r#"
        var calls = 0;
        fun bump() { calls += 1; return true; }
        var x = false and bump();
        print calls;
        print (1 < 2) ? "yes" : "no";
    "#};
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["0", "yes"]);
}

#[test]
fn string_indexing_and_stepped_ranges() {
    let src = "var s = \"abcdef\"; print s[0]; print s[-1]; print s[0:6:2];";
    let (result, lines) = run(src);
    result.expect("script runs");
    assert_eq!(lines, vec!["a", "f", "ace"]);
}

#[test]
fn compile_error_is_reported_without_running() {
    let (result, lines) = run("var = 1;");
    assert!(matches!(result, Err(Error::Compile(_))));
    assert!(lines.is_empty());
}

#[test]
fn runtime_error_carries_a_frame_trace() {
    let src = "fun inner() { return 1 / nil; } fun outer() { return inner(); } outer();";
    let (result, _lines) = run(src);
    match result {
        Err(Error::Runtime { trace, .. }) => {
            assert_eq!(trace.len(), 3);
            assert_eq!(trace[0].name, "inner");
            assert_eq!(trace[1].name, "outer");
            assert_eq!(trace[2].name, "script");
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn switch_tokens_remain_reserved_but_unimplemented() {
    // spec.md §1/§9: `switch`/`case`/`default` tokenise but the compiler
    // never wires them into a statement form.
    let (result, _lines) = run("switch (1) { case 1: print 1; }");
    assert!(matches!(result, Err(Error::Compile(_))));
}

#[test]
fn host_can_register_and_call_native_functions() {
    let sink = CapturingHost::default();
    let mut vm = Vm::new().with_host(Box::new(sink.clone()));
    vm.define_native(
        "double",
        1,
        Rc::new(|args: &[Value]| match args[0].as_number() {
            Some(n) => NativeResult::Value(Value::Number(n * 2.0)),
            None => NativeResult::Fail("double() expects a number".to_string()),
        }),
    );
    vm.interpret(b"print double(21);").unwrap();
    assert_eq!(*sink.0.borrow(), vec!["42"]);
}

#[test]
fn runtime_compile_supports_repeated_stepping_with_mutated_locals() {
    let mut vm = Vm::new();
    let call = vm.runtime_compile(b"frame * 10 + index").unwrap();
    for frame in 0..3 {
        for index in 0..2 {
            call.set_frame(&mut vm, frame as f64);
            call.set_index(&mut vm, index as f64);
            let value = call.step(&mut vm).unwrap();
            assert_eq!(value, Value::Number((frame * 10 + index) as f64));
        }
    }
    call.finish(&mut vm);
}
