//! cave — scanner, single-pass bytecode compiler and stack-based VM for
//! the Cave scripting language.
//!
//! Cave started life embedded in a wavetable synthesis host; this crate
//! carries only the language core (lexing, compiling, executing), never
//! the DSP engine, FFT, WAV I/O, or a CLI front end. A host embeds this
//! crate by calling [`interpret`] on a source buffer and registering
//! native functions via [`Vm::define_native`] before doing so.
//!
//! Grounded on `vitte-core`'s crate layout (`src/lib.rs` module wiring,
//! feature gates, `#![forbid(unsafe_code)]`) with the module boundaries
//! drawn from `original_source/src/*.c`: one module per translation unit
//! (`scanner.c` → [`scanner`], `compiler.c` → [`compiler`], `chunk.c` +
//! `lines.c` → [`chunk`], `value.c` + `object.c` → [`value`], `table.c`
//! → [`table`], `vm.c` → [`vm`]).

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod chunk;
pub mod compiler;
#[cfg(feature = "disasm")]
pub mod disasm;
pub mod error;
pub mod native;
pub mod opcode;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

/// Fixed value-stack capacity. Grounded on `original_source/src/vm.h`'s
/// `#define STACK_MAX 16384`; exceeding it is a compile-time local-slot
/// error or a runtime `Error::CapacityExceeded`, never a silent resize
/// (spec.md §9: fixed-capacity stack, no growth).
pub const STACK_MAX: usize = 16384;

/// Maximum call-frame depth. Grounded on `original_source/src/vm.h`'s
/// `#define FRAMES_MAX 256`.
pub const FRAMES_MAX: usize = 256;

pub use error::{CompileDiagnostic, Error, Result, TraceFrame};
pub use value::{Function, Native, NativeFn, NativeResult, Object, Value};
pub use vm::{RuntimeCall, Vm};

/// Compiles and runs `source` in a fresh [`Vm`] with only the default
/// native library registered (see [`native::install_defaults`]).
///
/// Most hosts want their own native set; construct a [`Vm`] directly and
/// call [`Vm::interpret`] when that's the case.
pub fn interpret(source: &[u8]) -> Result<Value> {
    let mut vm = Vm::new();
    native::install_defaults(&mut vm);
    vm.interpret(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::run_and_capture;

    #[test]
    fn end_to_end_arithmetic_and_print() {
        let (result, lines) = run_and_capture(b"var x = 1 + 2 * 3; print x;");
        result.unwrap();
        assert_eq!(lines, vec!["7"]);
    }

    #[test]
    fn end_to_end_undefined_global_is_a_runtime_error() {
        let result = interpret(b"missing;");
        assert!(matches!(result, Err(Error::Runtime { .. })));
    }

    #[test]
    fn end_to_end_compile_error_is_reported() {
        let result = interpret(b"var = 1;");
        assert!(matches!(result, Err(Error::Compile(_))));
    }
}
