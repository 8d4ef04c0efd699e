//! Error types shared by the compiler and VM.
//!
//! Grounded on `vitte-core`'s `thiserror`-based `Error` enum
//! (`crates/vitte-core/src/lib.rs`): one variant per failure family, plain
//! `String` payloads rather than structured diagnostics, since the host
//! only needs a message and a line/frame trace to print.

use thiserror::Error;

/// A single compiler diagnostic: `[line N] Error at '...': message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDiagnostic {
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

/// One stack frame in a runtime error trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The implicit top-level frame prints as "in script", every named
        // function as "in name()" (`runtimeError` in vm.c).
        if self.name == "script" {
            write!(f, "[line {}] in script", self.line)
        } else {
            write!(f, "[line {}] in {}()", self.line, self.name)
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Compilation failed; carries every diagnostic collected before
    /// `had_error` tripped (panic mode only suppresses *reporting*, not
    /// collection, of further errors within the same statement group).
    #[error("compile error: {}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
    Compile(Vec<CompileDiagnostic>),

    /// A runtime error: message plus the call-frame trace at the point of
    /// failure, innermost frame first.
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        trace: Vec<TraceFrame>,
    },

    /// The host asked for more resources than a fixed-capacity table has
    /// (value stack, frame stack, break/continue fixup slots, constant
    /// pool indices).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    #[cfg(feature = "serde")]
    #[error("chunk (de)serialization failed: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
