//! vm.rs — the stack-based bytecode interpreter.
//!
//! Call frames live in a flat array, arithmetic dispatch is four typed
//! helper functions rather than a bit-packed integer switch (a sealed
//! `Value` enum already gives exhaustive matching for free), substrings
//! and ranges materialise eagerly on indexing, and a runtime error walks
//! the live frames into a printable stack trace. Frame bookkeeping
//! follows an explicit, non-global `Vm` context with a pluggable `Host`
//! for `print` rather than an `OpAdapter`-style trait: the opcode set is
//! fixed and known ahead of time, so there is nothing to adapt.

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::compiler;
use crate::error::{Error, Result, TraceFrame};
use crate::opcode::OpCode;
use crate::table::{Globals, Interner};
use crate::value::{Function, NativeResult, Object, Value};
use crate::{FRAMES_MAX, STACK_MAX};

/// Host-provided sink for `print`. A library crate should not assume
/// stdout is available or desired, so this is the one point where the
/// VM talks to the outside world.
pub trait Host {
    fn print(&mut self, text: &str);
}

/// Prints to stdout, one line per `print` statement. Used unless a host
/// installs its own sink via [`Vm::with_host`].
#[derive(Debug, Default)]
pub struct StdoutHost;

impl Host for StdoutHost {
    fn print(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Construction-time limits. Defaults mirror the fixed capacities
/// (`STACK_MAX` / `FRAMES_MAX`); tests shrink them to exercise
/// `"stack overflow"` / `"too many call frames"` without allocating
/// 16384 stack slots.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    pub stack_capacity: usize,
    pub frame_capacity: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stack_capacity: STACK_MAX,
            frame_capacity: FRAMES_MAX,
        }
    }
}

struct CallFrame {
    function: Rc<Function>,
    ip: usize,
    base: usize,
}

/// The Cave virtual machine: value stack, call frames, globals, string
/// interner, and the host print sink. Owns everything it touches — no
/// module-level singleton, so two `Vm`s never share state.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Globals,
    interner: Interner,
    options: VmOptions,
    host: Box<dyn Host>,
    /// Scratch slot written by `OP_EXTRACT`, read back by
    /// [`RuntimeCall::step`]. Grounded on `vm.h`'s `Value output`.
    output: Value,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("stack_depth", &self.stack.len())
            .field("frame_depth", &self.frames.len())
            .finish()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        Vm {
            stack: Vec::with_capacity(256.min(options.stack_capacity)),
            frames: Vec::with_capacity(8.min(options.frame_capacity)),
            globals: Globals::new(),
            interner: Interner::new(),
            options,
            host: Box::new(StdoutHost),
            output: Value::Nil,
        }
    }

    pub fn with_host(mut self, host: Box<dyn Host>) -> Vm {
        self.host = host;
        self
    }

    /// Registers a native function into the globals table, keyed by
    /// `name`. Grounded on `vm.c::defineNative`.
    pub fn define_native(&mut self, name: &str, arity: u8, function: crate::value::NativeFn) {
        let interned = self.interner.intern(name);
        let native = crate::value::Native {
            name: interned.clone(),
            arity,
            function,
        };
        self.globals.define(interned, Value::native(Rc::new(native)));
    }

    /// Compiles and runs `source` as a complete script. Grounded on
    /// `vm.c::interpret`: resets the stack, compiles, pushes the script
    /// function as frame 0, and runs to completion.
    pub fn interpret(&mut self, source: &[u8]) -> Result<Value> {
        #[cfg(feature = "tracing")]
        tracing::debug!(bytes = source.len(), "interpreting script");
        self.stack.clear();
        self.frames.clear();
        let function = compiler::compile(source, &mut self.interner)?;
        let function = Rc::new(function);
        self.push(Value::function(function.clone()))?;
        self.call_function(function, 0)?;
        self.run()
    }

    /// Compiles `source` as a single runtime-evaluated expression (the
    /// host's wavetable-per-sample hook) and leaves a persistent call
    /// frame set up for repeated [`RuntimeCall::step`] invocations.
    /// Grounded on `compiler.c::runtimeCompile` + `vm.c::editWaveNative`'s
    /// push/call/run-in-a-loop pattern.
    pub fn runtime_compile(&mut self, source: &[u8]) -> Result<RuntimeCall> {
        let function = compiler::runtime_compile(source, &mut self.interner)?;
        let function = Rc::new(function);
        let base = self.stack.len();
        self.push(Value::function(function.clone()))?;
        self.push(Value::Number(0.0))?; // frame
        self.push(Value::Number(0.0))?; // index
        if self.frames.len() == self.options.frame_capacity {
            return Err(Error::CapacityExceeded("too many call frames"));
        }
        self.frames.push(CallFrame {
            function: function.clone(),
            ip: 0,
            base,
        });
        Ok(RuntimeCall { function, base })
    }

    // ---------------- stack primitives ----------------

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.options.stack_capacity {
            self.stack.clear();
            self.frames.clear();
            return Err(Error::Runtime {
                message: "Stack overflow".to_string(),
                trace: Vec::new(),
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on empty value stack")
    }

    fn peek(&self, distance: usize) -> &Value {
        let idx = self.stack.len() - 1 - distance;
        &self.stack[idx]
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> Error {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            // `ip` has already advanced past the opcode byte, mirroring
            // `runtimeError`'s `frame->ip - function->chunk.code - 1`.
            let offset = frame.ip.saturating_sub(1);
            let line = frame.function.chunk.get_line(offset).unwrap_or(0);
            let name = frame
                .function
                .name
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "script".to_string());
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        let message = message.into();
        #[cfg(feature = "tracing")]
        tracing::warn!(%message, frames = trace.len(), "runtime error");
        Error::Runtime { message, trace }
    }

    // ---------------- calls ----------------

    fn call_function(&mut self, function: Rc<Function>, argc: u8) -> Result<()> {
        if argc != function.arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {argc}",
                function.arity
            )));
        }
        if self.frames.len() == self.options.frame_capacity {
            return Err(self.runtime_error("Stack overflow"));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            function,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// `OP_CALL`: dispatches on the callee at `sp - argc - 1`. Grounded
    /// on `vm.c::callValue`.
    fn call_value(&mut self, argc: u8) -> Result<()> {
        let callee = self.peek(argc as usize).clone();
        if let Some(function) = callee.as_function() {
            let function = function.clone();
            self.call_function(function, argc)
        } else if let Some(native) = callee.as_native() {
            let native = native.clone();
            if argc != native.arity {
                return Err(self.runtime_error(format!(
                    "Expected {} arguments but got {argc}",
                    native.arity
                )));
            }
            let args_start = self.stack.len() - argc as usize;
            let args = self.stack[args_start..].to_vec();
            match (native.function)(&args) {
                NativeResult::Value(value) => {
                    self.stack.truncate(self.stack.len() - argc as usize - 1);
                    self.push(value)
                }
                NativeResult::Fail(message) => Err(self.runtime_error(message)),
            }
        } else {
            Err(self.runtime_error("Can only call functions and classes"))
        }
    }

    // ---------------- arithmetic ----------------

    /// `+`/`-`/`*`/`/`/`%` coerce `Bool`/`Number` freely; `nil`,
    /// functions and natives never coerce. Grounded on `vm.c`'s
    /// `FOUR_TYPE_ID` switch, collapsed into one helper since Rust's
    /// `Option` already gives us the "is this coercible" test for free.
    fn numeric_of(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn is_bool(value: &Value) -> bool {
        matches!(value, Value::Bool(_))
    }

    /// Wraps an arithmetic result back to `Bool` when both operands were
    /// bools (non-zero round-trips to `true`), else as a plain `Number`.
    fn wrap_numeric(result: f64, both_bool: bool) -> Value {
        if both_bool {
            Value::Bool(result != 0.0)
        } else {
            Value::Number(result)
        }
    }

    fn binary_add(&mut self) -> Result<()> {
        let b = self.pop();
        let a = self.pop();
        if let (Some(sa), Some(sb)) = (a.as_str(), b.as_str()) {
            let mut combined = String::with_capacity(sa.len() + sb.len());
            combined.push_str(sa);
            combined.push_str(sb);
            let interned = self.interner.intern(&combined);
            return self.push(Value::string(interned));
        }
        match (Self::numeric_of(&a), Self::numeric_of(&b)) {
            (Some(x), Some(y)) => {
                let both_bool = Self::is_bool(&a) && Self::is_bool(&b);
                self.push(Self::wrap_numeric(x + y, both_bool))
            }
            _ => {
                if a.as_str().is_some() || b.as_str().is_some() {
                    Err(self.runtime_error("Can only concat two strings"))
                } else {
                    Err(self.runtime_error("Cannot add nil or functions"))
                }
            }
        }
    }

    fn binary_numeric(&mut self, op: fn(f64, f64) -> f64, nil_msg: &str, str_msg: &str) -> Result<()> {
        let b = self.pop();
        let a = self.pop();
        match (Self::numeric_of(&a), Self::numeric_of(&b)) {
            (Some(x), Some(y)) => {
                let both_bool = Self::is_bool(&a) && Self::is_bool(&b);
                self.push(Self::wrap_numeric(op(x, y), both_bool))
            }
            _ => {
                if a.as_str().is_some() || b.as_str().is_some() {
                    Err(self.runtime_error(str_msg))
                } else {
                    Err(self.runtime_error(nil_msg))
                }
            }
        }
    }

    /// Repeats `s` `times` times (`<= 0` yields `""`); grounded on
    /// `vm.c::multiplyStringA`/`multiplyStringB`.
    fn repeat_string(&mut self, s: &str, times: f64) -> Value {
        let n = (times as i64).max(0) as usize;
        let interned = self.interner.intern(&s.repeat(n));
        Value::string(interned)
    }

    fn binary_multiply(&mut self) -> Result<()> {
        let b = self.pop();
        let a = self.pop();
        if let Some(s) = a.as_str() {
            if let Some(n) = Self::numeric_of(&b) {
                let value = self.repeat_string(s, n);
                return self.push(value);
            }
            return if b.as_str().is_some() {
                Err(self.runtime_error("Can only multiply string by a number or bool"))
            } else {
                Err(self.runtime_error("Cannot multiply by nil or functions"))
            };
        }
        if let Some(s) = b.as_str() {
            if let Some(n) = Self::numeric_of(&a) {
                let value = self.repeat_string(s, n);
                return self.push(value);
            }
            return Err(self.runtime_error("Cannot multiply by nil or functions"));
        }
        match (Self::numeric_of(&a), Self::numeric_of(&b)) {
            (Some(x), Some(y)) => {
                let both_bool = Self::is_bool(&a) && Self::is_bool(&b);
                self.push(Self::wrap_numeric(x * y, both_bool))
            }
            _ => Err(self.runtime_error("Cannot multiply by nil or functions")),
        }
    }

    fn compare(&mut self, cmp: fn(f64, f64) -> bool) -> Result<()> {
        let b = self.pop();
        let a = self.pop();
        match (Self::numeric_of(&a), Self::numeric_of(&b)) {
            (Some(x), Some(y)) => self.push(Value::Bool(cmp(x, y))),
            _ => Err(self.runtime_error("Operands must be numbers or bools")),
        }
    }

    fn stringify(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Number(n) => format!("{n}"),
            Value::Obj(o) => match o.as_ref() {
                Object::String(s) => s.to_string(),
                _ => "<fn>".to_string(),
            },
        }
    }

    fn interpolate(&mut self) -> Result<()> {
        let b = self.pop();
        let a = self.pop();
        let base = a.as_str().expect("interpolation base is always a string constant");
        let mut combined = String::with_capacity(base.len());
        combined.push_str(base);
        combined.push_str(&self.stringify(&b));
        let interned = self.interner.intern(&combined);
        self.push(Value::string(interned))
    }

    // ---------------- indexing ----------------

    /// Shared substring walk for `INDEX_RANGE`/`INDEX_RANGE_INTERVAL`.
    /// Grounded verbatim on `vm.c::pushIndexRange`: for a positive step,
    /// walk forward from `start` (only if it lands in-bounds) while
    /// `i < end` (clamped down to `len`); for a negative step, walk
    /// backward while `i > end` (clamped up to `-1`).
    fn materialize_range(bytes: &[u8], start: i64, mut end: i64, step: i64) -> Vec<u8> {
        let len = bytes.len() as i64;
        let mut out = Vec::new();
        if step > 0 {
            if start >= 0 && start < len {
                if end > len {
                    end = len;
                }
                let mut i = start;
                while i < end {
                    out.push(bytes[i as usize]);
                    i += step;
                }
            }
        } else if start >= 0 && start < len {
            if end < -1 {
                end = -1;
            }
            let mut i = start;
            while i > end {
                out.push(bytes[i as usize]);
                i += step;
            }
        }
        out
    }

    fn op_index(&mut self) -> Result<()> {
        let index = self.peek(0).as_number();
        let Some(index) = index else {
            return Err(self.runtime_error("Index must be a number"));
        };
        let Some(s) = self.peek(1).as_str() else {
            return Err(self.runtime_error("Can only index strings"));
        };
        let s = s.to_string();
        self.pop();
        self.pop();
        let len = s.len() as i64;
        let mut i = index as i64;
        if i < 0 {
            i += len;
        }
        if i < 0 || i >= len {
            return Err(self.runtime_error("Index out of bounds"));
        }
        let byte = s.as_bytes()[i as usize];
        let interned = self.interner.intern(std::str::from_utf8(&[byte]).unwrap_or(""));
        self.push(Value::string(interned))
    }

    fn op_index_range(&mut self) -> Result<()> {
        let end_v = self.peek(0).clone();
        let start_v = self.peek(1).clone();
        let Some(s) = self.peek(2).as_str() else {
            return Err(self.runtime_error("Can only index strings"));
        };
        if !matches!(start_v, Value::Number(_) | Value::Nil) || !matches!(end_v, Value::Number(_) | Value::Nil) {
            return Err(self.runtime_error("Index ranges must be nil or a number"));
        }
        let s = s.to_string();
        let len = s.len() as i64;
        let mut start = start_v.as_number().map(|n| n as i64).unwrap_or(0);
        let mut end = end_v.as_number().map(|n| n as i64).unwrap_or(len);
        if start < 0 {
            start += len;
        }
        if end < 0 {
            end += len;
        }
        self.pop();
        self.pop();
        self.pop();
        let bytes = Self::materialize_range(s.as_bytes(), start, end, 1);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let interned = self.interner.intern(&text);
        self.push(Value::string(interned))
    }

    fn op_index_range_interval(&mut self) -> Result<()> {
        let interval_v = self.peek(0).clone();
        let end_v = self.peek(1).clone();
        let start_v = self.peek(2).clone();
        let Some(s) = self.peek(3).as_str() else {
            return Err(self.runtime_error("Can only index strings"));
        };
        if !matches!(start_v, Value::Number(_) | Value::Nil)
            || !matches!(end_v, Value::Number(_) | Value::Nil)
            || !matches!(interval_v, Value::Number(_) | Value::Nil)
        {
            return Err(self.runtime_error("Index ranges and interval must be nil or a number"));
        }
        let s = s.to_string();
        let len = s.len() as i64;
        let interval = interval_v.as_number().map(|n| n as i64).unwrap_or(1);

        let mut start = match start_v.as_number() {
            Some(n) => n as i64,
            None => {
                if interval > 0 {
                    0
                } else {
                    len - 1
                }
            }
        };
        if start_v.as_number().is_some() && start < 0 {
            start += len;
        }
        let mut end = match end_v.as_number() {
            Some(n) => n as i64,
            None => {
                if interval > 0 {
                    len
                } else {
                    -1
                }
            }
        };
        if end_v.as_number().is_some() && end < 0 {
            end += len;
        }

        self.pop();
        self.pop();
        self.pop();
        self.pop();

        if interval == 0 {
            return Err(self.runtime_error("Interval cannot be '0'"));
        }

        let bytes = Self::materialize_range(s.as_bytes(), start, end, interval);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let interned = self.interner.intern(&text);
        self.push(Value::string(interned))
    }

    // ---------------- bytecode reads ----------------

    fn read_u8(&mut self, frame: usize) -> u8 {
        let ip = self.frames[frame].ip;
        self.frames[frame].ip += 1;
        self.frames[frame].function.chunk.code[ip]
    }

    fn read_u16(&mut self, frame: usize) -> u16 {
        let ip = self.frames[frame].ip;
        self.frames[frame].ip += 2;
        self.frames[frame].function.chunk.read_u16(ip)
    }

    fn read_u24(&mut self, frame: usize) -> u32 {
        let ip = self.frames[frame].ip;
        self.frames[frame].ip += 3;
        self.frames[frame].function.chunk.read_u24(ip)
    }

    fn constant_string(value: &Value) -> Rc<str> {
        match value {
            Value::Obj(o) => match o.as_ref() {
                Object::String(s) => s.clone(),
                _ => unreachable!("identifier constants are always strings"),
            },
            _ => unreachable!("identifier constants are always strings"),
        }
    }

    // ---------------- the interpreter loop ----------------

    /// Runs from the current top frame until either the script's
    /// implicit/explicit top-level `return` unwinds frame 0, or
    /// `OP_EXTRACT` halts a runtime-compiled expression. Grounded on
    /// `vm.c::run`. Both [`Vm::interpret`] and [`RuntimeCall::step`]
    /// re-enter this loop; it never assumes frame 0 is the caller.
    fn run(&mut self) -> Result<Value> {
        let mut frame = self.frames.len() - 1;
        loop {
            let chunk_len = self.frames[frame].function.chunk.len();
            if self.frames[frame].ip >= chunk_len {
                return Err(self.runtime_error("Unrecognized bytecode"));
            }
            let byte = self.read_u8(frame);
            let Some(op) = OpCode::from_u8(byte) else {
                return Err(self.runtime_error("Unrecognized bytecode"));
            };

            match op {
                OpCode::Constant => {
                    let idx = self.read_u8(frame) as usize;
                    let value = self.frames[frame].function.chunk.constants[idx].clone();
                    self.push(value)?;
                }
                OpCode::ConstantLong => {
                    let idx = self.read_u24(frame) as usize;
                    let value = self.frames[frame].function.chunk.constants[idx].clone();
                    self.push(value)?;
                }

                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,

                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_u24(frame) as usize;
                    self.stack.truncate(self.stack.len() - n);
                }

                OpCode::Add => self.binary_add()?,
                OpCode::Subtract => self.binary_numeric(
                    |a, b| a - b,
                    "Cannot subtract nil or functions",
                    "Cannot subtract strings",
                )?,
                OpCode::Multiply => self.binary_multiply()?,
                OpCode::Divide => self.binary_numeric(
                    |a, b| a / b,
                    "Cannot divide by nil or functions",
                    "Cannot divide strings",
                )?,
                OpCode::Mod => self.binary_numeric(
                    |a, b| a % b,
                    "Cannot mod by nil or functions",
                    "Cannot mod strings",
                )?,
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number"));
                    };
                    let slot = self.stack.len() - 1;
                    self.stack[slot] = Value::Number(-n);
                }

                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()))?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b))?;
                }
                OpCode::Greater => self.compare(|a, b| a > b)?,
                OpCode::GreaterEqual => self.compare(|a, b| a >= b)?,
                OpCode::Less => self.compare(|a, b| a < b)?,
                OpCode::LessEqual => self.compare(|a, b| a <= b)?,

                OpCode::InterpolateStr => self.interpolate()?,

                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let idx = if op == OpCode::DefineGlobal {
                        self.read_u8(frame) as usize
                    } else {
                        self.read_u24(frame) as usize
                    };
                    let name = Self::constant_string(&self.frames[frame].function.chunk.constants[idx]);
                    let value = self.pop();
                    self.globals.define(name, value);
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let idx = if op == OpCode::GetGlobal {
                        self.read_u8(frame) as usize
                    } else {
                        self.read_u24(frame) as usize
                    };
                    let name = Self::constant_string(&self.frames[frame].function.chunk.constants[idx]);
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value)?;
                        }
                        None => return Err(self.runtime_error(format!("Undefined variable '{name}'"))),
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let idx = if op == OpCode::SetGlobal {
                        self.read_u8(frame) as usize
                    } else {
                        self.read_u24(frame) as usize
                    };
                    let name = Self::constant_string(&self.frames[frame].function.chunk.constants[idx]);
                    let value = self.peek(0).clone();
                    if !self.globals.set(&name, value) {
                        return Err(self.runtime_error(format!("Undefined variable '{name}'")));
                    }
                }

                OpCode::DefineGlobalStack => {
                    let Some(name) = self.peek(1).as_str().map(|s| s.to_string()) else {
                        return Err(self.runtime_error("Can only use strings to define global variables"));
                    };
                    let interned = self.interner.intern(&name);
                    let value = self.peek(0).clone();
                    self.globals.define(interned, value);
                    self.pop();
                    self.pop();
                }
                OpCode::SetGlobalStack => {
                    let Some(name) = self.peek(1).as_str().map(|s| s.to_string()) else {
                        return Err(self.runtime_error("Can only use strings to set global variables"));
                    };
                    let value = self.peek(0).clone();
                    if !self.globals.set(&name, value) {
                        return Err(self.runtime_error(format!("Undefined variable '{name}'")));
                    }
                    self.pop();
                    self.pop();
                }
                OpCode::GetGlobalStack => {
                    let Some(name) = self.peek(0).as_str().map(|s| s.to_string()) else {
                        return Err(self.runtime_error("Can only use strings to access global variables"));
                    };
                    self.pop();
                    let value = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                    self.push(value)?;
                }
                OpCode::GetGlobalStackPopless => {
                    let Some(name) = self.peek(0).as_str().map(|s| s.to_string()) else {
                        return Err(self.runtime_error("Can only use strings to access global variables"));
                    };
                    let value = self.globals.get(&name).cloned().unwrap_or(Value::Nil);
                    self.push(value)?;
                }

                OpCode::GetLocal => {
                    let slot = self.read_u8(frame) as usize;
                    let value = self.stack[self.frames[frame].base + slot].clone();
                    self.push(value)?;
                }
                OpCode::GetLocalLong => {
                    let slot = self.read_u24(frame) as usize;
                    let value = self.stack[self.frames[frame].base + slot].clone();
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8(frame) as usize;
                    let value = self.peek(0).clone();
                    self.stack[self.frames[frame].base + slot] = value;
                }
                OpCode::SetLocalLong => {
                    let slot = self.read_u24(frame) as usize;
                    let value = self.peek(0).clone();
                    self.stack[self.frames[frame].base + slot] = value;
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.stringify(&value);
                    self.host.print(&text);
                }

                OpCode::Jump => {
                    let dist = self.read_u16(frame) as usize;
                    self.frames[frame].ip += dist;
                }
                OpCode::JumpIfFalse => {
                    let dist = self.read_u16(frame) as usize;
                    if self.peek(0).is_falsey() {
                        self.frames[frame].ip += dist;
                    }
                }
                OpCode::JumpIfTrue => {
                    let dist = self.read_u16(frame) as usize;
                    if !self.peek(0).is_falsey() {
                        self.frames[frame].ip += dist;
                    }
                }
                OpCode::JumpNPop => {
                    let dist = self.read_u16(frame) as usize;
                    let n = self.read_u24(frame) as usize;
                    self.stack.truncate(self.stack.len() - n);
                    self.frames[frame].ip += dist;
                }
                OpCode::Loop => {
                    let dist = self.read_u16(frame) as usize;
                    self.frames[frame].ip -= dist;
                }
                OpCode::LoopIfTrue => {
                    let dist = self.read_u16(frame) as usize;
                    if !self.peek(0).is_falsey() {
                        self.frames[frame].ip -= dist;
                    }
                    self.pop();
                }

                OpCode::Call => {
                    let argc = self.read_u8(frame);
                    self.call_value(argc)?;
                    frame = self.frames.len() - 1;
                }

                OpCode::Index => self.op_index()?,
                OpCode::IndexRange => self.op_index_range()?,
                OpCode::IndexRangeInterval => self.op_index_range_interval()?,

                OpCode::Return => {
                    let result = self.pop();
                    let returning = self.frames.pop().expect("return with no active frame");
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.truncate(returning.base);
                    self.push(result)?;
                    frame = self.frames.len() - 1;
                }
                OpCode::Extract => {
                    let result = self.pop();
                    self.output = result.clone();
                    return Ok(result);
                }
            }
        }
    }
}

/// A host handle onto a runtime-compiled expression: a re-entrant
/// per-sample evaluator for a wavetable synthesis engine. Owns the
/// compiled [`Function`]; the VM's call frame for it lives on the stack
/// between `step` calls and is torn down explicitly by
/// [`RuntimeCall::finish`] — the host, not the VM, owns that teardown.
#[derive(Debug)]
pub struct RuntimeCall {
    function: Rc<Function>,
    base: usize,
}

impl RuntimeCall {
    /// Writes `value` into local slot `slot` of this call's frame
    /// (slot 1 = `frame`, slot 2 = `index`). Does not touch the VM's
    /// instruction pointer.
    pub fn set_local(&self, vm: &mut Vm, slot: u8, value: Value) {
        vm.stack[self.base + slot as usize] = value;
    }

    pub fn set_frame(&self, vm: &mut Vm, frame: f64) {
        self.set_local(vm, 1, Value::Number(frame));
    }

    pub fn set_index(&self, vm: &mut Vm, index: f64) {
        self.set_local(vm, 2, Value::Number(index));
    }

    /// Resets this call's frame to the start of its chunk and runs it to
    /// the `OP_EXTRACT` terminator, returning the extracted value. The
    /// frame is left in place for the next `step`.
    pub fn step(&self, vm: &mut Vm) -> Result<Value> {
        let frame_index = vm
            .frames
            .iter()
            .rposition(|f| Rc::ptr_eq(&f.function, &self.function))
            .expect("runtime call frame must still be on the VM's frame stack");
        vm.frames[frame_index].ip = 0;
        vm.run()
    }

    /// Tears down this call's frame and restores the stack to where it
    /// was before [`Vm::runtime_compile`] pushed it. Must be called
    /// exactly once, after the host is done stepping.
    pub fn finish(self, vm: &mut Vm) {
        if let Some(pos) = vm.frames.iter().rposition(|f| Rc::ptr_eq(&f.function, &self.function)) {
            vm.frames.remove(pos);
        }
        vm.stack.truncate(self.base);
    }

    pub fn chunk(&self) -> &Chunk {
        &self.function.chunk
    }
}

/// Test-only capturing [`Host`], shared by this module's tests and by
/// `lib.rs`/`native.rs`'s end-to-end tests (spec.md §8's scenarios are
/// phrased as "program -> stdout", so tests assert on `print` output
/// rather than a top-level `return`, which spec.md §4.2 makes a compile
/// error).
#[cfg(test)]
pub(crate) mod test_support {
    use super::{Host, Vm};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub struct CapturingHost(pub Rc<RefCell<Vec<String>>>);

    impl Host for CapturingHost {
        fn print(&mut self, text: &str) {
            self.0.borrow_mut().push(text.to_string());
        }
    }

    /// Interprets `source` in a fresh [`Vm`] with a capturing host,
    /// returning the interpret result alongside every printed line.
    pub fn run_and_capture(source: &[u8]) -> (crate::error::Result<crate::value::Value>, Vec<String>) {
        let sink = CapturingHost::default();
        let mut vm = Vm::new().with_host(Box::new(sink.clone()));
        let result = vm.interpret(source);
        let lines = sink.0.borrow().clone();
        (result, lines)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::run_and_capture;
    use super::*;

    #[test]
    fn arithmetic_precedence() {
        let (result, lines) = run_and_capture(b"print 1 + 2 * 3 - 4 / 2;");
        result.unwrap();
        assert_eq!(lines, vec!["5"]);
    }

    #[test]
    fn locals_conditionals_compound_assignment() {
        let src = b"var x = 10; if (x > 5) { x += 2; } else { x -= 2; } print x;";
        let (result, lines) = run_and_capture(src);
        result.unwrap();
        assert_eq!(lines, vec!["12"]);
    }

    #[test]
    fn while_with_break_and_continue() {
        let src = b"
            var i = 0; var s = 0;
            while (i < 10) {
                i += 1;
                if (i == 5) continue;
                if (i == 8) break;
                s += i;
            }
            print s;
        ";
        let (result, lines) = run_and_capture(src);
        result.unwrap();
        assert_eq!(lines, vec!["22"]);
    }

    #[test]
    fn string_interpolation() {
        let src = b"var n = 3; print \"there are ${n + 1} items\";";
        let (result, lines) = run_and_capture(src);
        result.unwrap();
        assert_eq!(lines, vec!["there are 4 items"]);
    }

    #[test]
    fn recursive_function_call() {
        let src = b"fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);";
        let (result, lines) = run_and_capture(src);
        result.unwrap();
        assert_eq!(lines, vec!["120"]);
    }

    #[test]
    fn substring_slicing() {
        let (result, lines) = run_and_capture(b"var s = \"abcdef\"; print s[1:5]; print s[::-1];");
        result.unwrap();
        assert_eq!(lines, vec!["bcde", "fedcba"]);
    }

    #[test]
    fn string_repetition_identity_laws() {
        let (result, lines) =
            run_and_capture(b"print \"ab\" * 0; print \"ab\" * 1; print \"ab\" * 3;");
        result.unwrap();
        assert_eq!(lines, vec!["", "ab", "ababab"]);
    }

    #[test]
    fn undefined_global_is_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret(b"missing;").unwrap_err();
        match err {
            Error::Runtime { message, trace } => {
                assert!(message.contains("Undefined variable"));
                assert_eq!(trace.len(), 1);
                assert_eq!(trace[0].name, "script");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arity_mismatch_is_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret(b"fun f(a, b) { return a; } f(1);").unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    fn adding_nil_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret(b"nil + 1;").unwrap_err();
        match err {
            Error::Runtime { message, .. } => assert!(message.contains("nil")),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn adding_mismatched_string_and_number_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret(b"\"a\" + 1;").unwrap_err();
        match err {
            Error::Runtime { message, .. } => assert!(message.contains("concat")),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn stack_overflow_is_reported_with_a_small_stack() {
        let mut vm = Vm::with_options(VmOptions {
            stack_capacity: 8,
            frame_capacity: FRAMES_MAX,
        });
        let err = vm.interpret(b"var a=1;var b=1;var c=1;var d=1;var e=1;var f=1;").unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    fn runtime_compile_steps_a_persistent_frame() {
        let mut vm = Vm::new();
        let call = vm.runtime_compile(b"frame + index").unwrap();
        call.set_frame(&mut vm, 2.0);
        call.set_index(&mut vm, 3.0);
        assert_eq!(call.step(&mut vm).unwrap(), Value::Number(5.0));
        call.set_frame(&mut vm, 10.0);
        call.set_index(&mut vm, 1.0);
        assert_eq!(call.step(&mut vm).unwrap(), Value::Number(11.0));
        call.finish(&mut vm);
    }

    #[test]
    fn call_parity_restores_frame_count_after_a_successful_call() {
        let mut vm = Vm::new();
        vm.interpret(b"fun f(x) { return x + 1; } f(41);").unwrap();
        assert_eq!(vm.frames.len(), 0);
    }

    #[test]
    fn native_functions_can_fail_the_call() {
        let mut vm = Vm::new();
        vm.define_native(
            "boom",
            0,
            Rc::new(|_args: &[Value]| NativeResult::Fail("boom always fails".to_string())),
        );
        let err = vm.interpret(b"boom();").unwrap_err();
        match err {
            Error::Runtime { message, .. } => assert_eq!(message, "boom always fails"),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    /// The `*_GLOBAL_STACK*` family has no compiler-emitted surface syntax
    /// (DESIGN.md Open Question 4), so it's only reachable by a host
    /// hand-assembling a chunk. Exercised here directly rather than through
    /// `Vm::interpret`.
    fn hand_assembled(mut build: impl FnMut(&mut Chunk)) -> Function {
        let mut chunk = Chunk::new();
        build(&mut chunk);
        Function {
            arity: 0,
            chunk,
            name: None,
        }
    }

    #[test]
    fn define_and_get_global_stack_round_trip_by_computed_name() {
        let mut vm = Vm::new();
        let key = vm.interner.intern("x");

        let function = hand_assembled(|chunk| {
            let key_const = chunk.add_constant(Value::string(key.clone())) as u8;
            // push name, push value, DEFINE_GLOBAL_STACK
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(key_const, 1);
            chunk.write_op(OpCode::Constant, 1);
            let value_const = chunk.add_constant(Value::Number(42.0)) as u8;
            chunk.write_byte(value_const, 1);
            chunk.write_op(OpCode::DefineGlobalStack, 1);
            // push name, GET_GLOBAL_STACK, RETURN
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(key_const, 1);
            chunk.write_op(OpCode::GetGlobalStack, 1);
            chunk.write_op(OpCode::Return, 1);
        });

        let function = Rc::new(function);
        vm.push(Value::function(function.clone())).unwrap();
        vm.call_function(function, 0).unwrap();
        let result = vm.run().unwrap();
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn get_global_stack_on_missing_key_is_nil_not_an_error() {
        let mut vm = Vm::new();
        let key = vm.interner.intern("missing");

        let function = hand_assembled(|chunk| {
            let key_const = chunk.add_constant(Value::string(key.clone())) as u8;
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(key_const, 1);
            chunk.write_op(OpCode::GetGlobalStack, 1);
            chunk.write_op(OpCode::Return, 1);
        });

        let function = Rc::new(function);
        vm.push(Value::function(function.clone())).unwrap();
        vm.call_function(function, 0).unwrap();
        let result = vm.run().unwrap();
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn get_global_stack_popless_leaves_key_for_a_follow_up_set() {
        let mut vm = Vm::new();
        let key = vm.interner.intern("y");
        vm.globals.define(key.clone(), Value::Number(1.0));

        let function = hand_assembled(|chunk| {
            let key_const = chunk.add_constant(Value::string(key.clone())) as u8;
            // push name, GET_GLOBAL_STACK_POPLESS leaves name under the value
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(key_const, 1);
            chunk.write_op(OpCode::GetGlobalStackPopless, 1);
            // stack: [name, 1.0] -> pop the fetched value, push a new one,
            // SET_GLOBAL_STACK consumes [name, new_value]
            chunk.write_op(OpCode::Pop, 1);
            let new_value = chunk.add_constant(Value::Number(7.0)) as u8;
            chunk.write_op(OpCode::Constant, 1);
            chunk.write_byte(new_value, 1);
            chunk.write_op(OpCode::SetGlobalStack, 1);
            chunk.write_op(OpCode::Nil, 1);
            chunk.write_op(OpCode::Return, 1);
        });

        let function = Rc::new(function);
        vm.push(Value::function(function.clone())).unwrap();
        vm.call_function(function, 0).unwrap();
        vm.run().unwrap();
        assert_eq!(vm.globals.get(&key), Some(&Value::Number(7.0)));
    }
}
