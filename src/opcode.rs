//! opcode.rs — the Cave bytecode instruction set.
//!
//! Grounded on `vitte-core/src/bytecode/ops.rs`'s `Op` enum (mnemonic(),
//! ordering discipline, doc-comment style) but encoded as raw `u8` values
//! rather than a `Vec<Op>` of Rust enum cells: spec.md requires a true
//! byte-addressed chunk (long/short operand widths, in-place jump
//! patching, `get_line(offset)` over a byte offset) which an
//! enum-per-instruction `Vec` cannot represent.
//!
//! **Compat discipline** (kept from the teacher): never reorder existing
//! variants, only append. The long/short invariant below is load-bearing:
//! for every constant-bearing opcode, `long as u8 == short as u8 + 1`.

#![allow(clippy::upper_case_acronyms)]

/// One Cave VM instruction. `#[repr(u8)]` so `as u8` / `OpCode::try_from`
/// round-trip through the chunk's raw byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ----- Constants (8-bit short / 24-bit long pairs) -----
    Constant = 0,
    ConstantLong = 1,

    // ----- Globals -----
    DefineGlobal = 2,
    DefineGlobalLong = 3,
    GetGlobal = 4,
    GetGlobalLong = 5,
    SetGlobal = 6,
    SetGlobalLong = 7,

    // ----- Locals -----
    GetLocal = 8,
    GetLocalLong = 9,
    SetLocal = 10,
    SetLocalLong = 11,

    // ----- Stack-keyed globals (host-only; see DESIGN.md) -----
    DefineGlobalStack = 12,
    SetGlobalStack = 13,
    GetGlobalStack = 14,
    GetGlobalStackPopless = 15,

    // ----- Literals -----
    Nil = 16,
    True = 17,
    False = 18,

    // ----- Stack maintenance -----
    Pop = 19,
    PopN = 20,

    // ----- Arithmetic -----
    Add = 21,
    Subtract = 22,
    Multiply = 23,
    Divide = 24,
    Mod = 25,
    Negate = 26,

    // ----- Logic / comparison -----
    Not = 27,
    Equal = 28,
    NotEqual = 29,
    Greater = 30,
    GreaterEqual = 31,
    Less = 32,
    LessEqual = 33,

    // ----- Control flow -----
    Jump = 34,
    JumpIfFalse = 35,
    JumpIfTrue = 36,
    JumpNPop = 37,
    Loop = 38,
    LoopIfTrue = 39,

    // ----- Calls & indexing -----
    Call = 40,
    Index = 41,
    IndexRange = 42,
    IndexRangeInterval = 43,

    // ----- Strings -----
    InterpolateStr = 44,

    // ----- I/O -----
    Print = 45,

    // ----- Function exit -----
    Return = 46,
    Extract = 47,
}

impl OpCode {
    /// Short mnemonic, used by the disassembler and error messages.
    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Constant => "CONSTANT",
            ConstantLong => "CONSTANT_LONG",
            DefineGlobal => "DEFINE_GLOBAL",
            DefineGlobalLong => "DEFINE_GLOBAL_LONG",
            GetGlobal => "GET_GLOBAL",
            GetGlobalLong => "GET_GLOBAL_LONG",
            SetGlobal => "SET_GLOBAL",
            SetGlobalLong => "SET_GLOBAL_LONG",
            GetLocal => "GET_LOCAL",
            GetLocalLong => "GET_LOCAL_LONG",
            SetLocal => "SET_LOCAL",
            SetLocalLong => "SET_LOCAL_LONG",
            DefineGlobalStack => "DEFINE_GLOBAL_STACK",
            SetGlobalStack => "SET_GLOBAL_STACK",
            GetGlobalStack => "GET_GLOBAL_STACK",
            GetGlobalStackPopless => "GET_GLOBAL_STACK_POPLESS",
            Nil => "NIL",
            True => "TRUE",
            False => "FALSE",
            Pop => "POP",
            PopN => "POPN",
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Mod => "MOD",
            Negate => "NEGATE",
            Not => "NOT",
            Equal => "EQUAL",
            NotEqual => "NOT_EQUAL",
            Greater => "GREATER",
            GreaterEqual => "GREATER_EQUAL",
            Less => "LESS",
            LessEqual => "LESS_EQUAL",
            Jump => "JUMP",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTrue => "JUMP_IF_TRUE",
            JumpNPop => "JUMP_NPOP",
            Loop => "LOOP",
            LoopIfTrue => "LOOP_IF_TRUE",
            Call => "CALL",
            Index => "INDEX",
            IndexRange => "INDEX_RANGE",
            IndexRangeInterval => "INDEX_RANGE_INTERVAL",
            InterpolateStr => "INTERPOLATE_STR",
            Print => "PRINT",
            Return => "RETURN",
            Extract => "EXTRACT",
        }
    }

    /// Decode a raw byte. `None` for values with no assigned opcode.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use OpCode::*;
        const TABLE: [OpCode; 48] = [
            Constant,
            ConstantLong,
            DefineGlobal,
            DefineGlobalLong,
            GetGlobal,
            GetGlobalLong,
            SetGlobal,
            SetGlobalLong,
            GetLocal,
            GetLocalLong,
            SetLocal,
            SetLocalLong,
            DefineGlobalStack,
            SetGlobalStack,
            GetGlobalStack,
            GetGlobalStackPopless,
            Nil,
            True,
            False,
            Pop,
            PopN,
            Add,
            Subtract,
            Multiply,
            Divide,
            Mod,
            Negate,
            Not,
            Equal,
            NotEqual,
            Greater,
            GreaterEqual,
            Less,
            LessEqual,
            Jump,
            JumpIfFalse,
            JumpIfTrue,
            JumpNPop,
            Loop,
            LoopIfTrue,
            Call,
            Index,
            IndexRange,
            IndexRangeInterval,
            InterpolateStr,
            Print,
            Return,
            Extract,
        ];
        TABLE.get(byte as usize).copied()
    }
}

/// Given a short-form constant-bearing opcode, its long-form sibling is
/// always `short as u8 + 1`. Asserted by a unit test below so the
/// invariant can never silently rot if variants are reordered.
pub const fn long_form(short: OpCode) -> OpCode {
    match short {
        OpCode::Constant => OpCode::ConstantLong,
        OpCode::DefineGlobal => OpCode::DefineGlobalLong,
        OpCode::GetGlobal => OpCode::GetGlobalLong,
        OpCode::SetGlobal => OpCode::SetGlobalLong,
        OpCode::GetLocal => OpCode::GetLocalLong,
        OpCode::SetLocal => OpCode::SetLocalLong,
        _ => panic!("opcode has no long form"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_short_invariant_holds() {
        for (short, long) in [
            (OpCode::Constant, OpCode::ConstantLong),
            (OpCode::DefineGlobal, OpCode::DefineGlobalLong),
            (OpCode::GetGlobal, OpCode::GetGlobalLong),
            (OpCode::SetGlobal, OpCode::SetGlobalLong),
            (OpCode::GetLocal, OpCode::GetLocalLong),
            (OpCode::SetLocal, OpCode::SetLocalLong),
        ] {
            assert_eq!(long as u8, short as u8 + 1);
            assert_eq!(long_form(short) as u8, long as u8);
        }
    }

    #[test]
    fn every_discriminant_round_trips() {
        for byte in 0u8..48 {
            let op = OpCode::from_u8(byte).expect("dense table");
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::from_u8(48).is_none());
    }
}
