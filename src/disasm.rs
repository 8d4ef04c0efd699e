//! disasm.rs — a human-readable bytecode disassembler, gated behind the
//! `disasm` feature (on by default).
//!
//! Grounded on `original_source/src/debug.c` line for line:
//! `disassembleChunk`/`disassembleInstruction` print `OFFSET LINE OP ...`
//! with `"   | "` standing in for a repeated line number;
//! `byteInstruction`/`longInstruction` print a short/long constant-pool
//! or local-slot index; `jumpInstruction`/`jumpNpopInstruction` print the
//! computed jump target; `constantInstruction`/`longConstantInstruction`
//! also print the constant's value; `simpleInstruction` prints just the
//! mnemonic. The stack-keyed globals opcodes (`*_GLOBAL_STACK*`) read no
//! inline operand in `vm.c::run`, so they disassemble as simple
//! instructions here too, same as in the original.

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::opcode::OpCode;

/// Disassembles every instruction in `chunk`, returning one line per
/// instruction prefixed by `"== {name} =="`. Grounded on
/// `debug.c::disassembleChunk`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Disassembles the single instruction starting at `offset`, returning
/// its printable line and the offset of the next instruction. Grounded
/// on `debug.c::disassembleInstruction`.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");

    let same_line = offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1);
    if same_line {
        out.push_str("   | ");
    } else {
        let line = chunk.get_line(offset).unwrap_or(0);
        let _ = write!(out, "{line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        let _ = write!(out, "Unknown opcode {byte}");
        return (out, offset + 1);
    };

    let next = match op {
        OpCode::Constant => constant_instruction(&mut out, chunk, offset, false),
        OpCode::ConstantLong => constant_instruction(&mut out, chunk, offset, true),

        OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
            constant_instruction(&mut out, chunk, offset, false)
        }
        OpCode::DefineGlobalLong | OpCode::GetGlobalLong | OpCode::SetGlobalLong => {
            constant_instruction(&mut out, chunk, offset, true)
        }

        OpCode::GetLocal | OpCode::SetLocal => byte_instruction(&mut out, chunk, offset),
        OpCode::GetLocalLong | OpCode::SetLocalLong => long_instruction(&mut out, chunk, offset),

        OpCode::PopN => long_instruction(&mut out, chunk, offset),

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            jump_instruction(&mut out, chunk, offset, 1)
        }
        OpCode::Loop | OpCode::LoopIfTrue => jump_instruction(&mut out, chunk, offset, -1),
        OpCode::JumpNPop => jump_npop_instruction(&mut out, chunk, offset),

        OpCode::Call => byte_instruction(&mut out, chunk, offset),

        OpCode::DefineGlobalStack
        | OpCode::SetGlobalStack
        | OpCode::GetGlobalStack
        | OpCode::GetGlobalStackPopless
        | OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Mod
        | OpCode::Negate
        | OpCode::Not
        | OpCode::Equal
        | OpCode::NotEqual
        | OpCode::Greater
        | OpCode::GreaterEqual
        | OpCode::Less
        | OpCode::LessEqual
        | OpCode::Index
        | OpCode::IndexRange
        | OpCode::IndexRangeInterval
        | OpCode::InterpolateStr
        | OpCode::Print
        | OpCode::Return
        | OpCode::Extract => simple_instruction(&mut out, op, offset),
    };

    (out, next)
}

fn simple_instruction(out: &mut String, op: OpCode, offset: usize) -> usize {
    out.push_str(op.mnemonic());
    offset + 1
}

fn byte_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
    let operand = chunk.code[offset + 1];
    let _ = write!(out, "{:<16} {operand:4}", op.mnemonic());
    offset + 2
}

fn long_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
    let operand = chunk.read_u24(offset + 1);
    let _ = write!(out, "{:<16} {operand:4}", op.mnemonic());
    offset + 4
}

fn constant_instruction(out: &mut String, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
    let (index, next) = if long {
        (chunk.read_u24(offset + 1) as usize, offset + 4)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    };
    let value = &chunk.constants[index];
    let _ = write!(out, "{:<16} {index:4} '{value}'", op.mnemonic());
    next
}

/// `target = offset + operand*sign + 3`, matching `debug.c::jumpInstruction`
/// (1-byte opcode + 2-byte distance operand = 3 total).
fn jump_instruction(out: &mut String, chunk: &Chunk, offset: usize, sign: i64) -> usize {
    let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
    let dist = chunk.read_u16(offset + 1) as i64;
    let target = offset as i64 + 3 + sign * dist;
    let _ = write!(out, "{:<16} {offset:4} -> {target}", op.mnemonic());
    offset + 3
}

/// `target = offset + 6` (2-byte distance + 3-byte pop count, always
/// forward), plus the pop count itself; matches
/// `debug.c::jumpNpopInstruction`.
fn jump_npop_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
    let dist = chunk.read_u16(offset + 1) as i64;
    let pop_count = chunk.read_u24(offset + 3);
    let target = offset as i64 + 6 + dist;
    let _ = write!(out, "{:<16} {offset:4} -> {target} (pop {pop_count})", op.mnemonic());
    offset + 6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Interner;

    #[test]
    fn disassembles_a_simple_chunk() {
        let mut interner = Interner::new();
        let function = compiler_compile(b"var x = 1 + 2; print x;", &mut interner);
        let text = disassemble_chunk(&function.chunk, "test");
        assert!(text.starts_with("== test =="));
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("ADD"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn jump_targets_are_printed_for_if_statements() {
        let mut interner = Interner::new();
        let function = compiler_compile(b"if (true) { print 1; } print 2;", &mut interner);
        let text = disassemble_chunk(&function.chunk, "branch");
        assert!(text.contains("JUMP_IF_FALSE"));
        assert!(text.contains("->"));
    }

    fn compiler_compile(src: &[u8], interner: &mut Interner) -> crate::value::Function {
        crate::compiler::compile(src, interner).expect("valid source compiles")
    }
}
