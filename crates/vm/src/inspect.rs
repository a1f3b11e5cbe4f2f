//! Bytecode disassembler.
//!
//! Pure instrumentation: renders chunks and single instructions for debug
//! traces and tests. Nothing here affects execution.

use std::fmt::Write as _;

use crate::chunk::{Chunk, OpCode};
use crate::gc::Heap;
use crate::value::Value;

/// Render a whole chunk, one instruction per line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the next instruction offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.line(offset));
    }

    let byte = chunk.code[offset];
    let op = match OpCode::from_byte(byte) {
        Some(op) => op,
        None => {
            let _ = write!(text, "<bad opcode {}>", byte);
            return (text, offset + 1);
        }
    };

    let next = match op {
        // No operand.
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::DefineTuple
        | OpCode::Equal
        | OpCode::NotEqual
        | OpCode::Greater
        | OpCode::GreaterEqual
        | OpCode::Less
        | OpCode::LessEqual
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Modulo
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return => {
            let _ = write!(text, "{:?}", op);
            offset + 1
        }

        // One-byte slot or arg-count operand.
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::TailCall => {
            let operand = operand_byte(chunk, offset + 1);
            let _ = write!(text, "{:<16?} {}", op, operand);
            offset + 2
        }

        // One-byte constant-pool operand.
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => {
            let index = operand_byte(chunk, offset + 1);
            let _ = write!(text, "{:<16?} {} '{}'", op, index, constant_text(heap, chunk, index));
            offset + 2
        }

        // Two-byte big-endian jump offset.
        OpCode::Jump | OpCode::JumpIfTrue | OpCode::JumpIfFalse | OpCode::Loop => {
            let operand = ((operand_byte(chunk, offset + 1) as usize) << 8)
                | operand_byte(chunk, offset + 2) as usize;
            let target = if op == OpCode::Loop {
                (offset + 3).saturating_sub(operand)
            } else {
                offset + 3 + operand
            };
            let _ = write!(text, "{:<16?} {} -> {}", op, operand, target);
            offset + 3
        }

        // Function constant, then two bytes per captured upvalue.
        OpCode::Closure => {
            let index = operand_byte(chunk, offset + 1);
            let _ = write!(text, "{:<16?} {} '{}'", op, index, constant_text(heap, chunk, index));

            let upvalue_count = match chunk.constants.get(index as usize) {
                Some(Value::Function(ptr)) => heap
                    .get_function(*ptr)
                    .map(|f| f.upvalue_count)
                    .unwrap_or(0),
                _ => 0,
            };
            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = operand_byte(chunk, next) != 0;
                let slot = operand_byte(chunk, next + 1);
                let _ = write!(
                    text,
                    "\n{:04}    |   {} {}",
                    next,
                    if is_local { "local" } else { "upvalue" },
                    slot
                );
                next += 2;
            }
            next
        }
    };

    (text, next)
}

fn operand_byte(chunk: &Chunk, offset: usize) -> u8 {
    chunk.code.get(offset).copied().unwrap_or(0)
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: u8) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => heap.display_value(value),
        None => "<out of range>".to_string(),
    }
}
