use std::fmt::Write;

use super::codec::HEADER_SIZE;
use super::instruction::{Instruction, Operand, Program};

/// Render a program one instruction per line:
/// `index  offset  MNEMONIC+suffix  operand [-> target]`.
///
/// Offsets are the byte positions the codec would assign, so the listing of a
/// decoded file lines up with a hex dump of it.
pub fn listing(program: &Program) -> String {
    let offsets = program.byte_offsets(HEADER_SIZE);
    let mut out = String::new();
    for (index, ins) in program.iter().enumerate() {
        let offset = offsets.get(index).copied().unwrap_or(0);
        let _ = write!(out, "{index:5}  {offset:08X}  {:<12}", mnemonic(ins));
        let operand = operand_text(ins);
        if !operand.is_empty() {
            let _ = write!(out, " {operand}");
        }
        if let Some(target) = ins.jump_target() {
            let target_offset = offsets.get(target).copied().unwrap_or(0);
            let _ = write!(out, " -> {target} ({target_offset:08X})");
        }
        out.push('\n');
    }
    out
}

pub fn mnemonic(ins: &Instruction) -> String {
    format!("{}{}", ins.opcode.mnemonic(), ins.qualifier.suffix())
}

fn operand_text(ins: &Instruction) -> String {
    match &ins.operand {
        Operand::None | Operand::Jump(_) => String::new(),
        Operand::Stack { offset, size } => format!("{offset}, {size}"),
        Operand::Int(v) | Operand::Object(v) | Operand::Offset(v) => v.to_string(),
        Operand::Float(v) => format!("{v:?}"),
        Operand::String(s) => format!("{s:?}"),
        Operand::Action { routine, argc } => format!("{routine}, {argc}"),
        Operand::Size(size) => size.to_string(),
        Operand::Destruct { size, offset, keep } => format!("{size}, {offset}, {keep}"),
        Operand::StoreState { bp, sp } => format!("{bp}, {sp}"),
    }
}
