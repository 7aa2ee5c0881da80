//! On-disk NCS layout.
//!
//! ```text
//! "NCS V1.0"  0x42  u32 total_size          (13-byte header, big-endian)
//! opcode u8, qualifier u8, operand ...     (repeated)
//! ```
//!
//! Jump operands are signed byte distances from the start of the jumping
//! instruction. Encoding is two-pass: a size table fixes every byte offset
//! before any jump distance is written.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::instruction::{Instruction, Operand, Program};
use super::opcode::{Opcode, Qualifier};

pub const MAGIC: &[u8; 8] = b"NCS V1.0";
pub const PROGRAM_TAG: u8 = 0x42;
pub const HEADER_SIZE: usize = 13;

/// Malformed input binary; `offset` is the byte position of the problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupt binary at byte {offset}: {kind}")]
pub struct CorruptBinaryError {
    pub offset: usize,
    pub kind: CorruptKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptKind {
    #[error("missing \"NCS V1.0\" signature")]
    BadMagic,
    #[error("expected program tag 0x42, found 0x{0:02X}")]
    BadProgramTag(u8),
    #[error("header declares {declared} bytes but the file holds {actual}")]
    SizeMismatch { declared: u32, actual: usize },
    #[error("truncated instruction")]
    Truncated,
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("unknown type qualifier 0x{0:02X}")]
    UnknownQualifier(u8),
    #[error("qualifier {qualifier} is not valid for {opcode}")]
    OperandMismatch { opcode: &'static str, qualifier: String },
    #[error("string constant is not valid UTF-8")]
    BadString,
    #[error("jump to byte {0} is outside the instruction stream")]
    JumpOutOfBounds(i64),
    #[error("jump to byte {0} does not land on an instruction boundary")]
    JumpMisaligned(i64),
}

/// Instruction list that cannot be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("instruction {index} jumps to missing instruction {target}")]
    DanglingJump { index: usize, target: usize },
    #[error("string constant at instruction {index} is {len} bytes, limit is 65535")]
    StringTooLong { index: usize, len: usize },
    #[error("program of {0} bytes exceeds the 32-bit size field")]
    TooLarge(usize),
}

pub fn encode(program: &Program) -> Result<Vec<u8>, EncodeError> {
    let offsets = program.byte_offsets(HEADER_SIZE);
    let total = offsets.last().copied().unwrap_or(HEADER_SIZE);
    let total_u32 = u32::try_from(total).map_err(|_| EncodeError::TooLarge(total))?;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(MAGIC);
    out.push(PROGRAM_TAG);
    write_u32(&mut out, total_u32);

    for (index, ins) in program.iter().enumerate() {
        out.push(ins.opcode.byte());
        out.push(ins.qualifier.byte());
        match &ins.operand {
            Operand::None => {}
            Operand::Stack { offset, size } => {
                write_i32(&mut out, *offset);
                write_u16(&mut out, *size);
            }
            Operand::Int(v) | Operand::Object(v) | Operand::Offset(v) => write_i32(&mut out, *v),
            Operand::Float(v) => {
                let _ = out.write_f32::<BigEndian>(*v);
            }
            Operand::String(s) => {
                let len = u16::try_from(s.len())
                    .map_err(|_| EncodeError::StringTooLong { index, len: s.len() })?;
                write_u16(&mut out, len);
                out.extend_from_slice(s.as_bytes());
            }
            Operand::Action { routine, argc } => {
                write_u16(&mut out, *routine);
                out.push(*argc);
            }
            Operand::Size(size) => write_u16(&mut out, *size),
            Operand::Jump(target) => {
                let here = offsets.get(index).copied().unwrap_or(0);
                let there = offsets
                    .get(*target)
                    .copied()
                    .filter(|_| *target < program.len())
                    .ok_or(EncodeError::DanglingJump { index, target: *target })?;
                // Offsets are bounded by `total`, which fits in u32.
                #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
                let rel = there as i64 - here as i64;
                #[allow(clippy::cast_possible_truncation)]
                write_i32(&mut out, rel as i32);
            }
            Operand::Destruct { size, offset, keep } => {
                write_i16(&mut out, *size);
                write_i16(&mut out, *offset);
                write_i16(&mut out, *keep);
            }
            Operand::StoreState { bp, sp } => {
                write_i32(&mut out, *bp);
                write_i32(&mut out, *sp);
            }
        }
    }
    Ok(out)
}

// Writes into a Vec<u8> cannot fail.
fn write_u16(out: &mut Vec<u8>, v: u16) {
    let _ = out.write_u16::<BigEndian>(v);
}

fn write_i16(out: &mut Vec<u8>, v: i16) {
    let _ = out.write_i16::<BigEndian>(v);
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    let _ = out.write_u32::<BigEndian>(v);
}

fn write_i32(out: &mut Vec<u8>, v: i32) {
    let _ = out.write_i32::<BigEndian>(v);
}

/// Raw jump distance, resolved once every instruction offset is known.
struct PendingJump {
    index: usize,
    at: usize,
    rel: i32,
}

pub fn decode(bytes: &[u8]) -> Result<Program, CorruptBinaryError> {
    let corrupt = |offset: usize, kind: CorruptKind| CorruptBinaryError { offset, kind };

    if bytes.len() < HEADER_SIZE || !bytes.starts_with(MAGIC) {
        return Err(corrupt(0, CorruptKind::BadMagic));
    }
    let mut cur = Cursor::new(bytes);
    cur.set_position(MAGIC.len() as u64);
    let tag = cur.read_u8().map_err(|_| corrupt(8, CorruptKind::Truncated))?;
    if tag != PROGRAM_TAG {
        return Err(corrupt(8, CorruptKind::BadProgramTag(tag)));
    }
    let declared = cur
        .read_u32::<BigEndian>()
        .map_err(|_| corrupt(9, CorruptKind::Truncated))?;
    if declared as usize != bytes.len() {
        return Err(corrupt(
            9,
            CorruptKind::SizeMismatch {
                declared,
                actual: bytes.len(),
            },
        ));
    }

    let mut instructions = Vec::new();
    let mut starts = Vec::new();
    let mut jumps = Vec::new();

    while (cur.position() as usize) < bytes.len() {
        let at = cur.position() as usize;
        let truncated = |_| corrupt(at, CorruptKind::Truncated);
        let op_byte = cur.read_u8().map_err(truncated)?;
        let opcode =
            Opcode::from_byte(op_byte).ok_or(corrupt(at, CorruptKind::UnknownOpcode(op_byte)))?;
        let q_byte = cur.read_u8().map_err(truncated)?;
        let qualifier = Qualifier::from_byte(q_byte)
            .ok_or(corrupt(at + 1, CorruptKind::UnknownQualifier(q_byte)))?;
        let mismatch = || {
            corrupt(
                at,
                CorruptKind::OperandMismatch {
                    opcode: opcode.mnemonic(),
                    qualifier: format!("0x{q_byte:02X}"),
                },
            )
        };

        let operand = match opcode {
            Opcode::CpDownSp | Opcode::CpTopSp | Opcode::CpDownBp | Opcode::CpTopBp => {
                let offset = cur.read_i32::<BigEndian>().map_err(truncated)?;
                let size = cur.read_u16::<BigEndian>().map_err(truncated)?;
                Operand::Stack { offset, size }
            }
            Opcode::RsAdd => {
                if !qualifier.is_unary_type() {
                    return Err(mismatch());
                }
                Operand::None
            }
            Opcode::Const => match qualifier {
                Qualifier::Int => Operand::Int(cur.read_i32::<BigEndian>().map_err(truncated)?),
                Qualifier::Float => Operand::Float(cur.read_f32::<BigEndian>().map_err(truncated)?),
                Qualifier::Object => Operand::Object(cur.read_i32::<BigEndian>().map_err(truncated)?),
                Qualifier::String => {
                    let len = cur.read_u16::<BigEndian>().map_err(truncated)? as usize;
                    let mut buf = vec![0u8; len];
                    cur.read_exact(&mut buf).map_err(truncated)?;
                    Operand::String(
                        String::from_utf8(buf).map_err(|_| corrupt(at, CorruptKind::BadString))?,
                    )
                }
                _ => return Err(mismatch()),
            },
            Opcode::Action => {
                let routine = cur.read_u16::<BigEndian>().map_err(truncated)?;
                let argc = cur.read_u8().map_err(truncated)?;
                Operand::Action { routine, argc }
            }
            Opcode::Equal | Opcode::NEqual if qualifier == Qualifier::StructStruct => {
                Operand::Size(cur.read_u16::<BigEndian>().map_err(truncated)?)
            }
            Opcode::MovSp | Opcode::DecISp | Opcode::IncISp | Opcode::DecIBp | Opcode::IncIBp => {
                Operand::Offset(cur.read_i32::<BigEndian>().map_err(truncated)?)
            }
            Opcode::Jmp | Opcode::Jsr | Opcode::Jz | Opcode::Jnz => {
                let rel = cur.read_i32::<BigEndian>().map_err(truncated)?;
                jumps.push(PendingJump {
                    index: instructions.len(),
                    at,
                    rel,
                });
                Operand::Jump(0)
            }
            Opcode::Destruct => {
                let size = cur.read_i16::<BigEndian>().map_err(truncated)?;
                let offset = cur.read_i16::<BigEndian>().map_err(truncated)?;
                let keep = cur.read_i16::<BigEndian>().map_err(truncated)?;
                Operand::Destruct { size, offset, keep }
            }
            Opcode::StoreState => {
                let bp = cur.read_i32::<BigEndian>().map_err(truncated)?;
                let sp = cur.read_i32::<BigEndian>().map_err(truncated)?;
                Operand::StoreState { bp, sp }
            }
            _ => Operand::None,
        };
        starts.push(at);
        instructions.push(Instruction::new(opcode, qualifier, operand));
    }

    for jump in jumps {
        #[allow(clippy::cast_possible_wrap)]
        let target = jump.at as i64 + i64::from(jump.rel);
        if target < HEADER_SIZE as i64 || target >= bytes.len() as i64 {
            return Err(corrupt(jump.at, CorruptKind::JumpOutOfBounds(target)));
        }
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let index = starts
            .binary_search(&(target as usize))
            .map_err(|_| corrupt(jump.at, CorruptKind::JumpMisaligned(target)))?;
        if let Some(ins) = instructions.get_mut(jump.index) {
            ins.set_jump_target(index);
        }
    }

    Ok(Program::new(instructions))
}
