//! Opcode and type-qualifier tables for the NCS instruction set.
//!
//! Both tables are the single source of truth for byte values and mnemonics:
//! the codec, the listing printer and the code generator all go through them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    CpDownSp,
    RsAdd,
    CpTopSp,
    Const,
    Action,
    LogAnd,
    LogOr,
    IncOr,
    ExcOr,
    BoolAnd,
    Equal,
    NEqual,
    Geq,
    Gt,
    Lt,
    Leq,
    ShLeft,
    ShRight,
    UShRight,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Comp,
    MovSp,
    Jmp,
    Jsr,
    Jz,
    Retn,
    Destruct,
    Not,
    DecISp,
    IncISp,
    Jnz,
    CpDownBp,
    CpTopBp,
    DecIBp,
    IncIBp,
    SaveBp,
    RestoreBp,
    StoreState,
    Nop,
}

const OPCODES: &[(Opcode, u8, &str)] = &[
    (Opcode::CpDownSp, 0x01, "CPDOWNSP"),
    (Opcode::RsAdd, 0x02, "RSADD"),
    (Opcode::CpTopSp, 0x03, "CPTOPSP"),
    (Opcode::Const, 0x04, "CONST"),
    (Opcode::Action, 0x05, "ACTION"),
    (Opcode::LogAnd, 0x06, "LOGAND"),
    (Opcode::LogOr, 0x07, "LOGOR"),
    (Opcode::IncOr, 0x08, "INCOR"),
    (Opcode::ExcOr, 0x09, "EXCOR"),
    (Opcode::BoolAnd, 0x0A, "BOOLAND"),
    (Opcode::Equal, 0x0B, "EQUAL"),
    (Opcode::NEqual, 0x0C, "NEQUAL"),
    (Opcode::Geq, 0x0D, "GEQ"),
    (Opcode::Gt, 0x0E, "GT"),
    (Opcode::Lt, 0x0F, "LT"),
    (Opcode::Leq, 0x10, "LEQ"),
    (Opcode::ShLeft, 0x11, "SHLEFT"),
    (Opcode::ShRight, 0x12, "SHRIGHT"),
    (Opcode::UShRight, 0x13, "USHRIGHT"),
    (Opcode::Add, 0x14, "ADD"),
    (Opcode::Sub, 0x15, "SUB"),
    (Opcode::Mul, 0x16, "MUL"),
    (Opcode::Div, 0x17, "DIV"),
    (Opcode::Mod, 0x18, "MOD"),
    (Opcode::Neg, 0x19, "NEG"),
    (Opcode::Comp, 0x1A, "COMP"),
    (Opcode::MovSp, 0x1B, "MOVSP"),
    (Opcode::Jmp, 0x1D, "JMP"),
    (Opcode::Jsr, 0x1E, "JSR"),
    (Opcode::Jz, 0x1F, "JZ"),
    (Opcode::Retn, 0x20, "RETN"),
    (Opcode::Destruct, 0x21, "DESTRUCT"),
    (Opcode::Not, 0x22, "NOT"),
    (Opcode::DecISp, 0x23, "DECISP"),
    (Opcode::IncISp, 0x24, "INCISP"),
    (Opcode::Jnz, 0x25, "JNZ"),
    (Opcode::CpDownBp, 0x26, "CPDOWNBP"),
    (Opcode::CpTopBp, 0x27, "CPTOPBP"),
    (Opcode::DecIBp, 0x28, "DECIBP"),
    (Opcode::IncIBp, 0x29, "INCIBP"),
    (Opcode::SaveBp, 0x2A, "SAVEBP"),
    (Opcode::RestoreBp, 0x2B, "RESTOREBP"),
    (Opcode::StoreState, 0x2C, "STORE_STATE"),
    (Opcode::Nop, 0x2D, "NOP"),
];

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODES.iter().find(|(_, b, _)| *b == byte).map(|(op, _, _)| *op)
    }

    pub fn byte(self) -> u8 {
        OPCODES
            .iter()
            .find(|(op, _, _)| *op == self)
            .map_or(0, |(_, b, _)| *b)
    }

    pub fn mnemonic(self) -> &'static str {
        OPCODES
            .iter()
            .find(|(op, _, _)| *op == self)
            .map_or("?", |(_, _, name)| name)
    }

    /// Control transfers whose operand is an instruction reference.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jsr | Opcode::Jz | Opcode::Jnz)
    }

    /// Instructions after which control never falls through.
    pub fn ends_flow(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Retn)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Operand type tag carried in the second byte of every instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    None,
    Stack,
    Int,
    Float,
    String,
    Object,
    Effect,
    Event,
    Location,
    Talent,
    IntInt,
    FloatFloat,
    ObjectObject,
    StringString,
    StructStruct,
    IntFloat,
    FloatInt,
    EffectEffect,
    EventEvent,
    LocationLocation,
    TalentTalent,
    VectorVector,
    VectorFloat,
    FloatVector,
}

const QUALIFIERS: &[(Qualifier, u8, &str)] = &[
    (Qualifier::None, 0x00, ""),
    (Qualifier::Stack, 0x01, ""),
    (Qualifier::Int, 0x03, "I"),
    (Qualifier::Float, 0x04, "F"),
    (Qualifier::String, 0x05, "S"),
    (Qualifier::Object, 0x06, "O"),
    (Qualifier::Effect, 0x10, "EFF"),
    (Qualifier::Event, 0x11, "EVT"),
    (Qualifier::Location, 0x12, "LOC"),
    (Qualifier::Talent, 0x13, "TAL"),
    (Qualifier::IntInt, 0x20, "II"),
    (Qualifier::FloatFloat, 0x21, "FF"),
    (Qualifier::ObjectObject, 0x22, "OO"),
    (Qualifier::StringString, 0x23, "SS"),
    (Qualifier::StructStruct, 0x24, "TT"),
    (Qualifier::IntFloat, 0x25, "IF"),
    (Qualifier::FloatInt, 0x26, "FI"),
    (Qualifier::EffectEffect, 0x30, "EFFEFF"),
    (Qualifier::EventEvent, 0x31, "EVTEVT"),
    (Qualifier::LocationLocation, 0x32, "LOCLOC"),
    (Qualifier::TalentTalent, 0x33, "TALTAL"),
    (Qualifier::VectorVector, 0x3A, "VV"),
    (Qualifier::VectorFloat, 0x3B, "VF"),
    (Qualifier::FloatVector, 0x3C, "FV"),
];

impl Qualifier {
    /// `STORE_STATE` always carries the 0x10 tag.
    pub const STATE: Qualifier = Qualifier::Effect;

    pub fn from_byte(byte: u8) -> Option<Self> {
        QUALIFIERS.iter().find(|(_, b, _)| *b == byte).map(|(q, _, _)| *q)
    }

    pub fn byte(self) -> u8 {
        QUALIFIERS
            .iter()
            .find(|(q, _, _)| *q == self)
            .map_or(0, |(_, b, _)| *b)
    }

    pub fn suffix(self) -> &'static str {
        QUALIFIERS
            .iter()
            .find(|(q, _, _)| *q == self)
            .map_or("", |(_, _, s)| s)
    }

    /// Single-operand tags that name one stack cell type.
    pub fn is_unary_type(self) -> bool {
        matches!(
            self,
            Qualifier::Int
                | Qualifier::Float
                | Qualifier::String
                | Qualifier::Object
                | Qualifier::Effect
                | Qualifier::Event
                | Qualifier::Location
                | Qualifier::Talent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for (op, byte, _) in OPCODES {
            assert_eq!(Opcode::from_byte(*byte), Some(*op));
            assert_eq!(op.byte(), *byte);
        }
    }

    #[test]
    fn gap_opcode_is_unknown() {
        assert_eq!(Opcode::from_byte(0x1C), None);
        assert_eq!(Opcode::from_byte(0x00), None);
        assert_eq!(Opcode::from_byte(0x2E), None);
    }

    #[test]
    fn qualifier_suffixes() {
        assert_eq!(Qualifier::IntInt.suffix(), "II");
        assert_eq!(Qualifier::from_byte(0x24), Some(Qualifier::StructStruct));
        assert_eq!(Qualifier::STATE.byte(), 0x10);
        assert_eq!(Qualifier::from_byte(0x02), None);
    }
}
