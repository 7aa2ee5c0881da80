use super::opcode::{Opcode, Qualifier};

/// Immediate data carried by an instruction.
///
/// Jump targets are indices into the owning [`Program`]; byte offsets only
/// exist inside the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// `CPDOWNSP`/`CPTOPSP`/`CPDOWNBP`/`CPTOPBP`: byte offset and byte count.
    Stack { offset: i32, size: u16 },
    Int(i32),
    Float(f32),
    String(String),
    Object(i32),
    Action { routine: u16, argc: u8 },
    /// Byte count compared by `EQUALTT`/`NEQUALTT`.
    Size(u16),
    /// `MOVSP` and the increment/decrement family.
    Offset(i32),
    Jump(usize),
    Destruct { size: i16, offset: i16, keep: i16 },
    StoreState { bp: i32, sp: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub qualifier: Qualifier,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: Opcode, qualifier: Qualifier, operand: Operand) -> Self {
        Self {
            opcode,
            qualifier,
            operand,
        }
    }

    pub fn bare(opcode: Opcode, qualifier: Qualifier) -> Self {
        Self::new(opcode, qualifier, Operand::None)
    }

    pub fn jump(opcode: Opcode, target: usize) -> Self {
        Self::new(opcode, Qualifier::None, Operand::Jump(target))
    }

    pub fn jump_target(&self) -> Option<usize> {
        match self.operand {
            Operand::Jump(target) => Some(target),
            _ => None,
        }
    }

    pub fn set_jump_target(&mut self, target: usize) {
        if let Operand::Jump(ref mut t) = self.operand {
            *t = target;
        }
    }

    /// Encoded size in bytes: opcode, qualifier and operand tail.
    pub fn encoded_size(&self) -> usize {
        2 + match &self.operand {
            Operand::None => 0,
            Operand::Stack { .. } | Operand::Destruct { .. } => 6,
            Operand::Int(_)
            | Operand::Float(_)
            | Operand::Object(_)
            | Operand::Offset(_)
            | Operand::Jump(_) => 4,
            Operand::String(s) => 2 + s.len(),
            Operand::Action { .. } => 3,
            Operand::Size(_) => 2,
            Operand::StoreState { .. } => 8,
        }
    }

    pub fn movsp_offset(&self) -> Option<i32> {
        match (self.opcode, &self.operand) {
            (Opcode::MovSp, Operand::Offset(n)) => Some(*n),
            _ => None,
        }
    }
}

/// An ordered instruction list: the unit handed between code generator,
/// optimizer passes, codec and decompiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Byte offset of every instruction plus the end-of-program offset, given
    /// the code starts at `base`.
    pub fn byte_offsets(&self, base: usize) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.instructions.len() + 1);
        let mut pos = base;
        for ins in &self.instructions {
            offsets.push(pos);
            pos += ins.encoded_size();
        }
        offsets.push(pos);
        offsets
    }

    /// `true` for every index some jump lands on.
    pub fn jump_targets(&self) -> Vec<bool> {
        let mut marks = vec![false; self.instructions.len()];
        for ins in &self.instructions {
            if let Some(slot) = ins.jump_target().and_then(|t| marks.get_mut(t)) {
                *slot = true;
            }
        }
        marks
    }

    /// Drop every instruction whose `keep` flag is false and rewrite jump
    /// targets. A target that was removed moves to the next surviving
    /// instruction.
    pub fn retain_indices(self, keep: &[bool]) -> Program {
        let n = self.instructions.len();
        let mut remap = vec![0usize; n + 1];
        let mut next = 0usize;
        for (i, slot) in remap.iter_mut().enumerate().take(n) {
            *slot = next;
            if keep.get(i).copied().unwrap_or(true) {
                next += 1;
            }
        }
        if let Some(last) = remap.last_mut() {
            *last = next;
        }
        let instructions = self
            .instructions
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.get(*i).copied().unwrap_or(true))
            .map(|(_, mut ins)| {
                if let Some(target) = ins.jump_target() {
                    let mapped = remap.get(target).copied().unwrap_or(next);
                    ins.set_jump_target(mapped);
                }
                ins
            })
            .collect();
        Program { instructions }
    }
}

impl From<Vec<Instruction>> for Program {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }
}

impl<'a> IntoIterator for &'a Program {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_operand_shape() {
        assert_eq!(Instruction::bare(Opcode::Retn, Qualifier::None).encoded_size(), 2);
        assert_eq!(Instruction::jump(Opcode::Jmp, 0).encoded_size(), 6);
        let s = Instruction::new(Opcode::Const, Qualifier::String, Operand::String("abc".into()));
        assert_eq!(s.encoded_size(), 7);
        let cp = Instruction::new(Opcode::CpTopSp, Qualifier::Stack, Operand::Stack { offset: -4, size: 4 });
        assert_eq!(cp.encoded_size(), 8);
    }

    #[test]
    fn retain_remaps_jumps_past_removed_targets() {
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jmp, 2),
            Instruction::bare(Opcode::Nop, Qualifier::None),
            Instruction::bare(Opcode::Nop, Qualifier::None),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let out = program.retain_indices(&[true, false, false, true]);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(0).unwrap().jump_target(), Some(1));
    }

    #[test]
    fn jump_target_marks() {
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jz, 2),
            Instruction::bare(Opcode::Nop, Qualifier::None),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        assert_eq!(program.jump_targets(), vec![false, false, true]);
    }
}
