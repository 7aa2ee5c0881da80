//! Optional instruction-level passes.
//!
//! The reference output is unoptimized, so [`Pipeline::default`] is empty and
//! callers opt in with [`Pipeline::standard`] or their own pass list. Every
//! pass takes the program by value and returns a program whose jumps still
//! point at valid indices.

use std::collections::VecDeque;

use super::instruction::{Instruction, Program};
use super::opcode::Opcode;

pub trait Pass: Send {
    fn name(&self) -> &'static str;
    fn apply(&mut self, program: Program) -> Program;
    /// Clear any per-run state; called before every application.
    fn reset(&mut self);
}

#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    /// All provided passes in their intended order.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(RemoveNops::default()),
            Box::new(ThreadJumps::default()),
            Box::new(RemoveUnreachable::default()),
            Box::new(MergeMovsp::default()),
        ])
    }

    pub fn push(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&mut self, mut program: Program) -> Program {
        for pass in &mut self.passes {
            pass.reset();
            let before = program.len();
            program = pass.apply(program);
            log::debug!(
                "pass {}: {} -> {} instructions",
                pass.name(),
                before,
                program.len()
            );
        }
        program
    }
}

// ── RemoveNops ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RemoveNops {
    removed: usize,
}

impl Pass for RemoveNops {
    fn name(&self) -> &'static str {
        "remove-nops"
    }

    fn apply(&mut self, program: Program) -> Program {
        let keep: Vec<bool> = program.iter().map(|ins| ins.opcode != Opcode::Nop).collect();
        self.removed += keep.iter().filter(|k| !**k).count();
        program.retain_indices(&keep)
    }

    fn reset(&mut self) {
        self.removed = 0;
    }
}

// ── MergeMovsp ───────────────────────────────────────────────────────

/// Fold `MOVSP a; MOVSP b` into `MOVSP a+b` when nothing jumps between them.
/// A merged adjustment of zero disappears.
#[derive(Default)]
pub struct MergeMovsp {
    merged: usize,
}

impl MergeMovsp {
    fn merge_once(&mut self, mut program: Program) -> (Program, bool) {
        let targets = program.jump_targets();
        let n = program.len();
        let mut keep = vec![true; n];
        let mut changed = false;
        let mut i = 0;
        while i + 1 < n {
            let a = program.get(i).and_then(Instruction::movsp_offset);
            let b = program.get(i + 1).and_then(Instruction::movsp_offset);
            let guarded = targets.get(i + 1).copied().unwrap_or(false);
            if let (Some(a), Some(b), false) = (a, b, guarded) {
                let sum = a + b;
                if let Some(ins) = program.instructions.get_mut(i) {
                    ins.operand = super::instruction::Operand::Offset(sum);
                }
                if let Some(k) = keep.get_mut(i + 1) {
                    *k = false;
                }
                if sum == 0 {
                    if let Some(k) = keep.get_mut(i) {
                        *k = false;
                    }
                }
                self.merged += 1;
                changed = true;
                i += 2;
                continue;
            }
            i += 1;
        }
        if changed {
            program = program.retain_indices(&keep);
        }
        (program, changed)
    }
}

impl Pass for MergeMovsp {
    fn name(&self) -> &'static str {
        "merge-movsp"
    }

    fn apply(&mut self, mut program: Program) -> Program {
        loop {
            let (next, changed) = self.merge_once(program);
            program = next;
            if !changed {
                break;
            }
        }
        program
    }

    fn reset(&mut self) {
        self.merged = 0;
    }
}

// ── ThreadJumps ──────────────────────────────────────────────────────

/// Retarget branches that land on an unconditional `JMP` to that jump's
/// final destination.
#[derive(Default)]
pub struct ThreadJumps {
    threaded: usize,
}

impl ThreadJumps {
    fn final_target(program: &Program, mut target: usize) -> usize {
        // A JMP cycle is bounded by the program length.
        for _ in 0..program.len() {
            match program.get(target) {
                Some(ins) if ins.opcode == Opcode::Jmp => match ins.jump_target() {
                    Some(next) if next != target => target = next,
                    _ => break,
                },
                _ => break,
            }
        }
        target
    }
}

impl Pass for ThreadJumps {
    fn name(&self) -> &'static str {
        "thread-jumps"
    }

    fn apply(&mut self, mut program: Program) -> Program {
        let finals: Vec<Option<usize>> = program
            .iter()
            .map(|ins| match ins.opcode {
                Opcode::Jmp | Opcode::Jz | Opcode::Jnz => ins
                    .jump_target()
                    .map(|t| Self::final_target(&program, t))
                    .filter(|f| Some(*f) != ins.jump_target()),
                _ => None,
            })
            .collect();
        for (ins, fin) in program.instructions.iter_mut().zip(finals) {
            if let Some(target) = fin {
                ins.set_jump_target(target);
                self.threaded += 1;
            }
        }
        program
    }

    fn reset(&mut self) {
        self.threaded = 0;
    }
}

// ── RemoveUnreachable ────────────────────────────────────────────────

/// Drop instructions no path from index 0 reaches. The body of an `action`
/// closure (two instructions past its `STORE_STATE`) counts as reachable.
#[derive(Default)]
pub struct RemoveUnreachable {
    removed: usize,
}

pub fn reachable(program: &Program) -> Vec<bool> {
    let n = program.len();
    let mut seen = vec![false; n];
    let mut queue = VecDeque::new();
    if n > 0 {
        queue.push_back(0usize);
    }
    while let Some(i) = queue.pop_front() {
        match seen.get_mut(i) {
            Some(s) if !*s => *s = true,
            _ => continue,
        }
        let Some(ins) = program.get(i) else { continue };
        if let Some(target) = ins.jump_target() {
            queue.push_back(target);
        }
        if ins.opcode == Opcode::StoreState {
            queue.push_back(i + 2);
        }
        if !ins.opcode.ends_flow() {
            queue.push_back(i + 1);
        }
    }
    seen
}

impl Pass for RemoveUnreachable {
    fn name(&self) -> &'static str {
        "remove-unreachable"
    }

    fn apply(&mut self, program: Program) -> Program {
        let keep = reachable(&program);
        self.removed += keep.iter().filter(|k| !**k).count();
        program.retain_indices(&keep)
    }

    fn reset(&mut self) {
        self.removed = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::ncs::instruction::Operand;
    use crate::ncs::opcode::Qualifier;

    fn movsp(n: i32) -> Instruction {
        Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(n))
    }

    fn retn() -> Instruction {
        Instruction::bare(Opcode::Retn, Qualifier::None)
    }

    fn nop() -> Instruction {
        Instruction::bare(Opcode::Nop, Qualifier::None)
    }

    #[test]
    fn default_pipeline_is_identity() {
        let program = Program::new(vec![nop(), movsp(-4), movsp(-4), retn()]);
        let out = Pipeline::default().run(program.clone());
        assert_eq!(out, program);
    }

    #[test]
    fn nops_removed_and_jump_remapped() {
        let program = Program::new(vec![Instruction::jump(Opcode::Jmp, 2), nop(), nop(), retn()]);
        let out = RemoveNops::default().apply(program);
        assert_eq!(out.len(), 2);
        assert_eq!(out.instructions[0].jump_target(), Some(1));
    }

    #[test]
    fn movsp_merge_respects_jump_targets() {
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jz, 2),
            movsp(-4),
            movsp(-8),
            retn(),
        ]);
        let out = MergeMovsp::default().apply(program.clone());
        assert_eq!(out, program);

        let plain = Program::new(vec![movsp(-4), movsp(-8), movsp(-4), retn()]);
        let out = MergeMovsp::default().apply(plain);
        assert_eq!(out.instructions, vec![movsp(-16), retn()]);
    }

    #[test]
    fn jump_chains_threaded() {
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jz, 2),
            retn(),
            Instruction::jump(Opcode::Jmp, 3),
            Instruction::jump(Opcode::Jmp, 4),
            retn(),
        ]);
        let out = ThreadJumps::default().apply(program);
        assert_eq!(out.instructions[0].jump_target(), Some(4));
        assert_eq!(out.instructions[2].jump_target(), Some(4));
    }

    #[test]
    fn self_loop_does_not_hang() {
        let program = Program::new(vec![Instruction::jump(Opcode::Jmp, 0)]);
        let out = ThreadJumps::default().apply(program.clone());
        assert_eq!(out, program);
    }

    #[test]
    fn unreachable_code_dropped_but_closures_kept() {
        let program = Program::new(vec![
            Instruction::new(Opcode::StoreState, Qualifier::STATE, Operand::StoreState { bp: 0, sp: 0 }),
            Instruction::jump(Opcode::Jmp, 4),
            nop(),
            retn(),
            retn(),
            movsp(-4),
        ]);
        let out = RemoveUnreachable::default().apply(program);
        assert_eq!(out.len(), 5);
        assert_eq!(out.instructions[1].jump_target(), Some(4));
    }

    #[test]
    fn standard_pipeline_runs_all_passes() {
        let mut pipeline = Pipeline::standard();
        assert_eq!(
            pipeline.names(),
            vec!["remove-nops", "thread-jumps", "remove-unreachable", "merge-movsp"]
        );
        let out = pipeline.run(Program::new(vec![nop(), movsp(-4), movsp(4), retn(), nop()]));
        assert_eq!(out.instructions, vec![retn()]);
    }
}
