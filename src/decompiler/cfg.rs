//! Basic blocks, dominators and the reducibility check.
//!
//! A block is a maximal run of instructions entered only at its first
//! instruction and left only at its last. Deferred-action bodies are not part
//! of the enclosing subroutine's graph: control only reaches them through the
//! engine.

use std::ops::Range;

use super::subroutine::Layout;
use crate::ncs::{Opcode, Program};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub range: Range<usize>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    base: usize,
    block_of: Vec<usize>,
}

impl Cfg {
    pub fn build(program: &Program, range: Range<usize>, layout: &Layout) -> Cfg {
        let ins = &program.instructions;
        let base = range.start;
        let len = range.len();
        let mut leader = vec![false; len];
        if let Some(first) = leader.first_mut() {
            *first = true;
        }
        let mut mark = |i: usize| {
            if let Some(slot) = i.checked_sub(base).and_then(|k| leader.get_mut(k)) {
                *slot = true;
            }
        };
        for i in range.clone() {
            let op = ins[i].opcode;
            if op.is_jump() && op != Opcode::Jsr {
                if let Some(t) = ins[i].jump_target() {
                    mark(t);
                }
                mark(i + 1);
            } else if op == Opcode::Retn {
                mark(i + 1);
            } else if op == Opcode::StoreState {
                if let Some(c) = layout.closure_at(i) {
                    mark(c.body.start);
                    mark(c.resume);
                }
            }
        }

        let mut blocks = Vec::new();
        let mut block_of = vec![0; len];
        let mut start = base;
        for i in range.clone() {
            let next_is_leader = leader.get(i + 1 - base).copied().unwrap_or(true);
            block_of[i - base] = blocks.len();
            if next_is_leader {
                blocks.push(Block {
                    range: start..i + 1,
                    succs: Vec::new(),
                    preds: Vec::new(),
                });
                start = i + 1;
            }
        }

        let mut cfg = Cfg { blocks, base, block_of };
        for b in 0..cfg.blocks.len() {
            let last = cfg.blocks[b].range.end - 1;
            let ins_last = &ins[last];
            let mut targets = Vec::new();
            match ins_last.opcode {
                Opcode::Retn => {}
                Opcode::Jmp => targets.extend(ins_last.jump_target()),
                Opcode::Jz | Opcode::Jnz => {
                    targets.push(last + 1);
                    targets.extend(ins_last.jump_target());
                }
                Opcode::StoreState => {
                    targets.extend(layout.closure_at(last).map(|c| c.resume));
                }
                _ => targets.push(last + 1),
            }
            for t in targets {
                if let Some(s) = cfg.block_at(t) {
                    if !cfg.blocks[b].succs.contains(&s) {
                        cfg.blocks[b].succs.push(s);
                        cfg.blocks[s].preds.push(b);
                    }
                }
            }
        }
        cfg
    }

    pub fn block_at(&self, index: usize) -> Option<usize> {
        index
            .checked_sub(self.base)
            .and_then(|k| self.block_of.get(k))
            .copied()
    }

    /// Blocks reachable from the first block.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![0];
        while let Some(b) = stack.pop() {
            if seen.get(b).copied().unwrap_or(true) {
                continue;
            }
            seen[b] = true;
            stack.extend(self.blocks[b].succs.iter().copied());
        }
        seen
    }
}

// ── Dominators ───────────────────────────────────────────────────────

/// Fixed-size bit set, one bit per block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn empty(n: usize) -> Self {
        Self {
            words: vec![0; n.div_ceil(64)],
        }
    }

    fn full(n: usize) -> Self {
        let mut set = Self::empty(n);
        for i in 0..n {
            set.insert(i);
        }
        set
    }

    fn insert(&mut self, i: usize) {
        if let Some(w) = self.words.get_mut(i / 64) {
            *w |= 1 << (i % 64);
        }
    }

    fn contains(&self, i: usize) -> bool {
        self.words.get(i / 64).is_some_and(|w| w & (1 << (i % 64)) != 0)
    }

    fn intersect(&mut self, other: &BitSet) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }
}

/// Dominator sets by iterative fixpoint:
/// `dom(b) = {b} ∪ ⋂ dom(p)` over reachable predecessors `p`.
#[derive(Debug, Clone)]
pub struct Dominators {
    dom: Vec<BitSet>,
}

impl Dominators {
    pub fn compute(cfg: &Cfg) -> Self {
        let n = cfg.blocks.len();
        let reachable = cfg.reachable();
        let mut dom = vec![BitSet::full(n); n];
        if let Some(entry) = dom.first_mut() {
            *entry = BitSet::empty(n);
            entry.insert(0);
        }

        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..n {
                if !reachable[b] {
                    continue;
                }
                let mut inter = BitSet::full(n);
                for &p in &cfg.blocks[b].preds {
                    if reachable[p] {
                        inter.intersect(&dom[p]);
                    }
                }
                inter.insert(b);
                if inter != dom[b] {
                    dom[b] = inter;
                    changed = true;
                }
            }
        }
        Self { dom }
    }

    /// `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        self.dom.get(b).is_some_and(|set| set.contains(a))
    }
}

/// Every edge that jumps backwards must close a natural loop: its target
/// dominates its source. Returns the index of the first offending jump.
pub fn find_irreducible(program: &Program, cfg: &Cfg) -> Option<usize> {
    let doms = Dominators::compute(cfg);
    let reachable = cfg.reachable();
    for (b, block) in cfg.blocks.iter().enumerate() {
        if !reachable[b] {
            continue;
        }
        for &s in &block.succs {
            let back = cfg.blocks[s].range.start <= block.range.start;
            if back && !doms.dominates(s, b) {
                let last = block.range.end - 1;
                log::debug!("edge {b} -> {s} re-enters a loop without passing its header");
                return Some(if program.instructions[last].opcode.is_jump() { last } else { block.range.start });
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decompiler::subroutine::discover;
    use crate::ncs::{Instruction, Operand, Qualifier};

    fn konst(v: i32) -> Instruction {
        Instruction::new(Opcode::Const, Qualifier::Int, Operand::Int(v))
    }

    fn retn() -> Instruction {
        Instruction::bare(Opcode::Retn, Qualifier::None)
    }

    /// The loop body at 4 can be entered from 2 without passing 4's header.
    fn irreducible() -> Program {
        Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            retn(),
            konst(1),
            Instruction::jump(Opcode::Jz, 7),
            konst(1),
            Instruction::jump(Opcode::Jz, 10),
            Instruction::bare(Opcode::Nop, Qualifier::None),
            konst(0),
            Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::jump(Opcode::Jmp, 4),
            retn(),
        ])
    }

    #[test]
    fn blocks_split_at_jumps_and_targets() {
        let program = irreducible();
        let layout = discover(&program).unwrap();
        let cfg = Cfg::build(&program, 2..11, &layout);
        let ranges: Vec<_> = cfg.blocks.iter().map(|b| b.range.clone()).collect();
        assert_eq!(ranges, vec![2..4, 4..6, 6..7, 7..10, 10..11]);
        assert_eq!(cfg.blocks[0].succs, vec![1, 3]);
        assert_eq!(cfg.blocks[3].succs, vec![1]);
    }

    #[test]
    fn entry_dominates_everything() {
        let program = irreducible();
        let layout = discover(&program).unwrap();
        let cfg = Cfg::build(&program, 2..11, &layout);
        let doms = Dominators::compute(&cfg);
        for b in 0..cfg.blocks.len() {
            assert!(doms.dominates(0, b));
        }
        assert!(!doms.dominates(1, 3));
        assert!(doms.dominates(1, 2));
    }

    #[test]
    fn irreducible_back_edge_is_found() {
        let program = irreducible();
        let layout = discover(&program).unwrap();
        let cfg = Cfg::build(&program, 2..11, &layout);
        assert_eq!(find_irreducible(&program, &cfg), Some(9));
    }

    #[test]
    fn while_loop_is_reducible() {
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            retn(),
            konst(1),
            Instruction::jump(Opcode::Jz, 7),
            konst(2),
            Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::jump(Opcode::Jmp, 2),
            retn(),
        ]);
        let layout = discover(&program).unwrap();
        let cfg = Cfg::build(&program, 2..8, &layout);
        assert_eq!(find_irreducible(&program, &cfg), None);
    }
}
