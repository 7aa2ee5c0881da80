//! Program layout recovery: the loader stub, the globals routine, the entry
//! subroutine, every other subroutine and the deferred-action bodies.

use std::collections::BTreeSet;
use std::ops::Range;

use super::DecompileError;
use crate::ncs::{Opcode, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    /// Runs global initializers, then calls the entry point.
    Globals,
    Entry,
    Function,
}

#[derive(Debug, Clone)]
pub struct Subroutine {
    pub range: Range<usize>,
    pub kind: SubKind,
}

impl Subroutine {
    pub fn start(&self) -> usize {
        self.range.start
    }
}

/// `STORE_STATE; JMP over; body...; RETN; over:`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub state: usize,
    /// The body without its trailing `RETN`.
    pub body: Range<usize>,
    /// Where execution continues after the saved state.
    pub resume: usize,
}

#[derive(Debug, Clone)]
pub struct Layout {
    /// Stub reserves an `int` result for `StartingConditional`.
    pub conditional: bool,
    pub subs: Vec<Subroutine>,
    pub entry: usize,
    pub globals: Option<usize>,
    /// Index of `SAVEBP` inside the globals routine.
    pub save_bp: Option<usize>,
    pub closures: Vec<Closure>,
}

impl Layout {
    pub fn sub_at(&self, start: usize) -> Option<usize> {
        self.subs.iter().position(|s| s.range.start == start)
    }

    pub fn closure_at(&self, state: usize) -> Option<&Closure> {
        self.closures.iter().find(|c| c.state == state)
    }

    /// Index of the `RETN` that closes a deferred-action body.
    pub fn is_closure_return(&self, index: usize) -> bool {
        self.closures.iter().any(|c| c.body.end == index)
    }

    pub fn in_closure(&self, index: usize) -> bool {
        self.closures.iter().any(|c| c.body.contains(&index) || c.body.end == index)
    }
}

pub fn discover(program: &Program) -> Result<Layout, DecompileError> {
    let ins = &program.instructions;
    let (conditional, stub_jsr) = match ins.first().map(|i| i.opcode) {
        Some(Opcode::RsAdd) => (true, 1),
        Some(Opcode::Jsr) => (false, 0),
        _ => return Err(DecompileError::unsupported(0, "program does not start with a loader stub")),
    };
    let first = ins
        .get(stub_jsr)
        .filter(|i| i.opcode == Opcode::Jsr)
        .and_then(|i| i.jump_target())
        .ok_or_else(|| DecompileError::unsupported(stub_jsr, "loader stub has no call"))?;
    if ins.get(stub_jsr + 1).map(|i| i.opcode) != Some(Opcode::Retn) {
        return Err(DecompileError::unsupported(stub_jsr + 1, "loader stub does not return"));
    }

    let mut starts = BTreeSet::new();
    for i in ins {
        if i.opcode == Opcode::Jsr {
            if let Some(t) = i.jump_target() {
                starts.insert(t);
            }
        }
    }
    if starts.first().is_some_and(|&s| s <= stub_jsr + 1) {
        return Err(DecompileError::unsupported(stub_jsr, "call into the loader stub"));
    }
    let starts: Vec<usize> = starts.into_iter().collect();
    let mut subs: Vec<Subroutine> = starts
        .iter()
        .enumerate()
        .map(|(n, &s)| Subroutine {
            range: s..starts.get(n + 1).copied().unwrap_or(ins.len()),
            kind: SubKind::Function,
        })
        .collect();

    let save_bp = subs
        .iter()
        .find(|s| s.range.start == first)
        .and_then(|s| s.range.clone().find(|&i| ins[i].opcode == Opcode::SaveBp));
    let (entry, globals) = match save_bp {
        Some(at) => {
            let call = (at + 1..(at + 3).min(ins.len()))
                .find(|&i| ins[i].opcode == Opcode::Jsr)
                .ok_or_else(|| DecompileError::unsupported(at, "globals routine never calls the entry point"))?;
            let target = ins[call]
                .jump_target()
                .ok_or_else(|| DecompileError::unsupported(call, "call without a target"))?;
            (target, Some(first))
        }
        None => (first, None),
    };
    for sub in &mut subs {
        if Some(sub.range.start) == globals {
            sub.kind = SubKind::Globals;
        } else if sub.range.start == entry {
            sub.kind = SubKind::Entry;
        }
    }
    for sub in &subs {
        let last = sub.range.end - 1;
        if ins[last].opcode != Opcode::Retn {
            return Err(DecompileError::unsupported(last, "subroutine does not end in RETN"));
        }
    }

    let closures = find_closures(program)?;
    log::debug!(
        "layout: {} subroutines, {} deferred actions, globals {}",
        subs.len(),
        closures.len(),
        if globals.is_some() { "present" } else { "absent" }
    );
    Ok(Layout {
        conditional,
        subs,
        entry,
        globals,
        save_bp,
        closures,
    })
}

fn find_closures(program: &Program) -> Result<Vec<Closure>, DecompileError> {
    let ins = &program.instructions;
    let mut out = Vec::new();
    for (k, i) in ins.iter().enumerate() {
        if i.opcode != Opcode::StoreState {
            continue;
        }
        let over = ins
            .get(k + 1)
            .filter(|j| j.opcode == Opcode::Jmp)
            .and_then(|j| j.jump_target())
            .filter(|&t| t > k + 2)
            .ok_or_else(|| DecompileError::unsupported(k, "saved state is not followed by a jump over its body"))?;
        if ins.get(over - 1).map(|r| r.opcode) != Some(Opcode::Retn) {
            return Err(DecompileError::unsupported(over - 1, "deferred action body does not end in RETN"));
        }
        out.push(Closure {
            state: k,
            body: k + 2..over - 1,
            resume: over,
        });
    }
    Ok(out)
}
