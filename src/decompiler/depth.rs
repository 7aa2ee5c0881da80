//! Stack depth before every instruction of a subroutine.
//!
//! Depth is in bytes relative to the stack pointer at subroutine entry.
//! Callee parameter sizes are needed to step over `JSR`, and they are only
//! known once each callee's own `RETN` depth is known, so the per-subroutine
//! pass runs to a fixpoint across the whole program.

use std::ops::Range;

use super::subroutine::Layout;
use super::DecompileError;
use crate::ncs::{Instruction, Opcode, Operand, Program, Qualifier};
use crate::nss::{DeclarationTable, NssType};

/// Bytes an engine parameter or return value of type `ty` occupies.
/// Engine signatures never mention user structs.
pub fn engine_size(ty: &NssType) -> i32 {
    match ty {
        NssType::Void | NssType::Action => 0,
        NssType::Vector => 12,
        _ => 4,
    }
}

/// Net stack effect of `ACTION routine, argc`.
pub fn action_effect(decls: &DeclarationTable, index: usize, routine: u16, argc: u8) -> Result<i32, DecompileError> {
    let func = decls
        .by_routine(routine)
        .ok_or(DecompileError::Signature { index, routine })?;
    if usize::from(argc) > func.params.len() {
        return Err(DecompileError::Signature { index, routine });
    }
    let args: i32 = func
        .params
        .iter()
        .take(usize::from(argc))
        .map(|p| engine_size(&p.ty))
        .sum();
    Ok(engine_size(&func.return_type) - args)
}

/// Bytes popped for the left and right operands of a binary instruction.
pub fn operand_sizes(q: Qualifier, operand: &Operand) -> (i32, i32) {
    match q {
        Qualifier::VectorVector => (12, 12),
        Qualifier::VectorFloat => (12, 4),
        Qualifier::FloatVector => (4, 12),
        Qualifier::StructStruct => match operand {
            Operand::Size(n) => (i32::from(*n), i32::from(*n)),
            _ => (0, 0),
        },
        _ => (4, 4),
    }
}

/// Bytes left by a binary instruction with this qualifier.
pub fn binary_result(opcode: Opcode, q: Qualifier) -> i32 {
    let comparison = matches!(
        opcode,
        Opcode::Equal | Opcode::NEqual | Opcode::Lt | Opcode::Leq | Opcode::Gt | Opcode::Geq
    );
    match q {
        Qualifier::VectorVector | Qualifier::VectorFloat | Qualifier::FloatVector if !comparison => 12,
        _ => 4,
    }
}

pub fn is_binary(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::LogAnd
            | Opcode::LogOr
            | Opcode::IncOr
            | Opcode::ExcOr
            | Opcode::BoolAnd
            | Opcode::Equal
            | Opcode::NEqual
            | Opcode::Geq
            | Opcode::Gt
            | Opcode::Lt
            | Opcode::Leq
            | Opcode::ShLeft
            | Opcode::ShRight
            | Opcode::UShRight
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
    )
}

/// Net effect of one instruction; `None` when it calls a subroutine whose
/// parameter size is not known yet.
fn effect(
    ins: &Instruction,
    index: usize,
    decls: &DeclarationTable,
    callee_params: &dyn Fn(usize) -> Option<i32>,
) -> Result<Option<i32>, DecompileError> {
    let delta = match ins.opcode {
        Opcode::RsAdd | Opcode::Const | Opcode::SaveBp => 4,
        Opcode::RestoreBp => -4,
        Opcode::CpTopSp | Opcode::CpTopBp => match ins.operand {
            Operand::Stack { size, .. } => i32::from(size),
            _ => return Err(DecompileError::stack(index, "copy without a stack operand")),
        },
        Opcode::Action => match ins.operand {
            Operand::Action { routine, argc } => action_effect(decls, index, routine, argc)?,
            _ => return Err(DecompileError::stack(index, "ACTION without a routine")),
        },
        op if is_binary(op) => {
            let (l, r) = operand_sizes(ins.qualifier, &ins.operand);
            binary_result(op, ins.qualifier) - l - r
        }
        Opcode::MovSp => ins.movsp_offset().unwrap_or(0),
        Opcode::Jz | Opcode::Jnz => -4,
        Opcode::Jsr => {
            let target = ins.jump_target().unwrap_or(0);
            match callee_params(target) {
                Some(p) => -p,
                None => return Ok(None),
            }
        }
        Opcode::Destruct => match ins.operand {
            Operand::Destruct { size, keep, .. } => i32::from(keep) - i32::from(size),
            _ => return Err(DecompileError::stack(index, "DESTRUCT without a layout")),
        },
        _ => 0,
    };
    Ok(Some(delta))
}

/// Depths for one subroutine.
#[derive(Debug, Clone)]
pub struct DepthMap {
    base: usize,
    at: Vec<Option<i32>>,
    /// Depth at the subroutine's own `RETN`, if one was reached.
    pub retn: Option<i32>,
}

impl DepthMap {
    /// Depth before `index`; `None` when it is unreachable.
    pub fn get(&self, index: usize) -> Option<i32> {
        index
            .checked_sub(self.base)
            .and_then(|i| self.at.get(i))
            .copied()
            .flatten()
    }

    pub fn is_reachable(&self, index: usize) -> bool {
        self.get(index).is_some()
    }
}

/// Walk a subroutine from its first instruction. With `strict`, conflicting
/// depths at a join are an error and every callee must be known; otherwise
/// paths through unknown callees are abandoned.
pub fn analyze(
    program: &Program,
    range: Range<usize>,
    layout: &Layout,
    decls: &DeclarationTable,
    callee_params: &dyn Fn(usize) -> Option<i32>,
    strict: bool,
) -> Result<DepthMap, DecompileError> {
    let ins = &program.instructions;
    let mut map = DepthMap {
        base: range.start,
        at: vec![None; range.len()],
        retn: None,
    };
    let mut work = vec![(range.start, 0i32)];

    while let Some((i, depth)) = work.pop() {
        if !range.contains(&i) {
            return Err(DecompileError::stack(i, "control leaves the subroutine"));
        }
        let slot = &mut map.at[i - range.start];
        match *slot {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                if strict {
                    return Err(DecompileError::stack(
                        i,
                        format!("stack depth {depth} disagrees with {seen} on another path"),
                    ));
                }
                continue;
            }
            None => *slot = Some(depth),
        }
        let current = &ins[i];
        if depth < -0x10000 {
            return Err(DecompileError::stack(i, "stack underflow"));
        }

        let Some(delta) = effect(current, i, decls, callee_params)? else {
            if strict {
                return Err(DecompileError::stack(i, "call to a subroutine of unknown arity"));
            }
            continue;
        };
        let next = depth
            .checked_add(delta)
            .ok_or_else(|| DecompileError::stack(i, "stack depth overflows"))?;
        match current.opcode {
            Opcode::Retn => {
                if !layout.is_closure_return(i) && map.retn.is_none() {
                    map.retn = Some(depth);
                }
            }
            Opcode::Jmp => work.push((current.jump_target().unwrap_or(i), next)),
            Opcode::Jz | Opcode::Jnz => {
                work.push((current.jump_target().unwrap_or(i), next));
                work.push((i + 1, next));
            }
            Opcode::StoreState => {
                work.push((i + 1, next));
                work.push((i + 2, next));
            }
            _ => work.push((i + 1, next)),
        }
    }
    Ok(map)
}

/// Parameter bytes of every subroutine, indexed like `layout.subs`.
pub fn parameter_sizes(
    program: &Program,
    layout: &Layout,
    decls: &DeclarationTable,
) -> Result<Vec<i32>, DecompileError> {
    let mut params: Vec<Option<i32>> = vec![None; layout.subs.len()];
    loop {
        let mut changed = false;
        for (n, sub) in layout.subs.iter().enumerate() {
            if params[n].is_some() {
                continue;
            }
            let known = params.clone();
            let lookup = |target: usize| layout.sub_at(target).and_then(|s| known[s]);
            let map = analyze(program, sub.range.clone(), layout, decls, &lookup, false)?;
            if let Some(d) = map.retn {
                let popped = d
                    .checked_neg()
                    .ok_or_else(|| DecompileError::stack(sub.start(), "subroutine pops more than the stack holds"))?;
                params[n] = Some(popped);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(params
        .into_iter()
        .enumerate()
        .map(|(n, p)| {
            p.unwrap_or_else(|| {
                log::warn!("subroutine {n} never returns; assuming no parameters");
                0
            })
        })
        .collect())
}

/// Return-slot bytes a subroutine writes below its parameters.
pub fn return_size(program: &Program, range: Range<usize>, depths: &DepthMap, params: i32) -> i64 {
    let params = i64::from(params);
    let mut size = 0;
    for i in range {
        let ins = &program.instructions[i];
        if ins.opcode != Opcode::CpDownSp {
            continue;
        }
        let (Some(d), Operand::Stack { offset, .. }) = (depths.get(i), &ins.operand) else {
            continue;
        };
        let pos = i64::from(d) + i64::from(*offset);
        if pos < -params {
            size = size.max(-pos - params);
        }
    }
    size
}

/// Bytes already on the stack when each subroutine is entered, taken from
/// its first reachable call site. `None` when every call site is dead code.
pub fn entry_room(program: &Program, layout: &Layout, maps: &[DepthMap]) -> Vec<Option<i64>> {
    let mut room = vec![None; layout.subs.len()];
    let Some(first) = layout.sub_at(layout.globals.unwrap_or(layout.entry)) else {
        return room;
    };
    room[first] = Some(if layout.conditional { 4 } else { 0 });
    let mut work = vec![first];
    while let Some(caller) = work.pop() {
        let base = room[caller].unwrap_or(0);
        for i in layout.subs[caller].range.clone() {
            let ins = &program.instructions[i];
            if ins.opcode != Opcode::Jsr {
                continue;
            }
            let callee = ins.jump_target().and_then(|t| layout.sub_at(t));
            let (Some(d), Some(callee)) = (maps.get(caller).and_then(|m| m.get(i)), callee) else {
                continue;
            };
            if room[callee].is_none() {
                room[callee] = Some(base + i64::from(d));
                work.push(callee);
            }
        }
    }
    room
}

/// Most bytes the program could hold at once if every push ran exactly once.
pub fn pushed_bytes(program: &Program) -> i64 {
    program
        .iter()
        .map(|ins| match (ins.opcode, &ins.operand) {
            (Opcode::RsAdd | Opcode::Const | Opcode::SaveBp, _) => 4,
            (Opcode::CpTopSp | Opcode::CpTopBp, Operand::Stack { size, .. }) => i64::from(*size),
            (Opcode::Action, _) => 12,
            (op, _) if is_binary(op) => 12,
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decompiler::subroutine::discover;
    use crate::game::GameVariant;
    use crate::nss::DeclarationCache;

    fn op(opcode: Opcode, q: Qualifier, operand: Operand) -> Instruction {
        Instruction::new(opcode, q, operand)
    }

    /// `int Twice(int n) { return n + n; } void main() { int x = Twice(4); }`
    fn call_program() -> Program {
        Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            Instruction::bare(Opcode::RsAdd, Qualifier::Int),
            Instruction::bare(Opcode::RsAdd, Qualifier::Int),
            op(Opcode::Const, Qualifier::Int, Operand::Int(4)),
            Instruction::jump(Opcode::Jsr, 10),
            op(Opcode::CpDownSp, Qualifier::Stack, Operand::Stack { offset: -8, size: 4 }),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            op(Opcode::CpTopSp, Qualifier::Stack, Operand::Stack { offset: -4, size: 4 }),
            op(Opcode::CpTopSp, Qualifier::Stack, Operand::Stack { offset: -8, size: 4 }),
            Instruction::bare(Opcode::Add, Qualifier::IntInt),
            op(Opcode::CpDownSp, Qualifier::Stack, Operand::Stack { offset: -12, size: 4 }),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::jump(Opcode::Jmp, 16),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ])
    }

    #[test]
    fn parameters_and_return_slot() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = call_program();
        let layout = discover(&program).unwrap();
        let params = parameter_sizes(&program, &layout, &decls).unwrap();
        assert_eq!(params, vec![0, 4]);

        let lookup = |t: usize| layout.sub_at(t).map(|s| params[s]);
        let twice = layout.subs[1].range.clone();
        let map = analyze(&program, twice.clone(), &layout, &decls, &lookup, true).unwrap();
        assert_eq!(map.get(13), Some(4));
        assert_eq!(map.retn, Some(-4));
        assert_eq!(return_size(&program, twice, &map, 4), 4);

        let main = analyze(&program, layout.subs[0].range.clone(), &layout, &decls, &lookup, true).unwrap();
        assert_eq!(main.get(6), Some(8));
        assert_eq!(main.retn, Some(0));

        let room = entry_room(&program, &layout, &[main, map]);
        assert_eq!(room, vec![Some(0), Some(8)]);
    }

    #[test]
    fn huge_offsets_do_not_overflow() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(i32::MIN)),
            op(Opcode::MovSp, Qualifier::None, Operand::Offset(i32::MIN)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let layout = discover(&program).unwrap();
        let none = |_: usize| None;
        let err = analyze(&program, 2..5, &layout, &decls, &none, true).unwrap_err();
        assert!(matches!(err, DecompileError::Stack { .. }));
    }

    #[test]
    fn action_uses_declared_signature() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        // PrintFloat(float, int, int) returns nothing.
        assert_eq!(action_effect(&decls, 0, 2, 3).unwrap(), -12);
        assert!(matches!(
            action_effect(&decls, 0, 60000, 0),
            Err(DecompileError::Signature { routine: 60000, .. })
        ));
    }

    #[test]
    fn conflicting_join_is_rejected() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            op(Opcode::Const, Qualifier::Int, Operand::Int(1)),
            Instruction::jump(Opcode::Jz, 5),
            op(Opcode::Const, Qualifier::Int, Operand::Int(2)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let layout = discover(&program).unwrap();
        let none = |_: usize| None;
        let err = analyze(&program, 2..6, &layout, &decls, &none, true).unwrap_err();
        assert!(matches!(err, DecompileError::Stack { index: 5, .. }));
    }
}
