//! NCS → NSS decompiler.
//!
//! ```text
//! subroutine  loader stub, globals routine, entry, callees, deferred actions
//! depth       stack depth before every instruction, parameter sizes
//! cfg         basic blocks, dominators, reducibility
//! stack       typed operand stack and the recovered statement tree
//! structure   simulation plus if/loop/switch matching
//! render      synthetic names, syntax tree for the printer
//! ```

#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod cfg;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod depth;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod render;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod stack;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod structure;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod subroutine;

use thiserror::Error;

use crate::ncs::Program;
use crate::nss::ast::Script;
use crate::nss::{print_script, DeclarationTable};

use structure::{Context, SubInfo};

/// Why a binary could not be turned back into source. `index` is an
/// instruction index into the decoded program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompileError {
    #[error("stack simulation failed at instruction {index}: {message}")]
    Stack { index: usize, message: String },
    #[error("unstructurable control flow at instruction {index}")]
    Unstructurable { index: usize },
    #[error("unknown engine routine {routine} at instruction {index}")]
    Signature { index: usize, routine: u16 },
    #[error("unsupported code at instruction {index}: {message}")]
    Unsupported { index: usize, message: String },
}

impl DecompileError {
    pub fn stack(index: usize, message: impl Into<String>) -> Self {
        Self::Stack {
            index,
            message: message.into(),
        }
    }

    pub fn unsupported(index: usize, message: impl Into<String>) -> Self {
        Self::Unsupported {
            index,
            message: message.into(),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Stack { index, .. }
            | Self::Unstructurable { index }
            | Self::Signature { index, .. }
            | Self::Unsupported { index, .. } => *index,
        }
    }
}

/// Recover a syntax tree from a decoded program. Engine routines are
/// resolved against `decls`, which must match the game the binary was
/// compiled for.
pub fn decompile(program: &Program, decls: &DeclarationTable) -> Result<Script, DecompileError> {
    let layout = subroutine::discover(program)?;
    let params = depth::parameter_sizes(program, &layout, decls)?;
    let lookup = |target: usize| layout.sub_at(target).and_then(|s| params.get(s).copied());

    let mut maps = Vec::with_capacity(layout.subs.len());
    for sub in &layout.subs {
        maps.push(depth::analyze(program, sub.range.clone(), &layout, decls, &lookup, true)?);
        let graph = cfg::Cfg::build(program, sub.range.clone(), &layout);
        if let Some(index) = cfg::find_irreducible(program, &graph) {
            return Err(DecompileError::Unstructurable { index });
        }
    }
    let room = depth::entry_room(program, &layout, &maps);
    let capacity = depth::pushed_bytes(program);

    let mut subs = Vec::with_capacity(layout.subs.len());
    for (n, (sub, depths)) in layout.subs.iter().zip(maps).enumerate() {
        let p = params.get(n).copied().unwrap_or(0);
        if p < 0 {
            return Err(DecompileError::stack(
                sub.start(),
                format!("subroutine leaves {} bytes more than it was given", -i64::from(p)),
            ));
        }
        let ret = depth::return_size(program, sub.range.clone(), &depths, p);
        let available = room.get(n).copied().flatten().unwrap_or(capacity);
        if i64::from(p) + ret > available {
            return Err(DecompileError::stack(
                sub.start(),
                format!("subroutine reaches {} bytes below its entry but only {available} are on the stack", i64::from(p) + ret),
            ));
        }
        let ret = i32::try_from(ret).map_err(|_| DecompileError::stack(sub.start(), "result slot too large"))?;
        log::trace!("subroutine {n} at {}: {p} parameter bytes, {ret} result bytes", sub.start());
        subs.push(SubInfo {
            params: p,
            ret,
            depths,
            param_types: None,
            return_type: None,
        });
    }

    let mut cx = Context::new(program, decls, &layout, subs);
    cx.run()?;
    Ok(render::render(&cx))
}

/// [`decompile`], printed.
pub fn decompile_to_source(program: &Program, decls: &DeclarationTable) -> Result<String, DecompileError> {
    decompile(program, decls).map(|script| print_script(&script))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::game::GameVariant;
    use crate::ncs::{Instruction, Opcode, Operand, Qualifier};
    use crate::nss::{compile, parse_source, resolve, type_check, CompiledUnit, DeclarationCache, LibraryTable};
    use pretty_assertions::assert_eq;

    fn compile_src(src: &str, decls: &DeclarationTable) -> Program {
        let unit = resolve(parse_source(src).unwrap(), &LibraryTable::new()).unwrap();
        let typed = type_check(&unit, decls).unwrap();
        match compile(&typed, false).unwrap() {
            CompiledUnit::Script(s) => s.program,
            CompiledUnit::Library(_) => panic!("expected a script"),
        }
    }

    /// Decompile the compiled source, recompile the result and require the
    /// same program back. Returns the decompiled text.
    fn round_trip(src: &str) -> String {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let original = compile_src(src, &decls);
        let text = decompile_to_source(&original, &decls).unwrap();
        let again = compile_src(&text, &decls);
        assert_eq!(again, original, "recompiled from:\n{text}");
        text
    }

    #[test]
    fn counting_loop_becomes_a_while() {
        let text = round_trip("void main() { int i = 0; while (i < 3) { i = i + 1; } }");
        assert!(text.contains("int nLocal1 = 0;"), "{text}");
        assert!(text.contains("while (nLocal1 < 3)"), "{text}");
    }

    #[test]
    fn if_else_branches() {
        let text = round_trip(
            "void main() { int n = 2; if (n > 1) { PrintInteger(n); } else { PrintInteger(0); } }",
        );
        assert!(text.contains("else\n"), "{text}");
    }

    #[test]
    fn user_function_with_result() {
        let text = round_trip("int Twice(int n) { return n + n; } void main() { int x = Twice(4); PrintInteger(x); }");
        assert!(text.contains("int sub1(int nParam1);"), "{text}");
        assert!(text.contains("return nParam1 + nParam1;"), "{text}");
        assert!(text.contains("int nLocal1 = sub1(4);"), "{text}");
    }

    #[test]
    fn globals_are_declared_at_file_scope() {
        let text = round_trip("int g = 5; void main() { g = g + 1; PrintInteger(g); }");
        assert!(text.contains("int nGlobal1 = 5;"), "{text}");
        assert!(text.contains("nGlobal1 = nGlobal1 + 1;"), "{text}");
    }

    #[test]
    fn starting_conditional_returns_its_value() {
        let text = round_trip("int StartingConditional() { return 1; }");
        assert!(text.contains("int StartingConditional()"), "{text}");
        assert!(text.contains("return 1;"), "{text}");
    }

    #[test]
    fn deferred_action_argument() {
        let text = round_trip("void main() { DelayCommand(1.0, PrintString(\"x\")); }");
        assert!(text.contains("DelayCommand(1.0, PrintString(\"x\"));"), "{text}");
    }

    #[test]
    fn switch_with_default() {
        let text = round_trip(
            "void main() { int n = 2; switch (n) { case 1: PrintInteger(1); break; \
             case 2: PrintInteger(2); break; default: PrintInteger(0); } }",
        );
        assert!(text.contains("switch (nLocal1)"), "{text}");
        assert!(text.contains("default:"), "{text}");
    }

    #[test]
    fn short_circuit_condition() {
        let text = round_trip("void main() { int a = 1; int b = 0; if (a && b) { PrintInteger(1); } }");
        assert!(text.contains("nLocal1 && nLocal2"), "{text}");
    }

    #[test]
    fn for_loop_with_continue_keeps_its_step() {
        let text = round_trip(
            "void main() { int i = 0; for (; i < 3; i++) { if (i == 1) continue; PrintInteger(i); } }",
        );
        assert!(text.contains("nLocal1++)"), "{text}");
        assert!(text.contains("continue;"), "{text}");
    }

    #[test]
    fn for_loop_with_body_local_keeps_its_step() {
        let text = round_trip("void main() { int i; for (i = 0; i < 3; i++) { int x = i; } }");
        assert!(text.contains("nLocal1++)"), "{text}");
        assert!(text.contains("int nLocal2 = nLocal1;"), "{text}");
        assert!(!text.contains("while ("), "{text}");

        round_trip("void main() { int i; for (i = 0; i < 3; i++) { int x = i; int y = x + 1; PrintInteger(y); } }");
        round_trip("void main() { int i; for (i = 0; i < 3; i++) { vector v = [0.0, 0.0, 0.0]; } }");
    }

    #[test]
    fn multi_statement_while_stays_a_while() {
        let text = round_trip("void main() { int x; int i = 0; while (i < 3) { x = i; i = i + 1; } }");
        assert!(text.contains("while ("), "{text}");
        assert!(!text.contains("for ("), "{text}");
    }

    #[test]
    fn vector_cells_merge_and_defaults_are_dropped() {
        let text = round_trip("void main() { vector v = [1.0, 2.0, 3.0]; PrintFloat(v.y); }");
        assert!(text.contains("vector vLocal1 = [1.0, 2.0, 3.0];"), "{text}");
        assert!(text.contains("PrintFloat(vLocal1.y);"), "{text}");
    }

    #[test]
    fn irreducible_loop_is_reported() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let konst = |v| Instruction::new(Opcode::Const, Qualifier::Int, Operand::Int(v));
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            konst(1),
            Instruction::jump(Opcode::Jz, 7),
            konst(1),
            Instruction::jump(Opcode::Jz, 10),
            Instruction::bare(Opcode::Nop, Qualifier::None),
            konst(0),
            Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::jump(Opcode::Jmp, 4),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        assert_eq!(
            decompile(&program, &decls).unwrap_err(),
            DecompileError::Unstructurable { index: 9 }
        );
    }

    #[test]
    fn unknown_routine_is_a_signature_error() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            Instruction::new(Opcode::Action, Qualifier::None, Operand::Action { routine: 60000, argc: 0 }),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let err = decompile(&program, &decls).unwrap_err();
        assert!(matches!(err, DecompileError::Signature { index: 2, routine: 60000 }));
        assert_eq!(err.index(), 2);
    }

    #[test]
    fn non_finite_float_constants_are_rejected() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let program = Program::new(vec![
                Instruction::jump(Opcode::Jsr, 2),
                Instruction::bare(Opcode::Retn, Qualifier::None),
                Instruction::new(Opcode::Const, Qualifier::Float, Operand::Float(bad)),
                Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
                Instruction::bare(Opcode::Retn, Qualifier::None),
            ]);
            let err = decompile_to_source(&program, &decls).unwrap_err();
            assert!(matches!(err, DecompileError::Unsupported { index: 2, .. }), "{err}");
        }
    }

    #[test]
    fn result_slot_beyond_the_stack_is_rejected() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            Instruction::new(Opcode::Const, Qualifier::Int, Operand::Int(0)),
            Instruction::new(
                Opcode::CpDownSp,
                Qualifier::Stack,
                Operand::Stack {
                    offset: -2_000_000_000,
                    size: 4,
                },
            ),
            Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-4)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let err = decompile(&program, &decls).unwrap_err();
        assert!(matches!(err, DecompileError::Stack { index: 2, .. }), "{err}");
    }

    #[test]
    fn parameters_beyond_the_stack_are_rejected() {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let program = Program::new(vec![
            Instruction::jump(Opcode::Jsr, 2),
            Instruction::bare(Opcode::Retn, Qualifier::None),
            Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(-400)),
            Instruction::bare(Opcode::Retn, Qualifier::None),
        ]);
        let err = decompile(&program, &decls).unwrap_err();
        assert!(matches!(err, DecompileError::Stack { index: 2, .. }), "{err}");
    }
}
