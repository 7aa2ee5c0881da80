//! End-to-end: source → binary → source → binary through the public API.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::atomic::AtomicBool;

use pretty_assertions::assert_eq;

use nsscomp::batch::{self, BatchOptions, Mode, Status};
use nsscomp::driver::{self, CompileOptions, CompiledBinary};
use nsscomp::ncs::{decode, encode, Instruction, Opcode, Operand, Program, Qualifier};
use nsscomp::{Compiled, GameVariant};

const COUNTING_LOOP: &str = "void main() { int i = 0; while (i < 3) { i = i + 1; } }";

fn binary(source: &str) -> CompiledBinary {
    match driver::compile(source, GameVariant::K1, &CompileOptions::default()).unwrap() {
        Compiled::Script(b) => b,
        Compiled::Library(_) => panic!("expected a script"),
    }
}

/// Compile, decompile, recompile; the two binaries must match byte for byte.
fn assert_round_trip(source: &str) -> String {
    let first = binary(source);
    let text = driver::decompile(&first.bytes, GameVariant::K1, None).unwrap();
    let second = binary(&text);
    assert_eq!(second.program, first.program, "decompiled text:\n{text}");
    assert_eq!(second.bytes, first.bytes);
    text
}

#[test]
fn codec_round_trip_is_lossless() {
    let compiled = binary(COUNTING_LOOP);
    let decoded = decode(&compiled.bytes).unwrap();
    assert_eq!(decoded, compiled.program);
    assert_eq!(encode(&decoded).unwrap(), compiled.bytes);
}

#[test]
fn counting_loop_is_deterministic() {
    let runs: Vec<Vec<u8>> = (0..3).map(|_| binary(COUNTING_LOOP).bytes).collect();
    assert!(runs.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn loops_and_branches_survive() {
    let text = assert_round_trip(COUNTING_LOOP);
    assert!(text.contains("while ("), "{text}");

    assert_round_trip("void main() { int n = 2; if (n > 1) { PrintInteger(n); } else { PrintInteger(0); } }");
    assert_round_trip("void main() { int i = 0; for (; i < 3; i++) { if (i == 1) continue; PrintInteger(i); } }");
    assert_round_trip(
        "void main() { int n = 2; switch (n) { case 1: PrintInteger(1); break; \
         case 2: PrintInteger(2); break; default: PrintInteger(0); } }",
    );
    assert_round_trip("void main() { int a = 1; int b = 0; if (a && b) { PrintInteger(1); } }");

    let text = assert_round_trip("void main() { int i; for (i = 0; i < 3; i++) { int x = i; } }");
    assert!(text.contains("for ("), "{text}");
}

#[test]
fn call_graph_survives() {
    let text = assert_round_trip(
        "int Twice(int n) { return n + n; } void main() { int x = Twice(4); PrintInteger(x); }",
    );
    assert!(text.contains("sub1("), "{text}");

    assert_round_trip("int g = 5; void main() { g = g + 1; PrintInteger(g); }");
    assert_round_trip("int StartingConditional() { return 1; }");
    assert_round_trip("void main() { DelayCommand(1.0, PrintString(\"x\")); }");
    assert_round_trip("void main() { vector v = [1.0, 2.0, 3.0]; PrintFloat(v.y); }");
}

#[test]
fn roundtrip_helper_reports_identity() {
    let compiled = binary(COUNTING_LOOP);
    let trip = driver::roundtrip(&compiled.bytes, GameVariant::K1, None).unwrap();
    assert_eq!(trip.bytes, compiled.bytes);
    assert!(trip.source.contains("void main()"));
}

#[test]
fn selective_includes_through_the_file_system() {
    let dir = tempfile::tempdir().unwrap();
    let inc = dir.path().join("inc");
    std::fs::create_dir(&inc).unwrap();
    std::fs::write(inc.join("k_inc_math.nss"), "int Square(int n) { return n * n; }").unwrap();
    std::fs::write(inc.join("k_inc_noise.nss"), "int Noise() { return 7; }").unwrap();

    let main = dir.path().join("main.nss");
    std::fs::write(
        &main,
        "#include \"k_inc_noise\"\n#include \"k_inc_math\"\nvoid main() { PrintInteger(Square(3)); }",
    )
    .unwrap();
    let options = CompileOptions {
        include_dirs: vec![inc],
        ..CompileOptions::default()
    };
    let Compiled::Script(out) = driver::compile_file(&main, GameVariant::K1, &options).unwrap() else {
        panic!("expected a script");
    };
    assert_eq!(out.libraries, vec!["k_inc_math".to_string()]);
    assert_eq!(out.functions, vec!["main".to_string(), "Square".to_string()]);
}

#[test]
fn whole_library_and_referenced_functions_give_the_same_bytes() {
    const LIBRARY: &str = "int UtilDouble(int n) { return n * 2; }\n\
                           int UtilUnused(int n) { return n - 1; }\n\
                           void UtilAlsoUnused() { PrintString(\"never\"); }\n";
    const MAIN: &str = "void main() { PrintInteger(UtilDouble(4)); }";

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("k_inc_util.nss"), LIBRARY).unwrap();
    let main = dir.path().join("main.nss");
    std::fs::write(&main, format!("#include \"k_inc_util\"\n{MAIN}")).unwrap();
    let Compiled::Script(included) = driver::compile_file(&main, GameVariant::K1, &CompileOptions::default()).unwrap()
    else {
        panic!("expected a script");
    };
    assert_eq!(included.libraries, vec!["k_inc_util".to_string()]);

    let pasted = binary(&format!("{LIBRARY}{MAIN}"));
    let filtered = binary(&format!("int UtilDouble(int n) {{ return n * 2; }}\n{MAIN}"));
    assert_eq!(pasted.bytes, included.bytes);
    assert_eq!(filtered.bytes, included.bytes);
    assert_eq!(included.functions, vec!["main".to_string(), "UtilDouble".to_string()]);
}

#[test]
fn batch_list_compiles_then_verifies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one.nss"), COUNTING_LOOP).unwrap();
    std::fs::write(dir.path().join("two.nss"), "int StartingConditional() { return 1; }").unwrap();
    std::fs::write(dir.path().join("list.txt"), "# scripts\none.nss\ntwo.nss\n").unwrap();

    let inputs = nsscomp::paths::read_list_file(&dir.path().join("list.txt")).unwrap();
    let cancel = AtomicBool::new(false);
    let report = batch::run(&inputs, Mode::Compile, &BatchOptions::default(), &cancel).unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(report.files.iter().all(|f| f.status == Status::Ok));

    let binaries = vec![dir.path().join("one.ncs"), dir.path().join("two.ncs")];
    let report = batch::run(&binaries, Mode::Roundtrip, &BatchOptions::default(), &cancel).unwrap();
    assert_eq!(report.succeeded, 2);
}

#[test]
fn corrupt_binary_exit_code() {
    let mut bytes = binary(COUNTING_LOOP).bytes;
    bytes.truncate(bytes.len() - 1);
    let err = driver::decompile(&bytes, GameVariant::K1, None).unwrap_err();
    assert_eq!(err.exit_code(), 30);
}

#[test]
fn oversized_stack_offsets_are_rejected_without_allocating() {
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
    let bytes = encode(&program).unwrap();
    let err = driver::decompile(&bytes, GameVariant::K1, None).unwrap_err();
    assert_eq!(err.exit_code(), 40);

    let popped = Program::new(vec![
        Instruction::jump(Opcode::Jsr, 2),
        Instruction::bare(Opcode::Retn, Qualifier::None),
        Instruction::new(Opcode::MovSp, Qualifier::None, Operand::Offset(i32::MIN)),
        Instruction::bare(Opcode::Retn, Qualifier::None),
    ]);
    let err = driver::roundtrip(&encode(&popped).unwrap(), GameVariant::K1, None).unwrap_err();
    assert_eq!(err.exit_code(), 40);
}
