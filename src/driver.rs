//! Single-unit operations: compile, decompile, round trip.
//!
//! Each function is pure apart from the explicitly named file helpers; the
//! batch runner calls these from worker threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::decompiler;
use crate::error::ToolError;
use crate::game::GameVariant;
use crate::ncs::{self, disasm, optimize::Pipeline, Program};
use crate::output::{read, read_text};
use crate::paths::{has_extension, SOURCE_EXT};
use crate::nss::{
    compile as generate, declarations, parse_source, resolve, type_check, CompileError, CompiledUnit,
    DeclarationCache, DeclarationTable, LibraryTable, LibrarySummary,
};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Replaces the built-in declarations for the selected game.
    pub declarations: Option<Arc<DeclarationTable>>,
    pub include_dirs: Vec<PathBuf>,
    pub optimize: bool,
    /// Accept a unit without an entry point and report what it declares.
    pub allow_library: bool,
    /// Log the instruction listing at `debug` level.
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledBinary {
    pub bytes: Vec<u8>,
    pub program: Program,
    pub conditional: bool,
    pub functions: Vec<String>,
    /// Includes that were loaded, in load order.
    pub libraries: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Compiled {
    Script(CompiledBinary),
    Library(LibrarySummary),
}

#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub source: String,
    pub bytes: Vec<u8>,
}

// ── Declarations & libraries ─────────────────────────────────────

/// Parse a declaration file to use instead of the built-in table.
pub fn load_declarations(path: &Path) -> Result<Arc<DeclarationTable>, ToolError> {
    let (source, table) = declarations::load_file(path).map_err(|e| ToolError::io(path, e))?;
    table.map(Arc::new).map_err(|errs| ToolError::Declarations {
        path: path.to_path_buf(),
        message: first_message(&errs, &source),
    })
}

/// The override when given, else the shared built-in table for `variant`.
pub fn declarations_for(
    variant: GameVariant,
    override_table: Option<&Arc<DeclarationTable>>,
) -> Result<Arc<DeclarationTable>, ToolError> {
    DeclarationCache::resolve(variant, override_table).map_err(|errs| ToolError::Declarations {
        path: PathBuf::from(format!("<built-in {variant}>")),
        message: first_message(&errs, variant.builtin_declarations()),
    })
}

fn first_message(errs: &[CompileError], source: &str) -> String {
    errs.first()
        .map(|e| e.format_with_source(source))
        .unwrap_or_else(|| "no declarations".to_string())
}

/// Includes visible to a unit in `input_dir`: that directory first, then
/// `include_dirs` in order.
pub fn library_table(input_dir: Option<&Path>, include_dirs: &[PathBuf]) -> Result<LibraryTable, ToolError> {
    let mut table = LibraryTable::new();
    for dir in input_dir.into_iter().chain(include_dirs.iter().map(PathBuf::as_path)) {
        table.add_dir(dir).map_err(|e| ToolError::io(dir, e))?;
    }
    Ok(table)
}

// ── Compile ──────────────────────────────────────────────────────

pub fn compile(source: &str, variant: GameVariant, options: &CompileOptions) -> Result<Compiled, ToolError> {
    let decls = declarations_for(variant, options.declarations.as_ref())?;
    let libraries = library_table(None, &options.include_dirs)?;
    compile_with(source, "<source>", &decls, &libraries, options)
}

/// Compile with a prepared declaration and library table. `name` labels
/// diagnostics for the main unit.
pub fn compile_with(
    source: &str,
    name: &str,
    decls: &DeclarationTable,
    libraries: &LibraryTable,
    options: &CompileOptions,
) -> Result<Compiled, ToolError> {
    let located = |e: &CompileError| {
        let text = e.file.as_deref().and_then(|f| libraries.get(f)).unwrap_or(source);
        ToolError::compile(e, name, text)
    };

    let script = parse_source(source).map_err(|errs| {
        if errs.len() > 1 {
            log::info!("{name}: {} further errors suppressed", errs.len() - 1);
        }
        errs.first()
            .map(located)
            .unwrap_or_else(|| ToolError::Usage(format!("{name}: unreadable source")))
    })?;
    let unit = resolve(script, libraries).map_err(|e| located(&e))?;
    let libraries_loaded: Vec<String> = unit.loaded_libraries().into_iter().map(str::to_string).collect();
    log::info!("{name}: {} includes loaded", libraries_loaded.len());
    let typed = type_check(&unit, decls).map_err(|e| located(&e))?;

    let compiled = match generate(&typed, options.allow_library).map_err(|e| located(&e))? {
        CompiledUnit::Library(summary) => return Ok(Compiled::Library(summary)),
        CompiledUnit::Script(s) => s,
    };
    let program = if options.optimize {
        Pipeline::standard().run(compiled.program)
    } else {
        compiled.program
    };
    if options.debug {
        log::debug!("{name}:\n{}", disasm::listing(&program));
    }
    let bytes = ncs::encode(&program)?;
    Ok(Compiled::Script(CompiledBinary {
        bytes,
        program,
        conditional: compiled.conditional,
        functions: compiled.functions,
        libraries: libraries_loaded,
    }))
}

/// Read, compile and report a file; its own directory is searched for
/// includes before `options.include_dirs`.
pub fn compile_file(path: &Path, variant: GameVariant, options: &CompileOptions) -> Result<Compiled, ToolError> {
    let source = read_text(path)?;
    let decls = declarations_for(variant, options.declarations.as_ref())?;
    let libraries = library_table(path.parent(), &options.include_dirs)?;
    compile_with(&source, &display_name(path), &decls, &libraries, options)
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

// ── Decompile ────────────────────────────────────────────────────

pub fn decompile(
    bytes: &[u8],
    variant: GameVariant,
    override_table: Option<&Arc<DeclarationTable>>,
) -> Result<String, ToolError> {
    let decls = declarations_for(variant, override_table)?;
    decompile_with(bytes, &decls)
}

pub fn decompile_with(bytes: &[u8], decls: &DeclarationTable) -> Result<String, ToolError> {
    let program = ncs::decode(bytes)?;
    log::debug!("decoded {} instructions", program.len());
    Ok(decompiler::decompile_to_source(&program, decls)?)
}

// ── Round trip ───────────────────────────────────────────────────

/// Decompile `bytes`, recompile the text without optimization and require
/// the identical instruction list back.
pub fn roundtrip(
    bytes: &[u8],
    variant: GameVariant,
    override_table: Option<&Arc<DeclarationTable>>,
) -> Result<RoundTrip, ToolError> {
    let decls = declarations_for(variant, override_table)?;
    roundtrip_with(bytes, &decls)
}

pub fn roundtrip_with(bytes: &[u8], decls: &DeclarationTable) -> Result<RoundTrip, ToolError> {
    let original = ncs::decode(bytes)?;
    verify(&original, decls, false)
}

/// Compile `source`, decompile the result, recompile that text and require
/// both binaries to match. The recompile sees no includes: everything the
/// first compile loaded is already in the decompiled text.
pub fn roundtrip_source_with(
    source: &str,
    name: &str,
    decls: &DeclarationTable,
    libraries: &LibraryTable,
    options: &CompileOptions,
) -> Result<RoundTrip, ToolError> {
    let options = CompileOptions {
        allow_library: false,
        ..options.clone()
    };
    let first = match compile_with(source, name, decls, libraries, &options)? {
        Compiled::Script(binary) => binary,
        Compiled::Library(_) => return Err(ToolError::Usage(format!("{name}: nothing to round trip"))),
    };
    verify(&first.program, decls, options.optimize)
}

/// Round trip a file: source files take the compile-first path with the
/// file's directory searched for includes, anything else is read as a
/// binary.
pub fn roundtrip_file(path: &Path, variant: GameVariant, options: &CompileOptions) -> Result<RoundTrip, ToolError> {
    let decls = declarations_for(variant, options.declarations.as_ref())?;
    if has_extension(path, SOURCE_EXT) {
        let source = read_text(path)?;
        let libraries = library_table(path.parent(), &options.include_dirs)?;
        roundtrip_source_with(&source, &display_name(path), &decls, &libraries, options)
    } else {
        roundtrip_with(&read(path)?, &decls)
    }
}

fn verify(original: &Program, decls: &DeclarationTable, optimize: bool) -> Result<RoundTrip, ToolError> {
    let source = decompiler::decompile_to_source(original, decls)?;
    let options = CompileOptions {
        optimize,
        ..CompileOptions::default()
    };
    let recompiled = match compile_with(&source, "<decompiled>", decls, &LibraryTable::new(), &options)? {
        Compiled::Script(binary) => binary,
        Compiled::Library(_) => return Err(ToolError::RoundTripMismatch { index: 0 }),
    };
    if let Some(index) = first_difference(original, &recompiled.program) {
        log::debug!("round trip diverges at {index}; decompiled text:\n{source}");
        return Err(ToolError::RoundTripMismatch { index });
    }
    Ok(RoundTrip {
        source,
        bytes: recompiled.bytes,
    })
}

/// Index of the first instruction that differs, or the shorter length when
/// one program is a prefix of the other.
pub fn first_difference(a: &Program, b: &Program) -> Option<usize> {
    a.iter()
        .zip(b.iter())
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ncs::codec::MAGIC;
    use crate::ncs::{Instruction, Opcode, Qualifier};
    use pretty_assertions::assert_eq;

    const LOOP: &str = "void main() { int i = 0; while (i < 3) { i = i + 1; } }";

    fn script(compiled: Compiled) -> CompiledBinary {
        match compiled {
            Compiled::Script(b) => b,
            Compiled::Library(_) => panic!("expected a script"),
        }
    }

    #[test]
    fn compile_produces_a_framed_binary() {
        let out = script(compile(LOOP, GameVariant::K1, &CompileOptions::default()).unwrap());
        assert!(out.bytes.starts_with(MAGIC));
        assert!(!out.conditional);
        assert_eq!(out.functions, vec!["main".to_string()]);
    }

    #[test]
    fn compilation_is_deterministic() {
        let a = script(compile(LOOP, GameVariant::K1, &CompileOptions::default()).unwrap());
        let b = script(compile(LOOP, GameVariant::K2, &CompileOptions::default()).unwrap());
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn missing_entry_point_unless_library() {
        let src = "int Helper() { return 1; }";
        let err = compile(src, GameVariant::K1, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 21);

        let options = CompileOptions {
            allow_library: true,
            ..CompileOptions::default()
        };
        match compile(src, GameVariant::K1, &options).unwrap() {
            Compiled::Library(summary) => assert_eq!(summary.functions, vec!["Helper".to_string()]),
            Compiled::Script(_) => panic!("expected a library"),
        }
    }

    #[test]
    fn errors_carry_location_and_class() {
        let err = compile("void main() { int x = ; }", GameVariant::K1, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert!(err.to_string().starts_with("<source>: [parse] line 1:"), "{err}");

        let err = compile("void main() { y = 1; }", GameVariant::K1, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 20);

        let err = compile(r#"void main() { PrintString("\q"); }"#, GameVariant::K1, &CompileOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert!(err.to_string().contains("unknown escape"), "{err}");
    }

    #[test]
    fn unused_include_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k_inc_unused.nss"), "int Unused() { return 2; }").unwrap();
        std::fs::write(dir.path().join("k_inc_used.nss"), "int Used() { return 3; }").unwrap();

        let plain = script(compile(LOOP, GameVariant::K1, &CompileOptions::default()).unwrap());
        let with_include = format!("#include \"k_inc_unused\"\n{LOOP}");
        let path = dir.path().join("a.nss");
        std::fs::write(&path, &with_include).unwrap();
        let included = script(compile_file(&path, GameVariant::K1, &CompileOptions::default()).unwrap());
        assert!(included.libraries.is_empty());
        assert_eq!(included.bytes, plain.bytes);

        let path = dir.path().join("b.nss");
        std::fs::write(&path, "#include \"k_inc_used\"\nvoid main() { int n = Used(); }").unwrap();
        let used = script(compile_file(&path, GameVariant::K1, &CompileOptions::default()).unwrap());
        assert_eq!(used.libraries, vec!["k_inc_used".to_string()]);
    }

    #[test]
    fn include_errors_point_into_the_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k_inc_bad.nss"), "int Bad() { return \"s\"; }").unwrap();
        let path = dir.path().join("main.nss");
        std::fs::write(&path, "#include \"k_inc_bad\"\nvoid main() { int n = Bad(); }").unwrap();
        let err = compile_file(&path, GameVariant::K1, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 20);
        assert!(err.to_string().starts_with("k_inc_bad: "), "{err}");
    }

    #[test]
    fn optimizer_is_opt_in() {
        let src = "void main() { int a = 1; { int b = 2; } }";
        let plain = script(compile(src, GameVariant::K1, &CompileOptions::default()).unwrap());
        let options = CompileOptions {
            optimize: true,
            ..CompileOptions::default()
        };
        let optimized = script(compile(src, GameVariant::K1, &options).unwrap());
        assert!(optimized.program.len() <= plain.program.len());
    }

    #[test]
    fn decompile_then_roundtrip() {
        let bin = script(compile(LOOP, GameVariant::K1, &CompileOptions::default()).unwrap());
        let text = decompile(&bin.bytes, GameVariant::K1, None).unwrap();
        assert!(text.contains("void main()"), "{text}");
        let trip = roundtrip(&bin.bytes, GameVariant::K1, None).unwrap();
        assert_eq!(trip.bytes, bin.bytes);
        assert_eq!(trip.source, text);
    }

    #[test]
    fn roundtrip_from_source() {
        let decls = declarations_for(GameVariant::K1, None).unwrap();
        let options = CompileOptions::default();
        let trip = roundtrip_source_with(LOOP, "loop.nss", &decls, &LibraryTable::new(), &options).unwrap();
        let bin = script(compile(LOOP, GameVariant::K1, &options).unwrap());
        assert_eq!(trip.bytes, bin.bytes);
        assert!(trip.source.contains("while ("), "{}", trip.source);

        let err = roundtrip_source_with("void main() { int x = ; }", "bad.nss", &decls, &LibraryTable::new(), &options)
            .unwrap_err();
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn roundtrip_file_picks_the_flow_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k_inc_math.nss"), "int Square(int n) { return n * n; }").unwrap();
        let source = dir.path().join("main.nss");
        std::fs::write(&source, "#include \"k_inc_math\"\nvoid main() { PrintInteger(Square(3)); }").unwrap();
        let options = CompileOptions::default();
        let from_source = roundtrip_file(&source, GameVariant::K1, &options).unwrap();
        assert!(from_source.source.contains("sub1("), "{}", from_source.source);

        let binary = dir.path().join("main.ncs");
        std::fs::write(&binary, &from_source.bytes).unwrap();
        let from_binary = roundtrip_file(&binary, GameVariant::K1, &options).unwrap();
        assert_eq!(from_binary.bytes, from_source.bytes);
    }

    #[test]
    fn sequel_routines_only_exist_in_the_sequel_table() {
        let src = "void main() { int n = GetInfluence(NPC_KREIA); SetInfluence(NPC_KREIA, n + 5); }";
        let k2 = script(compile(src, GameVariant::K2, &CompileOptions::default()).unwrap());
        let text = decompile(&k2.bytes, GameVariant::K2, None).unwrap();
        assert!(text.contains("GetInfluence("));
        assert!(text.contains("SetInfluence("));

        let err = compile(src, GameVariant::K1, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 20);
        let err = compile("void main() { GetInfluence(2); }", GameVariant::K1, &CompileOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 20);
        assert!(err.to_string().contains("GetInfluence"));

        // routine 795 is past the end of the first game's table
        let err = decompile(&k2.bytes, GameVariant::K1, None).unwrap_err();
        assert_eq!(err.exit_code(), 42);
    }

    #[test]
    fn corrupt_input_is_a_codec_error() {
        let err = decompile(b"NCS V1.0\x42\x00\x00", GameVariant::K1, None).unwrap_err();
        assert_eq!(err.exit_code(), 30);
    }

    #[test]
    fn override_declarations_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nwscript.nss");
        std::fs::write(&path, "void Speak(string s);\n").unwrap();
        let table = load_declarations(&path).unwrap();
        let options = CompileOptions {
            declarations: Some(table),
            ..CompileOptions::default()
        };
        assert!(compile("void main() { Speak(\"hi\"); }", GameVariant::K1, &options).is_ok());
        let err = compile("void main() { PrintString(\"hi\"); }", GameVariant::K1, &options).unwrap_err();
        assert_eq!(err.exit_code(), 20);

        std::fs::write(&path, "void Speak(string s)\n").unwrap();
        assert_eq!(load_declarations(&path).unwrap_err().exit_code(), 1);
    }

    #[test]
    fn first_difference_finds_divergence() {
        let nop = || Instruction::bare(Opcode::Nop, Qualifier::None);
        let retn = || Instruction::bare(Opcode::Retn, Qualifier::None);
        let a = Program::new(vec![nop(), retn()]);
        let b = Program::new(vec![nop(), nop()]);
        let c = Program::new(vec![nop()]);
        assert_eq!(first_difference(&a, &a), None);
        assert_eq!(first_difference(&a, &b), Some(1));
        assert_eq!(first_difference(&a, &c), Some(1));
    }
}
