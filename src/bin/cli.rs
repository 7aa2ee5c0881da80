use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde_json::json;

use nsscomp::batch::{self, BatchOptions, BatchReport, Mode};
use nsscomp::driver::{self, CompileOptions, Compiled};
use nsscomp::output::{atomic_write, read};
use nsscomp::paths::{self, output_path, BINARY_EXT, SOURCE_EXT};
use nsscomp::settings::{load_settings, Settings};
use nsscomp::{GameVariant, ToolError};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "nsscomp", about = "NWScript compiler and decompiler", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Game whose engine declarations apply
    #[arg(short, long, global = true, value_enum)]
    game: Option<GameVariant>,

    /// Declaration file to use instead of the built-in one
    #[arg(long, global = true)]
    nwscript: Option<PathBuf>,

    /// Extra include directory (repeatable, searched in order)
    #[arg(short = 'I', long = "include", global = true)]
    include: Vec<PathBuf>,

    /// Log the instruction listing of every compiled unit
    #[arg(long, global = true)]
    debug: bool,

    /// Run the optimizer passes
    #[arg(long, global = true)]
    optimize: bool,

    /// Settings file (default: ./nsscomp.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile one source file
    Compile {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Accept a unit without main/StartingConditional
        #[arg(long)]
        library: bool,
    },
    /// Decompile one binary
    Decompile {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile, decompile and recompile a source file (or decompile and
    /// recompile a binary), requiring identical bytecode
    Roundtrip {
        input: PathBuf,
        /// Also write the decompiled source here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run every file given on the command line
    Files {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run every file named in a list file
    Batch {
        #[arg(long)]
        list: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run every matching file in a directory
    Dir {
        dir: PathBuf,
        #[arg(long)]
        recursive: bool,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value = "compile")]
    mode: BatchMode,
    /// Directory for all outputs (default: next to each input)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Continue after a failed file
    #[arg(long)]
    keep_going: bool,
    /// Worker threads
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Stop starting new files after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BatchMode {
    Compile,
    Decompile,
    Roundtrip,
}

impl From<BatchMode> for Mode {
    fn from(m: BatchMode) -> Self {
        match m {
            BatchMode::Compile => Mode::Compile,
            BatchMode::Decompile => Mode::Decompile,
            BatchMode::Roundtrip => Mode::Roundtrip,
        }
    }
}

// ── Configuration ────────────────────────────────────────────────

struct Resolved {
    variant: GameVariant,
    compile: CompileOptions,
    settings: Settings,
}

/// Settings file first, command line on top.
fn resolve(cli: &Cli) -> Result<Resolved, ToolError> {
    let config = cli
        .config
        .clone()
        .unwrap_or_else(|| paths::config_path(Path::new(".")));
    if cli.config.is_some() && !config.exists() {
        return Err(ToolError::Usage(format!("settings file {} not found", config.display())));
    }
    let settings = load_settings(&config)?;

    let nwscript = cli.nwscript.as_ref().or(settings.nwscript.as_ref());
    let declarations = nwscript.map(|p| driver::load_declarations(p)).transpose()?;
    let mut include_dirs = cli.include.clone();
    include_dirs.extend(settings.include_dirs.iter().cloned());

    Ok(Resolved {
        variant: cli.game.unwrap_or(settings.game),
        compile: CompileOptions {
            declarations,
            include_dirs,
            optimize: cli.optimize || settings.optimize,
            allow_library: false,
            debug: cli.debug,
        },
        settings,
    })
}

fn init_logger(verbose: u8, debug: bool) {
    let level = match (verbose, debug) {
        (_, true) | (2.., _) => "debug",
        (1, _) => "info",
        _ => "warn",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

// ── Commands ─────────────────────────────────────────────────────

enum Outcome {
    Single(serde_json::Value, String),
    Batch(BatchReport),
}

fn run(cli: &Cli) -> Result<Outcome, ToolError> {
    let cfg = resolve(cli)?;
    match &cli.command {
        Commands::Compile { input, output, library } => {
            let options = CompileOptions {
                allow_library: *library,
                ..cfg.compile
            };
            match driver::compile_file(input, cfg.variant, &options)? {
                Compiled::Script(binary) => {
                    let out = output_path(input, output.as_deref(), BINARY_EXT);
                    atomic_write(&out, &binary.bytes)?;
                    let text = format!("{} -> {} ({} bytes)", input.display(), out.display(), binary.bytes.len());
                    let value = json!({
                        "input": input,
                        "output": out,
                        "bytes": binary.bytes.len(),
                        "includes": binary.libraries,
                    });
                    Ok(Outcome::Single(value, text))
                }
                Compiled::Library(summary) => {
                    let text = format!(
                        "{}: library with {} functions, {} globals, {} structs",
                        input.display(),
                        summary.functions.len(),
                        summary.globals.len(),
                        summary.structs.len()
                    );
                    Ok(Outcome::Single(json!({ "input": input, "library": summary }), text))
                }
            }
        }
        Commands::Decompile { input, output } => {
            let bytes = read(input)?;
            let source = driver::decompile(&bytes, cfg.variant, cfg.compile.declarations.as_ref())?;
            let out = output_path(input, output.as_deref(), SOURCE_EXT);
            atomic_write(&out, source.as_bytes())?;
            let text = format!("{} -> {}", input.display(), out.display());
            Ok(Outcome::Single(json!({ "input": input, "output": out }), text))
        }
        Commands::Roundtrip { input, output } => {
            let trip = driver::roundtrip_file(input, cfg.variant, &cfg.compile)?;
            if let Some(out) = output {
                atomic_write(out, trip.source.as_bytes())?;
            }
            let text = format!("{}: identical after round trip ({} bytes)", input.display(), trip.bytes.len());
            Ok(Outcome::Single(json!({ "input": input, "identical": true }), text))
        }
        Commands::Files { inputs, run } => run_batch(inputs, None, run, cfg),
        Commands::Batch { list, run } => {
            let inputs = paths::read_list_file(list).map_err(|e| ToolError::io(list, e))?;
            run_batch(&inputs, None, run, cfg)
        }
        Commands::Dir { dir, recursive, run } => {
            let ext = match run.mode {
                BatchMode::Compile | BatchMode::Roundtrip => SOURCE_EXT,
                BatchMode::Decompile => BINARY_EXT,
            };
            let inputs = paths::collect_files(dir, *recursive, ext).map_err(|e| ToolError::io(dir, e))?;
            run_batch(&inputs, Some(dir), run, cfg)
        }
    }
}

fn run_batch(inputs: &[PathBuf], root: Option<&Path>, args: &RunArgs, cfg: Resolved) -> Result<Outcome, ToolError> {
    let options = BatchOptions {
        variant: cfg.variant,
        compile: cfg.compile,
        output_dir: args.output.clone(),
        root: root.map(Path::to_path_buf),
        jobs: args.jobs.or(cfg.settings.jobs),
        keep_going: args.keep_going || cfg.settings.keep_going,
        deadline: args.timeout.map(|s| Instant::now() + Duration::from_secs(s)),
    };
    let cancel = AtomicBool::new(false);
    let report = batch::run(inputs, args.mode.into(), &options, &cancel)?;
    Ok(Outcome::Batch(report))
}

// ── Output formatting ────────────────────────────────────────────

fn print_report(report: &BatchReport) {
    for file in &report.files {
        if let Some(message) = &file.message {
            eprintln!("{}: {message}", file.input.display());
        }
    }
    println!(
        "{} files: {} ok, {} failed, {} skipped",
        report.total, report.succeeded, report.failed, report.skipped
    );
    if let Some(err) = report.stop_error() {
        eprintln!("error: {err}");
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.debug);

    let code = match run(&cli) {
        Ok(Outcome::Single(value, text)) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            } else {
                println!("{text}");
            }
            0
        }
        Ok(Outcome::Batch(report)) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            } else {
                print_report(&report);
            }
            report.exit_code()
        }
        Err(e) => {
            if cli.json {
                let value = json!({ "error": e.to_string(), "exit_code": e.exit_code() });
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            } else {
                eprintln!("error: {e}");
            }
            e.exit_code()
        }
    };
    process::exit(code);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn loose_files_on_the_command_line() {
        let cli = Cli::try_parse_from(["nsscomp", "files", "a.nss", "b.nss", "--mode", "roundtrip", "-j", "2"]).unwrap();
        let Commands::Files { inputs, run } = cli.command else {
            panic!("expected the files command");
        };
        assert_eq!(inputs, vec![PathBuf::from("a.nss"), PathBuf::from("b.nss")]);
        assert!(matches!(run.mode, BatchMode::Roundtrip));
        assert_eq!(run.jobs, Some(2));

        assert!(Cli::try_parse_from(["nsscomp", "files"]).is_err());
    }

    #[test]
    fn roundtrip_accepts_a_source_file() {
        let cli = Cli::try_parse_from(["nsscomp", "roundtrip", "script.nss", "-g", "k2"]).unwrap();
        assert!(matches!(cli.command, Commands::Roundtrip { ref input, .. } if input == Path::new("script.nss")));
        assert_eq!(cli.game, Some(GameVariant::K2));
    }
}
