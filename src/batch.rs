//! Many files through one operation on a worker pool.
//!
//! Inputs are independent; the only shared state is the read-only
//! declaration table, the per-directory include tables and the stop flags.
//! Cancellation and the deadline are checked between files, never inside
//! one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::driver::{self, CompileOptions, Compiled};
use crate::error::ToolError;
use crate::game::GameVariant;
use crate::nss::{DeclarationTable, LibraryTable};
use crate::output::{atomic_write, read, read_text};
use crate::paths::{common_root, has_extension, mirrored_output_path, BINARY_EXT, SOURCE_EXT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Compile,
    Decompile,
    /// Compile, decompile and recompile a source (or decompile and
    /// recompile a binary) in memory; nothing is written.
    Roundtrip,
}

impl Mode {
    /// Extension of the file written for each input, if any.
    fn output_ext(self) -> Option<&'static str> {
        match self {
            Mode::Compile => Some(BINARY_EXT),
            Mode::Decompile => Some(SOURCE_EXT),
            Mode::Roundtrip => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub variant: GameVariant,
    pub compile: CompileOptions,
    /// Directory receiving every output; next to each input when `None`.
    /// Created when missing.
    pub output_dir: Option<PathBuf>,
    /// Outputs keep their path relative to this directory inside
    /// `output_dir`; the deepest directory common to all inputs when `None`.
    pub root: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub keep_going: bool,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Failed,
    Skipped,
}

/// Ordered by precedence: an outside stop outranks a failure stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A file failed without `keep_going`.
    FirstFailure,
    Deadline,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub input: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub status: Status,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub mode: Mode,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    pub files: Vec<FileReport>,
}

impl BatchReport {
    /// 60 when stopped from outside, else the first failure's code in input
    /// order, else 0.
    pub fn exit_code(&self) -> i32 {
        if matches!(self.stopped, Some(StopReason::Cancelled | StopReason::Deadline)) {
            return 60;
        }
        self.files
            .iter()
            .find(|f| f.status == Status::Failed)
            .map_or(0, |f| f.exit_code)
    }

    /// The failure as a [`ToolError`] when the run was stopped from outside.
    pub fn stop_error(&self) -> Option<ToolError> {
        let completed = self.succeeded + self.failed;
        match self.stopped? {
            StopReason::Cancelled => Some(ToolError::Cancelled {
                completed,
                total: self.total,
            }),
            StopReason::Deadline => Some(ToolError::DeadlineExceeded {
                completed,
                total: self.total,
            }),
            StopReason::FirstFailure => None,
        }
    }
}

// ── Runner ───────────────────────────────────────────────────────

/// Where one input's result goes, decided before any work starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Nothing,
    File(PathBuf),
    /// An earlier input already maps to `output`.
    Taken { output: PathBuf, first: PathBuf },
}

/// Map every input to its output. The first input in list order keeps a
/// contested path; names compare case-insensitively.
fn plan_outputs(inputs: &[PathBuf], mode: Mode, options: &BatchOptions) -> Vec<Target> {
    let Some(ext) = mode.output_ext() else {
        return vec![Target::Nothing; inputs.len()];
    };
    let root = options.root.clone().unwrap_or_else(|| common_root(inputs));
    let mut claimed: HashMap<String, &Path> = HashMap::new();
    inputs
        .iter()
        .map(|input| {
            let output = match &options.output_dir {
                Some(dir) => mirrored_output_path(input, &root, dir, ext),
                None => input.with_extension(ext),
            };
            let key = output.to_string_lossy().to_lowercase();
            match claimed.get(&key) {
                Some(first) => Target::Taken {
                    output,
                    first: first.to_path_buf(),
                },
                None => {
                    claimed.insert(key, input);
                    Target::File(output)
                }
            }
        })
        .collect()
}

struct Shared<'a> {
    mode: Mode,
    options: &'a BatchOptions,
    targets: Vec<Target>,
    decls: Arc<DeclarationTable>,
    libraries: HashMap<PathBuf, LibraryTable>,
    cancel: &'a AtomicBool,
    failed: AtomicBool,
}

impl Shared<'_> {
    fn stop_reason(&self) -> Option<StopReason> {
        if self.cancel.load(Ordering::Relaxed) {
            Some(StopReason::Cancelled)
        } else if self.options.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StopReason::Deadline)
        } else if !self.options.keep_going && self.failed.load(Ordering::Relaxed) {
            Some(StopReason::FirstFailure)
        } else {
            None
        }
    }
}

pub fn run(inputs: &[PathBuf], mode: Mode, options: &BatchOptions, cancel: &AtomicBool) -> Result<BatchReport, ToolError> {
    let decls = driver::declarations_for(options.variant, options.compile.declarations.as_ref())?;
    let mut libraries = HashMap::new();
    if mode != Mode::Decompile {
        for input in inputs.iter().filter(|p| mode == Mode::Compile || has_extension(p, SOURCE_EXT)) {
            let dir = parent_dir(input);
            if !libraries.contains_key(&dir) {
                let table = driver::library_table(Some(&dir), &options.compile.include_dirs)?;
                libraries.insert(dir, table);
            }
        }
    }

    if let (Some(dir), Some(_)) = (&options.output_dir, mode.output_ext()) {
        std::fs::create_dir_all(dir).map_err(|e| ToolError::io(dir, e))?;
    }
    let targets = plan_outputs(inputs, mode, options);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.unwrap_or(0))
        .build()
        .map_err(|e| ToolError::Usage(format!("cannot start worker pool: {e}")))?;
    log::info!("{} files on {} workers", inputs.len(), pool.current_num_threads());

    let shared = Shared {
        mode,
        options,
        targets,
        decls,
        libraries,
        cancel,
        failed: AtomicBool::new(false),
    };
    let results: Vec<(FileReport, Option<StopReason>)> =
        pool.install(|| {
            inputs
                .par_iter()
                .zip(shared.targets.par_iter())
                .map(|(input, target)| process(&shared, input, target))
                .collect()
        });

    let mut report = BatchReport {
        mode,
        total: inputs.len(),
        succeeded: 0,
        failed: 0,
        skipped: 0,
        stopped: None,
        files: Vec::with_capacity(results.len()),
    };
    for (file, reason) in results {
        match file.status {
            Status::Ok => report.succeeded += 1,
            Status::Failed => report.failed += 1,
            Status::Skipped => report.skipped += 1,
        }
        if let Some(reason) = reason {
            report.stopped = Some(report.stopped.map_or(reason, |s| s.max(reason)));
        }
        report.files.push(file);
    }
    log::info!(
        "batch done: {} ok, {} failed, {} skipped",
        report.succeeded,
        report.failed,
        report.skipped
    );
    Ok(report)
}

fn parent_dir(input: &Path) -> PathBuf {
    input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn process(shared: &Shared<'_>, input: &Path, target: &Target) -> (FileReport, Option<StopReason>) {
    if let Some(reason) = shared.stop_reason() {
        log::debug!("{}: skipped ({reason:?})", input.display());
        let report = FileReport {
            input: input.to_path_buf(),
            output: None,
            status: Status::Skipped,
            exit_code: 0,
            message: None,
        };
        return (report, Some(reason));
    }

    match transform(shared, input, target) {
        Ok(output) => {
            log::info!("{}: ok", input.display());
            let report = FileReport {
                input: input.to_path_buf(),
                output,
                status: Status::Ok,
                exit_code: 0,
                message: None,
            };
            (report, None)
        }
        Err(e) => {
            log::warn!("{}: {e}", input.display());
            shared.failed.store(true, Ordering::Relaxed);
            let report = FileReport {
                input: input.to_path_buf(),
                output: None,
                status: Status::Failed,
                exit_code: e.exit_code(),
                message: Some(e.to_string()),
            };
            (report, None)
        }
    }
}

/// Read, transform and write one file. Returns where the output went.
fn transform(shared: &Shared<'_>, input: &Path, target: &Target) -> Result<Option<PathBuf>, ToolError> {
    let out = match target {
        Target::Taken { output, first } => {
            return Err(ToolError::OutputCollision {
                output: output.clone(),
                first: first.clone(),
            })
        }
        Target::File(path) => Some(path.as_path()),
        Target::Nothing => None,
    };
    let empty = LibraryTable::new();
    let libraries = shared.libraries.get(&parent_dir(input)).unwrap_or(&empty);
    match shared.mode {
        Mode::Compile => {
            let source = read_text(input)?;
            let name = driver::display_name(input);
            match driver::compile_with(&source, &name, &shared.decls, libraries, &shared.options.compile)? {
                Compiled::Script(binary) => write_to(out, &binary.bytes),
                Compiled::Library(_) => Ok(None),
            }
        }
        Mode::Decompile => {
            let bytes = read(input)?;
            let source = driver::decompile_with(&bytes, &shared.decls)?;
            write_to(out, source.as_bytes())
        }
        Mode::Roundtrip if has_extension(input, SOURCE_EXT) => {
            let source = read_text(input)?;
            let name = driver::display_name(input);
            driver::roundtrip_source_with(&source, &name, &shared.decls, libraries, &shared.options.compile)?;
            Ok(None)
        }
        Mode::Roundtrip => {
            let bytes = read(input)?;
            driver::roundtrip_with(&bytes, &shared.decls)?;
            Ok(None)
        }
    }
}

fn write_to(out: Option<&Path>, data: &[u8]) -> Result<Option<PathBuf>, ToolError> {
    match out {
        Some(path) => {
            atomic_write(path, data)?;
            Ok(Some(path.to_path_buf()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::paths::collect_files;

    fn scripts(dir: &Path) -> Vec<PathBuf> {
        std::fs::write(dir.join("a_bad.nss"), "void main() { int x = ; }").unwrap();
        std::fs::write(dir.join("b.nss"), "void main() { int i = 0; while (i < 3) { i = i + 1; } }").unwrap();
        std::fs::write(dir.join("c.nss"), "int StartingConditional() { return 1; }").unwrap();
        collect_files(dir, false, SOURCE_EXT).unwrap()
    }

    #[test]
    fn keep_going_compiles_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let options = BatchOptions {
            keep_going: true,
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!((report.succeeded, report.failed, report.skipped), (2, 1, 0));
        assert_eq!(report.exit_code(), 10);
        assert!(report.stop_error().is_none());
        assert!(dir.path().join("b.ncs").exists());
        assert!(dir.path().join("c.ncs").exists());
        assert!(!dir.path().join("a_bad.ncs").exists());
    }

    #[test]
    fn first_failure_stops_a_sequential_run() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let options = BatchOptions {
            jobs: Some(1),
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!((report.succeeded, report.failed, report.skipped), (0, 1, 2));
        assert_eq!(report.stopped, Some(StopReason::FirstFailure));
        assert_eq!(report.exit_code(), 10);
    }

    #[test]
    fn cancelled_before_start_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let report = run(&inputs, Mode::Compile, &BatchOptions::default(), &AtomicBool::new(true)).unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(report.stopped, Some(StopReason::Cancelled));
        assert_eq!(report.exit_code(), 60);
        assert!(matches!(report.stop_error(), Some(ToolError::Cancelled { completed: 0, total: 3 })));
    }

    #[test]
    fn passed_deadline_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let options = BatchOptions {
            deadline: Some(Instant::now()),
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.stopped, Some(StopReason::Deadline));
        assert_eq!(report.exit_code(), 60);
    }

    #[test]
    fn decompile_and_roundtrip_into_an_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bins = dir.path().join("bin");
        std::fs::create_dir(&bins).unwrap();
        let mut inputs = scripts(dir.path());
        inputs.retain(|p| !p.ends_with("a_bad.nss"));
        let options = BatchOptions {
            output_dir: Some(bins.clone()),
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.exit_code(), 0);

        let binaries = collect_files(&bins, false, BINARY_EXT).unwrap();
        assert_eq!(binaries.len(), 2);
        let report = run(&binaries, Mode::Roundtrip, &BatchOptions::default(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(report.files.iter().all(|f| f.output.is_none()));

        let report = run(&binaries, Mode::Decompile, &BatchOptions::default(), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(bins.join("b.nss").exists());
    }

    #[test]
    fn missing_output_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = scripts(dir.path());
        inputs.retain(|p| !p.ends_with("a_bad.nss"));
        std::fs::write(dir.path().join("d.nss"), "void main() { }").unwrap();
        inputs.push(dir.path().join("d.nss"));
        let build = dir.path().join("build");
        let options = BatchOptions {
            output_dir: Some(build.clone()),
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.exit_code(), 0);
        assert!(build.is_dir());
        let outputs: Vec<PathBuf> = report.files.iter().filter_map(|f| f.output.clone()).collect();
        assert_eq!(outputs, vec![build.join("b.ncs"), build.join("c.ncs"), build.join("d.ncs")]);
        assert!(outputs.iter().all(|p| p.is_file()));
    }

    #[test]
    fn recursive_inputs_keep_their_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        for sub in ["a", "b"] {
            std::fs::create_dir_all(src.join(sub)).unwrap();
            std::fs::write(src.join(sub).join("x.nss"), "void main() { }").unwrap();
        }
        let inputs = collect_files(&src, true, SOURCE_EXT).unwrap();
        let out = dir.path().join("out");
        let options = BatchOptions {
            output_dir: Some(out.clone()),
            root: Some(src),
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.succeeded, 2);
        assert!(out.join("a").join("x.ncs").is_file());
        assert!(out.join("b").join("x.ncs").is_file());
    }

    #[test]
    fn contested_output_fails_the_later_input() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("x.nss");
        std::fs::write(&script, "void main() { }").unwrap();
        let inputs = vec![script.clone(), script.clone()];
        let options = BatchOptions {
            keep_going: true,
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.files[0].status, Status::Ok);
        assert_eq!(report.files[1].status, Status::Failed);
        assert_eq!(report.exit_code(), 50);
        assert!(report.files[1].message.as_deref().unwrap().contains("already the output of"));
    }

    #[test]
    fn output_dir_that_is_a_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let blocker = dir.path().join("build");
        std::fs::write(&blocker, "").unwrap();
        let options = BatchOptions {
            output_dir: Some(blocker),
            ..BatchOptions::default()
        };
        let err = run(&inputs, Mode::Compile, &options, &AtomicBool::new(false)).unwrap_err();
        assert_eq!(err.exit_code(), 50);
    }

    #[test]
    fn roundtrip_mode_takes_sources() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = scripts(dir.path());
        let options = BatchOptions {
            keep_going: true,
            ..BatchOptions::default()
        };
        let report = run(&inputs, Mode::Roundtrip, &options, &AtomicBool::new(false)).unwrap();
        assert_eq!((report.succeeded, report.failed), (2, 1));
        assert_eq!(report.exit_code(), 10);
        assert!(!dir.path().join("b.ncs").exists());
    }

    #[test]
    fn report_serializes_for_json_output() {
        let report = BatchReport {
            mode: Mode::Roundtrip,
            total: 1,
            succeeded: 0,
            failed: 1,
            skipped: 0,
            stopped: None,
            files: vec![FileReport {
                input: PathBuf::from("x.ncs"),
                output: None,
                status: Status::Failed,
                exit_code: 41,
                message: Some("unstructurable control flow at instruction 9".to_string()),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "roundtrip");
        assert_eq!(json["files"][0]["status"], "failed");
        assert_eq!(json["files"][0]["exit_code"], 41);
        assert!(json.get("stopped").is_none());
    }
}
