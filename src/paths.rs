//! File names, extensions and path helpers.
//!
//! No other module should hard-code these strings.

use std::io;
use std::path::{Path, PathBuf};

// ── Extensions & leaf names ──────────────────────────────────────

pub const SOURCE_EXT: &str = "nss";
pub const BINARY_EXT: &str = "ncs";
pub const CONFIG_FILE: &str = "nsscomp.json";
/// Include name of the engine declaration file every unit sees.
pub const CORE_LIBRARY: &str = "nwscript";

// ── Name normalization ───────────────────────────────────────────

/// Include names compare case-insensitively and without the `.nss` suffix.
pub fn normalize_include_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    match lower.strip_suffix(".nss") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

// ── Output locations ─────────────────────────────────────────────

/// Where the result for `input` goes: `explicit` when given, otherwise the
/// input path with its extension swapped to `ext`. A directory `explicit`
/// receives a file named after the input.
pub fn output_path(input: &Path, explicit: Option<&Path>, ext: &str) -> PathBuf {
    match explicit {
        Some(out) if out.is_dir() => {
            let name = input.file_stem().unwrap_or_default();
            out.join(name).with_extension(ext)
        }
        Some(out) => out.to_path_buf(),
        None => input.with_extension(ext),
    }
}

/// Output for `input` inside `out_dir`, keeping the input's place relative
/// to `root`. Inputs outside `root` land directly in `out_dir`.
pub fn mirrored_output_path(input: &Path, root: &Path, out_dir: &Path, ext: &str) -> PathBuf {
    let relative = input
        .strip_prefix(root)
        .ok()
        .filter(|r| !r.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from(input.file_name().unwrap_or_default()), Path::to_path_buf);
    out_dir.join(relative).with_extension(ext)
}

/// Deepest directory containing every path; empty when they share none.
pub fn common_root(paths: &[PathBuf]) -> PathBuf {
    let mut root = match paths.first().and_then(|p| p.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => return PathBuf::new(),
    };
    for path in paths.iter().skip(1) {
        while !path.starts_with(&root) {
            match root.parent() {
                Some(up) => root = up.to_path_buf(),
                None => return PathBuf::new(),
            }
        }
    }
    root
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Every file under `dir` with extension `ext`, sorted so batch output is
/// stable.
pub fn collect_files(dir: &Path, recursive: bool, ext: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if has_extension(&path, ext) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Parse a batch list file: one path per line, `#` comments and blank lines
/// skipped, relative paths resolved against the list's directory.
pub fn read_list_file(list: &Path) -> io::Result<Vec<PathBuf>> {
    let text = std::fs::read_to_string(list)?;
    let base = list.parent().unwrap_or_else(|| Path::new("."));
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            let p = Path::new(l);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn include_names_normalize() {
        assert_eq!(normalize_include_name("K_Inc_Debug.NSS"), "k_inc_debug");
        assert_eq!(normalize_include_name(" nwscript "), "nwscript");
    }

    #[test]
    fn output_path_swaps_extension() {
        let p = output_path(Path::new("/a/b/script.nss"), None, BINARY_EXT);
        assert_eq!(p, PathBuf::from("/a/b/script.ncs"));
        let p = output_path(Path::new("x.ncs"), Some(Path::new("y.nss")), SOURCE_EXT);
        assert_eq!(p, PathBuf::from("y.nss"));
    }

    #[test]
    fn mirrored_outputs_keep_subdirectories() {
        let root = Path::new("/src");
        let out = Path::new("/build");
        assert_eq!(
            mirrored_output_path(Path::new("/src/a/x.nss"), root, out, BINARY_EXT),
            PathBuf::from("/build/a/x.ncs")
        );
        assert_eq!(
            mirrored_output_path(Path::new("/src/b/x.nss"), root, out, BINARY_EXT),
            PathBuf::from("/build/b/x.ncs")
        );
        assert_eq!(
            mirrored_output_path(Path::new("/elsewhere/y.nss"), root, out, BINARY_EXT),
            PathBuf::from("/build/y.ncs")
        );
    }

    #[test]
    fn common_root_of_inputs() {
        let paths = vec![PathBuf::from("/src/a/x.nss"), PathBuf::from("/src/b/c/y.nss")];
        assert_eq!(common_root(&paths), PathBuf::from("/src"));
        assert_eq!(common_root(&[PathBuf::from("/src/a/x.nss")]), PathBuf::from("/src/a"));
        assert_eq!(common_root(&[PathBuf::from("a.nss"), PathBuf::from("/b.nss")]), PathBuf::new());
        assert_eq!(common_root(&[]), PathBuf::new());
    }

    #[test]
    fn collect_files_filters_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.nss"), "").unwrap();
        std::fs::write(dir.path().join("b.NSS"), "").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("d.nss"), "").unwrap();

        let flat = collect_files(dir.path(), false, SOURCE_EXT).unwrap();
        assert_eq!(flat.len(), 2);
        let deep = collect_files(dir.path(), true, SOURCE_EXT).unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[test]
    fn list_file_resolves_relative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("files.txt");
        std::fs::write(&list, "# scripts\na.nss\n\n/abs/b.nss\n").unwrap();
        let entries = read_list_file(&list).unwrap();
        assert_eq!(entries, vec![dir.path().join("a.nss"), PathBuf::from("/abs/b.nss")]);
    }
}
