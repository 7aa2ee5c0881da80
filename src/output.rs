//! Writing results to disk.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ToolError;

/// Per-file mutex map; two batch entries can name the same output. An entry
/// lives only while some writer holds or waits on it.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Write `data` to a `.tmp` sibling, fsync it, then rename it over `path`.
/// A reader never sees a half-written binary.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ToolError> {
    let lock = Arc::clone(
        FILE_LOCKS
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(()))),
    );
    let result = {
        let _guard = lock.lock();
        replace_file(path, data)
    };
    release(path, &lock);
    result
}

/// Drop the map entry for `path` unless another writer still holds a clone.
fn release(path: &Path, lock: &Arc<Mutex<()>>) {
    let mut locks = FILE_LOCKS.lock();
    // the map and the caller
    if Arc::strong_count(lock) == 2 {
        locks.remove(path);
    }
}

fn replace_file(path: &Path, data: &[u8]) -> Result<(), ToolError> {
    let mut tmp_name = OsString::from(path.file_name().unwrap_or_default());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let io = |e| ToolError::io(path, e);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let mut file = fs::File::create(&tmp_path).map_err(io)?;
    file.write_all(data).map_err(io)?;
    file.sync_all().map_err(io)?;
    drop(file);
    fs::rename(&tmp_path, path).map_err(io)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ToolError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| ToolError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    atomic_write(path, json.as_bytes())
}

pub fn read(path: &Path) -> Result<Vec<u8>, ToolError> {
    fs::read(path).map_err(|e| ToolError::io(path, e))
}

pub fn read_text(path: &Path) -> Result<String, ToolError> {
    fs::read_to_string(path).map_err(|e| ToolError::io(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("a.ncs");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("out").join("a.ncs.tmp").exists());
    }

    #[test]
    fn locks_are_released_after_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..50).map(|n| dir.path().join(format!("s{n}.ncs"))).collect();
        paths.par_iter().for_each(|p| atomic_write(p, b"x").unwrap());

        let shared = dir.path().join("shared.ncs");
        (0..16u8).into_par_iter().for_each(|n| atomic_write(&shared, &[n]).unwrap());

        let locks = FILE_LOCKS.lock();
        assert!(paths.iter().all(|p| !locks.contains_key(p)));
        assert!(!locks.contains_key(&shared));
        drop(locks);
        assert_eq!(fs::read(&shared).unwrap().len(), 1);
    }

    #[test]
    fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(&dir.path().join("nope.ncs")).unwrap_err();
        assert_eq!(err.exit_code(), 50);
    }
}
