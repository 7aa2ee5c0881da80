use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::game::GameVariant;

// ── Tool settings ────────────────────────────────────────────────

/// Contents of `nsscomp.json`. Every field is optional in the file; command
/// line flags take precedence over whatever is stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub game: GameVariant,
    /// Extra include search directories, searched after the input's own
    /// directory. Relative entries are relative to the settings file.
    pub include_dirs: Vec<PathBuf>,
    /// Declaration file used instead of the built-in one.
    pub nwscript: Option<PathBuf>,
    pub optimize: bool,
    /// Worker threads for batch runs; `None` lets the pool decide.
    pub jobs: Option<usize>,
    /// Keep going after a failed file in batch runs.
    pub keep_going: bool,
}

impl Settings {
    /// Rebase relative paths onto `base`.
    fn anchor(mut self, base: &Path) -> Self {
        let rebase = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };
        self.include_dirs = self.include_dirs.into_iter().map(rebase).collect();
        self.nwscript = self.nwscript.map(rebase);
        self
    }
}

/// Load settings from `path`. A missing file yields the defaults; a file
/// that exists but does not parse is a configuration error.
pub fn load_settings(path: &Path) -> Result<Settings, ToolError> {
    if !path.exists() {
        log::debug!("no settings at {}; using defaults", path.display());
        return Ok(Settings::default());
    }
    let text = crate::output::read_text(path)?;
    let settings: Settings = serde_json::from_str(&text).map_err(|e| ToolError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(settings.anchor(base))
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ToolError> {
    crate::output::write_json(path, settings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::paths::config_path(dir.path());
        let settings = Settings {
            game: GameVariant::K2,
            include_dirs: vec![dir.path().join("includes")],
            optimize: true,
            jobs: Some(4),
            ..Settings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings(&dir.path().join("nsscomp.json")).unwrap();
        assert_eq!(loaded, Settings::default());
        assert_eq!(loaded.game, GameVariant::K1);
    }

    #[test]
    fn partial_file_fills_defaults_and_anchors_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsscomp.json");
        std::fs::write(&path, r#"{ "game": "k2", "include_dirs": ["inc"], "nwscript": "/abs/nwscript.nss" }"#)
            .unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.game, GameVariant::K2);
        assert_eq!(loaded.include_dirs, vec![dir.path().join("inc")]);
        assert_eq!(loaded.nwscript, Some(PathBuf::from("/abs/nwscript.nss")));
        assert!(!loaded.keep_going);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsscomp.json");
        std::fs::write(&path, "{ \"game\": \"k3\" }").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(matches!(err, ToolError::Config { .. }));
        assert_eq!(err.exit_code(), 1);
    }
}
