//! On-disk session state under the operator's home directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;

pub const STATE_DIR_NAME: &str = ".minecraft-scanner";

/// `~/.minecraft-scanner/` with its `logs/`, `exports/`, and `cache/`
/// subdirectories. Failing to create any of these is a startup environment
/// error, not something to limp past.
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn create() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("could not determine home directory"))?;
        Self::at(home.join(STATE_DIR_NAME))
    }

    pub fn at(root: PathBuf) -> Result<Self> {
        let dir = Self { root };
        for path in [
            dir.root.clone(),
            dir.logs_dir(),
            dir.exports_dir(),
            dir.cache_dir(),
        ] {
            fs::create_dir_all(&path)
                .wrap_err_with(|| format!("creating {}", path.display()))?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join("session-stats.json")
    }

    /// A fresh timestamped path under `exports/` for the shutdown summary.
    pub fn summary_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        self.exports_dir().join(format!("session-summary-{stamp}.json"))
    }
}

/// Write JSON through a temp file and rename so a crash mid-write cannot
/// leave a half-document behind.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, serde_json::to_string_pretty(value)?)
        .wrap_err_with(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
