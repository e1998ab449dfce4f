use std::{fs, path::Path, time::Duration};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::exclude;

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct Config {
    /// The TCP port probed on every candidate.
    pub port: u16,

    /// Per-probe deadline in milliseconds, covering connect and read.
    pub timeout: u64,

    /// Attempts per address before it lands on the blacklist.
    pub max_retries: u32,

    /// Candidates drawn from the generator per dispatch cycle.
    pub batch_size: usize,

    /// Upper bound on in-flight probes.
    pub max_concurrent: usize,

    /// Stop after this many probes. None scans until stopped.
    pub max_scans: Option<u64>,

    pub scan_mode: ScanMode,

    /// CIDRs the generator draws from in the range and targeted modes.
    pub ip_ranges: Vec<String>,

    /// CIDRs never probed in any mode.
    pub exclude_ranges: Vec<String>,

    /// The text catalog path. The JSON and CSV catalogs sit next to it.
    pub output_file: String,

    pub export_formats: Vec<ExportFormat>,

    pub log_level: LogLevel,

    /// None admits every version; otherwise a server's version string must
    /// equal one of the entries.
    pub version_filter: Option<Vec<String>>,

    pub min_players: i64,
    pub max_players: i64,

    /// Resolve PTR records for discovered servers to guess a country.
    pub enable_geolocation: bool,

    /// Milliseconds between progress autosaves.
    pub save_interval: u64,

    /// Milliseconds between dashboard refreshes. The scanner itself does
    /// not render; this is read by whatever does.
    pub stats_interval: u64,

    /// Milliseconds between maintenance cycles.
    pub gc_interval: u64,

    /// Send the handshake with its outer VarInt length prefix. Off by
    /// default; the bare form is what servers overwhelmingly accept.
    pub framed_handshake: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 25565,
            timeout: 2500,
            max_retries: 2,
            batch_size: 100,
            max_concurrent: 500,
            max_scans: None,
            scan_mode: ScanMode::SmartRandom,
            ip_ranges: Vec::new(),
            exclude_ranges: exclude::default_exclude_ranges(),
            output_file: "discovered-servers.txt".to_string(),
            export_formats: vec![ExportFormat::Txt, ExportFormat::Json],
            log_level: LogLevel::Info,
            version_filter: None,
            min_players: 0,
            max_players: 1_000_000,
            enable_geolocation: true,
            save_interval: 30_000,
            stats_interval: 1_000,
            gc_interval: 300_000,
            framed_handshake: false,
        }
    }
}

impl Config {
    /// Load the config, or write the defaults out for the operator to edit
    /// when no file exists yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&contents)
                .wrap_err_with(|| format!("parsing config {}", path.display()))
        } else {
            let config = Self::default();
            fs::write(path, serde_json::to_string_pretty(&config)?)
                .wrap_err_with(|| format!("writing default config {}", path.display()))?;
            Ok(config)
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn autosave_every(&self) -> Duration {
        Duration::from_millis(self.save_interval)
    }

    pub fn maintenance_every(&self) -> Duration {
        Duration::from_millis(self.gc_interval)
    }

    pub fn exports(&self, format: ExportFormat) -> bool {
        self.export_formats.contains(&format)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Mix of uniform, cluster, and popular-range draws.
    SmartRandom,
    /// Uniform draws over the public address space.
    Random,
    /// Uniform draws over the configured ipRanges.
    Range,
    /// Enumerate the configured ipRanges once, then stop.
    Targeted,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Txt,
    Json,
    Csv,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}
