//! The append-only catalog of discovered servers.
//!
//! The text catalog is the durable record and the dedup oracle: the seen-set
//! is rebuilt from it at startup, so a server found in an earlier session is
//! never written twice. The JSON and CSV catalogs are derived views.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use eyre::{Result, WrapErr};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::processing::EnrichedServer;

/// Seen-set size that triggers a trim.
pub const SEEN_TRIM_THRESHOLD: usize = 1_000_000;

/// How many of the most recent insertions a trim keeps.
pub const SEEN_TRIM_KEEP: usize = 500_000;

/// MOTDs are cut to this many characters in the text catalog.
const MOTD_FIELD_MAX: usize = 50;

const CSV_HEADER: &str = "ip,version,players,motd,country,quality,timestamp";

/// Addresses already persisted, in insertion order so the oldest half can be
/// dropped when the set grows too large.
#[derive(Debug, Default)]
pub struct SeenSet {
    set: FxHashSet<Ipv4Addr>,
    order: VecDeque<Ipv4Addr>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.set.contains(&addr)
    }

    /// Returns false if the address was already present.
    pub fn insert(&mut self, addr: Ipv4Addr) -> bool {
        if !self.set.insert(addr) {
            return false;
        }
        self.order.push_back(addr);
        true
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Drop the oldest entries once past the threshold, keeping the most
    /// recent [`SEEN_TRIM_KEEP`]. Returns how many were removed.
    pub fn trim(&mut self) -> usize {
        if self.len() <= SEEN_TRIM_THRESHOLD {
            return 0;
        }
        let mut removed = 0;
        while self.order.len() > SEEN_TRIM_KEEP {
            if let Some(addr) = self.order.pop_front() {
                self.set.remove(&addr);
                removed += 1;
            }
        }
        removed
    }
}

pub enum AppendOutcome {
    Written,
    Duplicate,
}

pub struct Catalog {
    text_path: PathBuf,
    text_file: File,
    json_path: Option<PathBuf>,
    csv_file: Option<File>,
    pub seen: SeenSet,
    /// Every known server, seeded from the JSON catalog at startup and
    /// cumulative across sessions; each append rewrites the file from it.
    servers: Vec<EnrichedServer>,
}

impl Catalog {
    /// Open the catalog files for appending, seeding the seen-set from the
    /// text catalog and the server list from the JSON catalog left by
    /// earlier sessions.
    pub fn open(
        text_path: PathBuf,
        json_path: Option<PathBuf>,
        csv_path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut seen = SeenSet::new();
        if text_path.exists() {
            seed_seen_set(&text_path, &mut seen)
                .wrap_err_with(|| format!("reading catalog {}", text_path.display()))?;
            debug!("seeded {} addresses from {}", seen.len(), text_path.display());
        }

        // the JSON catalog is cumulative; read it back so the first rewrite
        // this session does not throw away earlier discoveries
        let servers = match &json_path {
            Some(path) if path.exists() => match read_json_catalog(path) {
                Ok(servers) => servers,
                Err(err) => {
                    warn!("could not read back {}: {err:#}", path.display());
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        let text_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&text_path)
            .wrap_err_with(|| format!("opening catalog {}", text_path.display()))?;

        let csv_file = match &csv_path {
            Some(path) => {
                let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                if fresh {
                    writeln!(file, "{CSV_HEADER}")?;
                }
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            text_path,
            text_file,
            json_path,
            csv_file,
            seen,
            servers,
        })
    }

    /// Append a discovery to every enabled catalog. The seen-set is updated
    /// last so a failed write leaves the address eligible for a retry.
    pub fn append(&mut self, server: &EnrichedServer) -> Result<AppendOutcome> {
        if self.seen.contains(server.ip) {
            return Ok(AppendOutcome::Duplicate);
        }

        writeln!(self.text_file, "{}", text_record(server))
            .wrap_err_with(|| format!("appending to {}", self.text_path.display()))?;
        self.text_file.flush()?;

        if let Some(csv_file) = &mut self.csv_file {
            writeln!(csv_file, "{}", csv_record(server))?;
            csv_file.flush()?;
        }

        self.servers.push(server.clone());
        if let Some(json_path) = &self.json_path {
            if let Err(err) = write_json_catalog(json_path, &self.servers) {
                // keep the in-memory list matching the file that actually
                // exists, or the retry would record the server twice
                self.servers.pop();
                return Err(err);
            }
        }

        self.seen.insert(server.ip);
        Ok(AppendOutcome::Written)
    }

    pub fn trim_seen(&mut self) -> usize {
        let removed = self.seen.trim();
        if removed > 0 {
            warn!("trimmed {removed} oldest entries from the seen-set");
        }
        removed
    }

    pub fn known_servers(&self) -> &[EnrichedServer] {
        &self.servers
    }
}

fn seed_seen_set(path: &Path, seen: &mut SeenSet) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        let Some(field) = line.split('|').next() else {
            continue;
        };
        if let Ok(addr) = field.trim().parse::<Ipv4Addr>() {
            seen.insert(addr);
        }
    }
    Ok(())
}

/// One pipe-delimited line: ip, version, players, motd, country, quality,
/// timestamp.
fn text_record(server: &EnrichedServer) -> String {
    format!(
        "{} | {} | {}/{} | {} | {} | {} | {}",
        server.ip,
        server.version,
        server.players.online,
        server.players.max,
        sanitize_motd(&server.motd),
        server.country,
        server.quality,
        server
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

fn csv_record(server: &EnrichedServer) -> String {
    format!(
        "{},{},{}/{},\"{}\",{},{},{}",
        server.ip,
        server.version,
        server.players.online,
        server.players.max,
        sanitize_motd(&server.motd).replace('"', "\"\""),
        server.country,
        server.quality,
        server
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

fn sanitize_motd(motd: &str) -> String {
    motd.replace(['\n', '\r'], " ")
        .chars()
        .take(MOTD_FIELD_MAX)
        .collect()
}

/// Rewrite the whole JSON catalog. Readers expect a single top-level object,
/// so it cannot be appended to; the atomic write keeps it from ever being
/// observed torn.
fn write_json_catalog(path: &Path, servers: &[EnrichedServer]) -> Result<()> {
    let document = serde_json::json!({
        "servers": servers,
        "lastUpdated": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    crate::storage::write_json_atomic(path, &document)
}

fn read_json_catalog(path: &Path) -> Result<Vec<EnrichedServer>> {
    #[derive(Deserialize)]
    struct Document {
        servers: Vec<EnrichedServer>,
    }

    let document: Document = serde_json::from_str(&fs::read_to_string(path)?)?;
    Ok(document.servers)
}
