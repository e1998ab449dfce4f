//! Streaming statistics for the running session.
//!
//! Owned by the scanner, mutated only from dispatcher continuations, and
//! shared behind a mutex so the dashboard and signal handlers can read a
//! consistent view.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::processing::EnrichedServer;

/// A single MOTD's tally stops counting here.
pub const MOTD_ENTRY_CAP: u64 = 10;

/// The MOTD tally stops accepting new entries here.
pub const MOTD_MAP_CAP: usize = 256;

/// Weight of a new sample in the response-time moving average.
const RESPONSE_TIME_ALPHA: f64 = 0.1;

pub fn player_bucket(online: i64) -> &'static str {
    match online {
        i64::MIN..=0 => "0",
        1..=5 => "1-5",
        6..=20 => "6-20",
        21..=50 => "21-50",
        51..=100 => "51-100",
        _ => "100+",
    }
}

#[derive(Debug)]
pub struct ScanStats {
    pub total_scanned: u64,
    pub total_found: u64,
    pub duplicates_skipped: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub connection_errors: u64,
    pub active_connections: u32,
    pub gc_invocations: u64,
    pub avg_response_time_ms: f64,
    pub peak_scan_rate: f64,
    pub servers_by_version: FxHashMap<String, u64>,
    pub servers_by_country: FxHashMap<String, u64>,
    pub servers_by_player_count: FxHashMap<&'static str, u64>,
    pub popular_motds: FxHashMap<String, u64>,
    pub last_found: Option<EnrichedServer>,
    pub best: Option<EnrichedServer>,

    started: Instant,
    started_at: DateTime<Utc>,
}

impl ScanStats {
    pub fn new() -> Self {
        Self {
            total_scanned: 0,
            total_found: 0,
            duplicates_skipped: 0,
            errors: 0,
            timeouts: 0,
            connection_errors: 0,
            active_connections: 0,
            gc_invocations: 0,
            avg_response_time_ms: 0.0,
            peak_scan_rate: 0.0,
            servers_by_version: FxHashMap::default(),
            servers_by_country: FxHashMap::default(),
            servers_by_player_count: FxHashMap::default(),
            popular_motds: FxHashMap::default(),
            last_found: None,
            best: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn record_probe_start(&mut self) {
        self.total_scanned += 1;
        self.active_connections += 1;
    }

    pub fn record_probe_end(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    pub fn record_no_response(&mut self, timed_out: bool) {
        if timed_out {
            self.timeouts += 1;
        } else {
            self.connection_errors += 1;
        }
    }

    pub fn record_malformed(&mut self) {
        self.errors += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_skipped += 1;
    }

    pub fn record_gc(&mut self) {
        self.gc_invocations += 1;
    }

    pub fn record_response_time(&mut self, sample_ms: u64) {
        let sample = sample_ms as f64;
        if self.avg_response_time_ms == 0.0 {
            self.avg_response_time_ms = sample;
        } else {
            self.avg_response_time_ms = (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time_ms
                + RESPONSE_TIME_ALPHA * sample;
        }
    }

    pub fn record_found(&mut self, server: &EnrichedServer) {
        self.total_found += 1;

        *self
            .servers_by_version
            .entry(server.version.clone())
            .or_insert(0) += 1;
        *self
            .servers_by_country
            .entry(server.country.clone())
            .or_insert(0) += 1;
        *self
            .servers_by_player_count
            .entry(player_bucket(server.players.online))
            .or_insert(0) += 1;
        self.tally_motd(&server.motd);

        self.last_found = Some(server.clone());
        let is_best = self
            .best
            .as_ref()
            .map(|best| server.quality > best.quality)
            .unwrap_or(true);
        if is_best {
            self.best = Some(server.clone());
        }
    }

    /// Count a MOTD sighting. Each entry stops at [`MOTD_ENTRY_CAP`] and the
    /// map refuses new entries past [`MOTD_MAP_CAP`], so a popular hosting
    /// template cannot swallow the session's memory.
    fn tally_motd(&mut self, motd: &str) {
        match self.popular_motds.get_mut(motd) {
            Some(count) if *count >= MOTD_ENTRY_CAP => {}
            Some(count) => *count += 1,
            None => {
                if self.popular_motds.len() < MOTD_MAP_CAP {
                    self.popular_motds.insert(motd.to_string(), 1);
                }
            }
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn scan_rate(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime <= 0.0 {
            return 0.0;
        }
        self.total_scanned as f64 / uptime
    }

    pub fn update_peak_rate(&mut self) {
        let rate = self.scan_rate();
        if rate > self.peak_scan_rate {
            self.peak_scan_rate = rate;
        }
    }

    /// Zero the volatile counters. Lifetime tallies (total found, the
    /// version and country maps) survive, as does the live connection
    /// gauge; the clock restarts.
    pub fn reset(&mut self) {
        self.total_scanned = 0;
        self.duplicates_skipped = 0;
        self.errors = 0;
        self.timeouts = 0;
        self.connection_errors = 0;
        self.gc_invocations = 0;
        self.avg_response_time_ms = 0.0;
        self.peak_scan_rate = 0.0;
        self.servers_by_player_count = FxHashMap::default();
        self.popular_motds = FxHashMap::default();
        self.last_found = None;
        self.best = None;
        self.started = Instant::now();
        self.started_at = Utc::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            total_scanned: self.total_scanned,
            total_found: self.total_found,
            duplicates_skipped: self.duplicates_skipped,
            errors: self.errors,
            timeout_count: self.timeouts,
            connection_errors: self.connection_errors,
            active_connections: self.active_connections,
            gc_invocations: self.gc_invocations,
            start_time: self.started_at,
            uptime_secs: self.uptime_secs(),
            avg_response_time_ms: self.avg_response_time_ms,
            peak_scan_rate: self.peak_scan_rate,
            servers_by_version: sorted_pairs(&self.servers_by_version),
            servers_by_country: sorted_pairs(&self.servers_by_country),
            servers_by_player_count: sorted_pairs(&self.servers_by_player_count),
            popular_motds: sorted_pairs(&self.popular_motds),
            last_found_server: self.last_found.clone(),
            best_server: self.best.clone(),
        }
    }

    pub fn top_versions(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.servers_by_version, n)
    }

    pub fn top_countries(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.servers_by_country, n)
    }
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_pairs<K: AsRef<str>>(map: &FxHashMap<K, u64>) -> Vec<(String, u64)> {
    let mut pairs: Vec<(String, u64)> = map
        .iter()
        .map(|(k, v)| (k.as_ref().to_string(), *v))
        .collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs
}

fn top_n(map: &FxHashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut pairs = sorted_pairs(map);
    pairs.truncate(n);
    pairs
}

/// The statistics record as persisted to `session-stats.json`. Maps become
/// arrays of `[key, value]` pairs.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub total_scanned: u64,
    pub total_found: u64,
    pub duplicates_skipped: u64,
    pub errors: u64,
    pub timeout_count: u64,
    pub connection_errors: u64,
    pub active_connections: u32,
    pub gc_invocations: u64,
    pub start_time: DateTime<Utc>,
    pub uptime_secs: f64,
    pub avg_response_time_ms: f64,
    pub peak_scan_rate: f64,
    pub servers_by_version: Vec<(String, u64)>,
    pub servers_by_country: Vec<(String, u64)>,
    pub servers_by_player_count: Vec<(String, u64)>,
    pub popular_motds: Vec<(String, u64)>,
    pub last_found_server: Option<EnrichedServer>,
    pub best_server: Option<EnrichedServer>,
}
