pub mod probe;
pub mod protocol;
pub mod throttle;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use eyre::{Result, WrapErr};
use futures_util::{future::FutureExt, stream::FuturesUnordered, StreamExt};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{AppendOutcome, Catalog},
    config::Config,
    control::Command,
    exclude,
    generator::AddressGenerator,
    processing::{self, EnrichedServer},
    stats::ScanStats,
    storage::{self, StateDir},
};

use self::{
    probe::{probe_host, ProbeOutcome, ProbeResult, ProbeSettings},
    throttle::{Admission, Throttler},
};

/// Maintenance also runs after this many completed probes, whatever the
/// timer says.
pub const MAINTENANCE_SCAN_INTERVAL: u64 = 50_000;

const IDLE_TICK: Duration = Duration::from_millis(10);
const PAUSE_POLL: Duration = Duration::from_millis(1000);
const DISPATCH_COOLDOWN: Duration = Duration::from_secs(5);

type ProbeFuture = Pin<Box<dyn Future<Output = ProbeResult> + Send>>;

/// The scanner aggregate: owns the generator, the throttler, the catalog,
/// and the statistics, and drives them all from one dispatcher loop.
pub struct Scanner {
    config: Config,
    generator: AddressGenerator,
    throttler: Throttler,
    catalog: Catalog,
    stats: Arc<Mutex<ScanStats>>,
    state_dir: StateDir,
    settings: Arc<ProbeSettings>,
    commands: mpsc::UnboundedReceiver<Command>,

    paused: bool,
    should_stop: bool,
    last_reap: Instant,
    last_save: Instant,
    last_maintenance: Instant,
    scans_at_last_maintenance: u64,
}

impl Scanner {
    pub fn new(
        config: Config,
        catalog: Catalog,
        state_dir: StateDir,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<Self> {
        let excluded = exclude::parse_ranges(&config.exclude_ranges)
            .wrap_err("parsing excludeRanges")?;
        let ip_ranges = config
            .ip_ranges
            .iter()
            .map(|s| exclude::parse_range(s))
            .collect::<Result<Vec<_>>>()
            .wrap_err("parsing ipRanges")?;
        let generator = AddressGenerator::new(config.scan_mode, excluded, ip_ranges);

        let resolver = if config.enable_geolocation {
            let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
                TokioAsyncResolver::tokio(
                    hickory_resolver::config::ResolverConfig::default(),
                    hickory_resolver::config::ResolverOpts::default(),
                )
            });
            Some(Arc::new(resolver))
        } else {
            None
        };

        let settings = Arc::new(ProbeSettings {
            port: config.port,
            timeout: config.probe_timeout(),
            max_retries: config.max_retries,
            framed_handshake: config.framed_handshake,
            resolver,
        });

        let now = Instant::now();
        Ok(Self {
            config,
            generator,
            throttler: Throttler::new(),
            catalog,
            stats: Arc::new(Mutex::new(ScanStats::new())),
            state_dir,
            settings,
            commands,
            paused: false,
            should_stop: false,
            last_reap: now,
            last_save: now,
            last_maintenance: now,
            scans_at_last_maintenance: 0,
        })
    }

    /// Shared statistics, for the dashboard and anything else watching.
    pub fn stats(&self) -> Arc<Mutex<ScanStats>> {
        self.stats.clone()
    }

    /// The dispatcher loop. Runs until `maxScans` is hit, the targeted pool
    /// runs dry, or a stop command arrives; in-flight probes always finish
    /// before shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            mode = ?self.config.scan_mode,
            port = self.config.port,
            max_concurrent = self.config.max_concurrent,
            "scan starting"
        );

        let mut in_flight: FuturesUnordered<ProbeFuture> = FuturesUnordered::new();

        loop {
            self.drain_commands();
            if self.should_stop {
                break;
            }
            if let Some(max_scans) = self.config.max_scans {
                if self.stats.lock().total_scanned >= max_scans {
                    info!("reached the configured scan cap of {max_scans}");
                    break;
                }
            }
            if self.paused {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            self.periodic_upkeep();

            let generator_dry = self.admit_batch(&mut in_flight);

            if in_flight.is_empty() {
                if generator_dry {
                    info!("address pool exhausted");
                    break;
                }
                // everything is rate limited right now
                tokio::time::sleep(IDLE_TICK).await;
                continue;
            }

            // wait for a completion, but never longer than one idle tick so
            // admission and command handling stay responsive
            tokio::select! {
                Some(result) = in_flight.next() => {
                    self.handle_completion(result).await;
                    // sweep up everything else that finished meanwhile
                    while let Some(Some(result)) = in_flight.next().now_or_never() {
                        self.handle_completion(result).await;
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }
        }

        if !in_flight.is_empty() {
            info!("waiting for {} in-flight probes to finish", in_flight.len());
            while let Some(result) = in_flight.next().await {
                self.handle_completion(result).await;
            }
        }

        self.shutdown()
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Pause => {
                    if !self.paused {
                        info!("scan paused");
                    }
                    self.paused = true;
                }
                Command::Resume => {
                    if self.paused {
                        info!("scan resumed");
                    }
                    self.paused = false;
                }
                Command::Stop => {
                    info!("stop requested");
                    self.should_stop = true;
                }
                Command::ResetStats => {
                    self.stats.lock().reset();
                    info!("statistics reset");
                }
                Command::SaveProgress => self.save_progress(),
            }
        }
    }

    /// Draw up to one batch of candidates and spawn probes for the admitted
    /// ones. Returns true once the generator has nothing left to give.
    fn admit_batch(&mut self, in_flight: &mut FuturesUnordered<ProbeFuture>) -> bool {
        for _ in 0..self.config.batch_size {
            if in_flight.len() >= self.config.max_concurrent {
                return false;
            }

            let Some(addr) = self
                .generator
                .next(&self.catalog.seen, self.throttler.blacklist())
            else {
                return true;
            };

            // deferred candidates are dropped, not queued: the generator has
            // endless replacements and the subnet gets revisited eventually
            if self.catalog.seen.contains(addr) {
                continue;
            }
            if self.throttler.admit(addr) != Admission::Allow {
                continue;
            }

            self.stats.lock().record_probe_start();
            in_flight.push(Box::pin(probe_host(addr, self.settings.clone())));
        }
        false
    }

    async fn handle_completion(&mut self, result: ProbeResult) {
        {
            let mut stats = self.stats.lock();
            stats.record_probe_end();
            stats.update_peak_rate();
        }

        match result.outcome {
            ProbeOutcome::NoResponse { timed_out } => {
                self.stats.lock().record_no_response(timed_out);
                if result.attempts >= self.config.max_retries.max(1) {
                    self.throttler.blacklist_insert(result.addr);
                }
            }
            ProbeOutcome::Malformed => {
                debug!("malformed response from {}", result.addr);
                self.stats.lock().record_malformed();
            }
            ProbeOutcome::Server(server) => {
                self.stats
                    .lock()
                    .record_response_time(result.response_time.as_millis() as u64);

                if !processing::passes_filters(
                    &server,
                    self.config.version_filter.as_ref(),
                    self.config.min_players,
                    self.config.max_players,
                ) {
                    debug!("{} filtered out", server.ip);
                    return;
                }

                if let Err(err) = self.emit(&server) {
                    // catalog trouble is counted and survived; the address
                    // stays out of the seen-set so a later probe can retry
                    error!("failed to record {}: {err:#}", server.ip);
                    self.stats.lock().record_error();
                    tokio::time::sleep(DISPATCH_COOLDOWN).await;
                }
            }
        }
    }

    fn emit(&mut self, server: &EnrichedServer) -> Result<()> {
        match self.catalog.append(server)? {
            AppendOutcome::Written => {
                self.generator.record_found(server.ip);
                self.stats.lock().record_found(server);
                info!(
                    "found {} ({}, {}/{} players, quality {})",
                    server.ip,
                    server.version,
                    server.players.online,
                    server.players.max,
                    server.quality,
                );
            }
            AppendOutcome::Duplicate => {
                self.stats.lock().record_duplicate();
            }
        }
        Ok(())
    }

    fn periodic_upkeep(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_reap) >= throttle::REAP_INTERVAL {
            self.throttler.reap();
            self.last_reap = now;
        }

        let total_scanned = self.stats.lock().total_scanned;
        let scans_due = total_scanned.saturating_sub(self.scans_at_last_maintenance)
            >= MAINTENANCE_SCAN_INTERVAL;
        if scans_due || now.duration_since(self.last_maintenance) >= self.config.maintenance_every()
        {
            self.maintenance();
        }

        if now.duration_since(self.last_save) >= self.config.autosave_every() {
            self.save_progress();
        }
    }

    /// Reap caches, trim the seen-set, snapshot progress.
    pub fn maintenance(&mut self) {
        debug!("running maintenance");
        self.throttler.reap();
        self.catalog.trim_seen();
        self.stats.lock().record_gc();
        self.save_progress();
        self.last_maintenance = Instant::now();
        self.scans_at_last_maintenance = self.stats.lock().total_scanned;
    }

    /// Snapshot the statistics and the active configuration. Failures are
    /// logged and the scan carries on.
    fn save_progress(&mut self) {
        let snapshot = self.stats.lock().snapshot();
        if let Err(err) = storage::write_json_atomic(&self.state_dir.stats_path(), &snapshot) {
            warn!("failed to save session stats: {err:#}");
            self.stats.lock().record_error();
        }
        if let Err(err) = storage::write_json_atomic(&self.state_dir.config_path(), &self.config) {
            warn!("failed to save config snapshot: {err:#}");
        }
        self.last_save = Instant::now();
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("shutting down");
        self.save_progress();

        let summary = {
            let stats = self.stats.lock();
            SessionSummary {
                finished_at: chrono::Utc::now(),
                total_scanned: stats.total_scanned,
                total_found: stats.total_found,
                duplicates_skipped: stats.duplicates_skipped,
                errors: stats.errors,
                uptime_secs: stats.uptime_secs(),
                avg_response_time_ms: stats.avg_response_time_ms,
                peak_scan_rate: stats.peak_scan_rate,
                blacklisted: self.throttler.blacklist().len(),
                top_versions: stats.top_versions(10),
                top_countries: stats.top_countries(10),
                best_server: stats.best.clone(),
            }
        };

        let path = self.state_dir.summary_path();
        storage::write_json_atomic(&path, &summary)
            .wrap_err_with(|| format!("writing summary {}", path.display()))?;

        info!(
            "session over: scanned {}, found {}, peak rate {:.1}/s",
            summary.total_scanned, summary.total_found, summary.peak_scan_rate
        );
        Ok(())
    }
}

/// Written next to the exports on shutdown.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    finished_at: chrono::DateTime<chrono::Utc>,
    total_scanned: u64,
    total_found: u64,
    duplicates_skipped: u64,
    errors: u64,
    uptime_secs: f64,
    avg_response_time_ms: f64,
    peak_scan_rate: f64,
    blacklisted: usize,
    top_versions: Vec<(String, u64)>,
    top_countries: Vec<(String, u64)>,
    best_server: Option<EnrichedServer>,
}
