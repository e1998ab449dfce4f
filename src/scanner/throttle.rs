//! Keeps probes spread out across subnets.
//!
//! Admission is at most one probe per /24 per window, plus a session-wide
//! blacklist of addresses that burned through their retry budget.

use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use rustc_hash::{FxHashMap, FxHashSet};

/// Minimum spacing between two probes into the same /24.
pub const SUBNET_WINDOW: Duration = Duration::from_millis(1000);

/// How often the admission table is reaped.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Entries older than this are dropped by a reap.
const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Defer,
}

pub struct Throttler {
    /// Last admission per /24, keyed by the top three octets.
    last_admitted: FxHashMap<u32, Instant>,
    blacklist: FxHashSet<Ipv4Addr>,
}

impl Throttler {
    pub fn new() -> Self {
        Self {
            last_admitted: FxHashMap::default(),
            blacklist: FxHashSet::default(),
        }
    }

    pub fn admit(&mut self, addr: Ipv4Addr) -> Admission {
        self.admit_at(addr, Instant::now())
    }

    pub fn admit_at(&mut self, addr: Ipv4Addr, now: Instant) -> Admission {
        if self.blacklist.contains(&addr) {
            return Admission::Defer;
        }

        let subnet = u32::from(addr) >> 8;
        if let Some(&last) = self.last_admitted.get(&subnet) {
            if now.saturating_duration_since(last) < SUBNET_WINDOW {
                return Admission::Defer;
            }
        }

        self.last_admitted.insert(subnet, now);
        Admission::Allow
    }

    pub fn blacklist_insert(&mut self, addr: Ipv4Addr) {
        self.blacklist.insert(addr);
    }

    pub fn is_blacklisted(&self, addr: Ipv4Addr) -> bool {
        self.blacklist.contains(&addr)
    }

    pub fn blacklist(&self) -> &FxHashSet<Ipv4Addr> {
        &self.blacklist
    }

    pub fn table_len(&self) -> usize {
        self.last_admitted.len()
    }

    /// Drop admission entries old enough that they can no longer defer
    /// anything. Keeps the table bounded on long sessions.
    pub fn reap(&mut self) {
        self.reap_at(Instant::now());
    }

    pub fn reap_at(&mut self, now: Instant) {
        self.last_admitted
            .retain(|_, last| now.saturating_duration_since(*last) < ENTRY_TTL);
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}
