//! Candidate address generation.
//!
//! Uniform draws over the whole address space almost never land on a
//! Minecraft server, so the default mode mixes in two biased strategies:
//! cluster draws reuse the /24 of the last find (hosters pack servers into
//! adjacent addresses), and popular-range draws lean on a handful of hosting
//! prefixes that historically carry game servers.

use std::net::Ipv4Addr;

use rand::prelude::*;
use rustc_hash::FxHashSet;

use crate::{
    catalog::SeenSet,
    config::ScanMode,
    exclude::{self, Ipv4Range, Ipv4Ranges},
};

/// How long rejection sampling tries before settling for any public address.
pub const REJECTION_ATTEMPTS: u32 = 32;

/// Hosting provider prefixes worth an occasional biased draw.
const POPULAR_RANGES: &[&str] = &[
    "5.9.0.0/16",
    "51.38.0.0/16",
    "135.181.0.0/16",
    "139.99.0.0/16",
    "172.105.0.0/16",
    "192.99.0.0/16",
];

pub struct AddressGenerator {
    mode: ScanMode,
    excluded: Ipv4Ranges,
    /// Draw pool for the range and targeted modes.
    ip_ranges: Vec<Ipv4Range>,
    popular: Vec<Ipv4Range>,
    last_found: Option<Ipv4Addr>,
    /// Enumeration position for the targeted mode: range index and offset
    /// within it.
    cursor: (usize, u64),
}

impl AddressGenerator {
    pub fn new(mode: ScanMode, excluded: Ipv4Ranges, ip_ranges: Vec<Ipv4Range>) -> Self {
        let popular = POPULAR_RANGES
            .iter()
            .map(|s| exclude::parse_range(s).unwrap())
            .collect();
        Self {
            mode,
            excluded,
            ip_ranges,
            popular,
            last_found: None,
            cursor: (0, 0),
        }
    }

    /// Remember a discovery so cluster draws can bias toward its /24.
    pub fn record_found(&mut self, addr: Ipv4Addr) {
        self.last_found = Some(addr);
    }

    /// Produce the next candidate. Only the targeted mode ever runs dry;
    /// every other mode is an endless stream.
    pub fn next(
        &mut self,
        seen: &SeenSet,
        blacklist: &FxHashSet<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        match self.mode {
            ScanMode::Random => Some(self.random_public(seen, blacklist)),
            ScanMode::SmartRandom => Some(self.smart_random(seen, blacklist)),
            ScanMode::Range => Some(self.range_draw(seen, blacklist)),
            ScanMode::Targeted => self.targeted_next(seen, blacklist),
        }
    }

    fn smart_random(&mut self, seen: &SeenSet, blacklist: &FxHashSet<Ipv4Addr>) -> Ipv4Addr {
        let candidate = match rand::rng().random_range(0..3u8) {
            0 => None, // plain uniform draw
            1 => self.cluster_candidate(),
            _ => self.popular_candidate(),
        };

        match candidate {
            Some(addr) if self.acceptable(addr, seen, blacklist) => addr,
            // biased draw unavailable or landed somewhere unusable
            _ => self.random_public(seen, blacklist),
        }
    }

    /// Keep the last find's first three octets, randomize the fourth.
    fn cluster_candidate(&self) -> Option<Ipv4Addr> {
        let base = self.last_found?;
        let octets = base.octets();
        Some(Ipv4Addr::new(
            octets[0],
            octets[1],
            octets[2],
            rand::rng().random::<u8>(),
        ))
    }

    fn popular_candidate(&self) -> Option<Ipv4Addr> {
        let range = self.popular.choose(&mut rand::rng())?;
        Some(random_in_range(range))
    }

    /// Rejection-sample the full address space. After enough misses, settle
    /// for any public address; the dispatcher still drops seen ones.
    fn random_public(&self, seen: &SeenSet, blacklist: &FxHashSet<Ipv4Addr>) -> Ipv4Addr {
        for _ in 0..REJECTION_ATTEMPTS {
            let addr = Ipv4Addr::from(rand::rng().random::<u32>());
            if self.acceptable(addr, seen, blacklist) {
                return addr;
            }
        }
        loop {
            let addr = Ipv4Addr::from(rand::rng().random::<u32>());
            if !self.excluded.contains(addr) {
                return addr;
            }
        }
    }

    /// Uniform draw over the union of the configured ranges, weighted by
    /// range size.
    fn range_draw(&self, seen: &SeenSet, blacklist: &FxHashSet<Ipv4Addr>) -> Ipv4Addr {
        if self.ip_ranges.is_empty() {
            return self.random_public(seen, blacklist);
        }

        for _ in 0..REJECTION_ATTEMPTS {
            let addr = random_in_union(&self.ip_ranges);
            if self.acceptable(addr, seen, blacklist) {
                return addr;
            }
        }
        self.random_public(seen, blacklist)
    }

    fn targeted_next(
        &mut self,
        seen: &SeenSet,
        blacklist: &FxHashSet<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        loop {
            let (range_index, offset) = self.cursor;
            let range = self.ip_ranges.get(range_index)?;

            if offset >= range.count() {
                self.cursor = (range_index + 1, 0);
                continue;
            }
            self.cursor = (range_index, offset + 1);

            let addr = range.index(offset);
            if self.acceptable(addr, seen, blacklist) {
                return Some(addr);
            }
        }
    }

    fn acceptable(
        &self,
        addr: Ipv4Addr,
        seen: &SeenSet,
        blacklist: &FxHashSet<Ipv4Addr>,
    ) -> bool {
        !self.excluded.contains(addr) && !seen.contains(addr) && !blacklist.contains(&addr)
    }
}

fn random_in_range(range: &Ipv4Range) -> Ipv4Addr {
    let offset = rand::rng().random_range(0..range.count());
    range.index(offset)
}

fn random_in_union(ranges: &[Ipv4Range]) -> Ipv4Addr {
    let total: u64 = ranges.iter().map(Ipv4Range::count).sum();
    let mut pick = rand::rng().random_range(0..total);
    for range in ranges {
        if pick < range.count() {
            return range.index(pick);
        }
        pick -= range.count();
    }
    unreachable!("pick is bounded by the summed counts");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exclude::parse_ranges;

    fn empty_state() -> (SeenSet, FxHashSet<Ipv4Addr>) {
        (SeenSet::new(), FxHashSet::default())
    }

    #[test]
    fn test_random_never_draws_excluded() {
        let excluded = parse_ranges(&["10.0.0.0/8".to_string()]).unwrap();
        let mut generator = AddressGenerator::new(ScanMode::Random, excluded, Vec::new());
        let (seen, blacklist) = empty_state();

        for _ in 0..10_000 {
            let addr = generator.next(&seen, &blacklist).unwrap();
            assert_ne!(addr.octets()[0], 10, "drew {addr} from an excluded range");
        }
    }

    #[test]
    fn test_range_mode_skips_seen_and_blacklisted() {
        let excluded = Ipv4Ranges::default();
        let ranges = vec![exclude::parse_range("198.51.100.0/24").unwrap()];
        let mut generator = AddressGenerator::new(ScanMode::Range, excluded, ranges);

        let mut seen = SeenSet::new();
        seen.insert(Ipv4Addr::new(198, 51, 100, 0));
        seen.insert(Ipv4Addr::new(198, 51, 100, 1));
        let mut blacklist = FxHashSet::default();
        blacklist.insert(Ipv4Addr::new(198, 51, 100, 2));

        for _ in 0..100 {
            let addr = generator.next(&seen, &blacklist).unwrap();
            assert!(!seen.contains(addr));
            assert!(!blacklist.contains(&addr));
            assert_eq!(addr.octets()[..3], [198, 51, 100]);
        }
    }

    #[test]
    fn test_cluster_candidate_shares_slash24() {
        let mut generator =
            AddressGenerator::new(ScanMode::SmartRandom, Ipv4Ranges::default(), Vec::new());

        assert!(generator.cluster_candidate().is_none());

        generator.record_found(Ipv4Addr::new(203, 0, 113, 17));
        for _ in 0..50 {
            let addr = generator.cluster_candidate().unwrap();
            assert_eq!(addr.octets()[..3], [203, 0, 113]);
        }
    }

    #[test]
    fn test_popular_candidate_stays_in_table() {
        let generator =
            AddressGenerator::new(ScanMode::SmartRandom, Ipv4Ranges::default(), Vec::new());
        let table = parse_ranges(
            &POPULAR_RANGES
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        )
        .unwrap();

        for _ in 0..100 {
            let addr = generator.popular_candidate().unwrap();
            assert!(table.contains(addr), "{addr} outside the popular ranges");
        }
    }

    #[test]
    fn test_smart_random_yields_valid_addresses() {
        let excluded = parse_ranges(&exclude::default_exclude_ranges()).unwrap();
        let mut generator =
            AddressGenerator::new(ScanMode::SmartRandom, excluded.clone(), Vec::new());
        let (seen, blacklist) = empty_state();

        generator.record_found(Ipv4Addr::new(203, 0, 113, 17));
        for _ in 0..1_000 {
            let addr = generator.next(&seen, &blacklist).unwrap();
            assert!(!excluded.contains(addr));
        }
    }

    #[test]
    fn test_cluster_inside_excluded_range_falls_through() {
        // last find sits inside what later became an excluded range; every
        // cluster draw must get rejected and re-drawn elsewhere
        let excluded = parse_ranges(&["203.0.113.0/24".to_string()]).unwrap();
        let mut generator =
            AddressGenerator::new(ScanMode::SmartRandom, excluded.clone(), Vec::new());
        let (seen, blacklist) = empty_state();

        generator.record_found(Ipv4Addr::new(203, 0, 113, 17));
        for _ in 0..1_000 {
            let addr = generator.next(&seen, &blacklist).unwrap();
            assert!(!excluded.contains(addr));
        }
    }

    #[test]
    fn test_range_mode_stays_in_union() {
        let excluded = Ipv4Ranges::default();
        let ranges = vec![
            exclude::parse_range("198.51.100.0/24").unwrap(),
            exclude::parse_range("203.0.113.0/24").unwrap(),
        ];
        let union = Ipv4Ranges::new(ranges.clone());
        let mut generator = AddressGenerator::new(ScanMode::Range, excluded, ranges);
        let (seen, blacklist) = empty_state();

        for _ in 0..1_000 {
            let addr = generator.next(&seen, &blacklist).unwrap();
            assert!(union.contains(addr));
        }
    }

    #[test]
    fn test_targeted_enumerates_once() {
        let excluded = Ipv4Ranges::default();
        let ranges = vec![exclude::parse_range("198.51.100.0/30").unwrap()];
        let mut generator = AddressGenerator::new(ScanMode::Targeted, excluded, ranges);
        let (mut seen, blacklist) = empty_state();
        seen.insert(Ipv4Addr::new(198, 51, 100, 2));

        let mut drawn = Vec::new();
        while let Some(addr) = generator.next(&seen, &blacklist) {
            drawn.push(addr);
        }

        // the seeded address is skipped and the mode runs dry
        assert_eq!(
            drawn,
            vec![
                Ipv4Addr::new(198, 51, 100, 0),
                Ipv4Addr::new(198, 51, 100, 1),
                Ipv4Addr::new(198, 51, 100, 3),
            ]
        );
        assert_eq!(generator.next(&seen, &blacklist), None);
    }
}
