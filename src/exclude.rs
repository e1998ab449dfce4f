use std::{net::Ipv4Addr, str::FromStr};

use eyre::eyre;

/// An inclusive range of IPv4 addresses.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn from_cidr(base: Ipv4Addr, prefix: u8) -> eyre::Result<Self> {
        if prefix > 32 {
            return Err(eyre!("invalid prefix length: /{prefix}"));
        }

        let host_bits = 32 - prefix;
        let mask_bits = if host_bits == 32 {
            u32::MAX
        } else {
            (1u32 << host_bits) - 1
        };

        let base = u32::from(base);
        Ok(Self {
            start: Ipv4Addr::from(base & !mask_bits),
            end: Ipv4Addr::from(base | mask_bits),
        })
    }

    /// Count the number of addresses in this range.
    pub fn count(&self) -> u64 {
        (u32::from(self.end) as u64) - (u32::from(self.start) as u64) + 1
    }

    /// Get the address at the given offset from the start of the range.
    pub fn index(&self, offset: u64) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.start) + offset as u32)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// A sorted set of address ranges, cheap to test membership against.
#[derive(Debug, Default, Clone)]
pub struct Ipv4Ranges {
    ranges: Vec<Ipv4Range>,
}

impl Ipv4Ranges {
    pub fn new(mut ranges: Vec<Ipv4Range>) -> Self {
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mut start = 0;
        let mut end = self.ranges.len();
        while start < end {
            let mid = (start + end) / 2;
            let range = &self.ranges[mid];
            if range.end < addr {
                start = mid + 1;
            } else if range.start > addr {
                end = mid;
            } else {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &Vec<Ipv4Range> {
        &self.ranges
    }

    pub fn count(&self) -> u64 {
        let mut total = 0;
        for range in &self.ranges {
            total += range.count();
        }
        total
    }
}

/// Parse a single range. Accepts `0.0.0.0/8`, `0.0.0.0-0.0.0.255`, or a bare
/// address.
pub fn parse_range(input: &str) -> eyre::Result<Ipv4Range> {
    let input = input.trim();

    let is_slash = input.contains('/');
    let is_hyphen = input.contains('-');

    if is_slash && is_hyphen {
        return Err(eyre!("invalid range: {input} (cannot contain both - and /)"));
    }

    if is_slash {
        let mut parts = input.split('/');

        let ip = parts.next().unwrap();
        let prefix = parts
            .next()
            .ok_or_else(|| eyre!("invalid range: {input}"))?
            .parse::<u8>()?;

        Ipv4Range::from_cidr(Ipv4Addr::from_str(ip)?, prefix)
    } else if is_hyphen {
        let mut parts = input.split('-');

        let start = Ipv4Addr::from_str(parts.next().unwrap())?;
        let end = Ipv4Addr::from_str(parts.next().ok_or_else(|| eyre!("invalid range: {input}"))?)?;

        if start > end {
            return Err(eyre!(
                "invalid range: {input} (start cannot be greater than end)"
            ));
        }

        Ok(Ipv4Range { start, end })
    } else {
        Ok(Ipv4Range::single(Ipv4Addr::from_str(input)?))
    }
}

/// Parse a list of range strings, skipping empty entries and `#` comments.
pub fn parse_ranges(inputs: &[String]) -> eyre::Result<Ipv4Ranges> {
    let mut ranges = Vec::new();

    for line in inputs {
        let line = line.split('#').next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        ranges.push(parse_range(line)?);
    }

    Ok(Ipv4Ranges::new(ranges))
}

/// Ranges that are never probed: RFC 1918, loopback, link-local, multicast,
/// and the reserved class E block.
pub fn default_exclude_ranges() -> Vec<String> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "224.0.0.0/4",
        "240.0.0.0/4",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
