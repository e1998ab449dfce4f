//! Turns raw status JSON into catalog-ready server records.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const UNKNOWN: &str = "Unknown";
pub const NO_DESCRIPTION: &str = "No description";

/// Substrings that mark a response as coming from a modded or plugin server.
const MOD_KEYWORDS: &[&str] = &[
    "forge", "fabric", "bukkit", "spigot", "paper", "sponge", "mod", "plugin", "cauldron",
    "mohist", "magma",
];

/// Version families that earn a freshness bonus in the quality score.
const MODERN_VERSIONS: &[&str] = &["1.21", "1.20", "1.19", "1.18"];

/// Hostname substring to country, first match wins.
const HOSTNAME_COUNTRIES: &[(&str, &str)] = &[
    ("us", "United States"),
    ("uk", "United Kingdom"),
    ("de", "Germany"),
    ("fr", "France"),
    ("nl", "Netherlands"),
    ("au", "Australia"),
    ("ca", "Canada"),
    ("jp", "Japan"),
    ("kr", "South Korea"),
    ("br", "Brazil"),
    ("ru", "Russia"),
    ("cn", "China"),
];

/// The `description` field is polymorphic: a plain string, an object with
/// `text`, or an object carrying an `extra` list of parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Description {
    Missing,
    Plain(String),
    Structured { text: String, extra: Vec<String> },
}

impl Description {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Description::Missing,
            Some(Value::String(s)) => Description::Plain(s.clone()),
            Some(Value::Object(obj)) => {
                let text = obj
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let extra = obj
                    .get("extra")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|part| match part {
                                Value::String(s) => Some(s.clone()),
                                Value::Object(part) => part
                                    .get("text")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Description::Structured { text, extra }
            }
            Some(_) => Description::Missing,
        }
    }

    /// Concatenate the parts into one string, still carrying any `§`
    /// formatting codes.
    pub fn flatten(&self) -> Option<String> {
        match self {
            Description::Missing => None,
            Description::Plain(s) => Some(s.clone()),
            Description::Structured { text, extra } => {
                let mut out = text.clone();
                for part in extra {
                    out.push_str(part);
                }
                Some(out)
            }
        }
    }
}

/// A parsed status response, with the original JSON retained for audit.
#[derive(Debug, Clone)]
pub struct RawStatus {
    pub version_name: Option<String>,
    pub protocol: Option<i64>,
    pub players_online: i64,
    pub players_max: i64,
    pub sample: Vec<String>,
    pub description: Description,
    pub favicon: bool,
    pub raw: Value,
}

impl RawStatus {
    pub fn from_json(value: Value) -> Self {
        let version = value.get("version");
        let version_name = version
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let protocol = version.and_then(|v| v.get("protocol")).and_then(Value::as_i64);

        let players = value.get("players");
        let players_online = players
            .and_then(|p| p.get("online"))
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let players_max = players
            .and_then(|p| p.get("max"))
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let sample = players
            .and_then(|p| p.get("sample"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("name"))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let description = Description::from_json(value.get("description"));
        let favicon = value.get("favicon").and_then(Value::as_str).is_some();

        Self {
            version_name,
            protocol,
            players_online,
            players_max,
            sample,
            description,
            favicon,
            raw: value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Players {
    pub online: i64,
    pub max: i64,
    pub sample: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedServer {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub version: String,
    pub protocol: Option<i64>,
    pub players: Players,
    pub description: String,
    pub motd: String,
    pub favicon: bool,
    pub modded: bool,
    pub country: String,
    pub quality: u8,
}

pub fn enrich(
    ip: Ipv4Addr,
    port: u16,
    status: &RawStatus,
    response_time_ms: u64,
    hostname: Option<&str>,
) -> EnrichedServer {
    let version = status
        .version_name
        .clone()
        .unwrap_or_else(|| UNKNOWN.to_string());

    let description = status.description.flatten();
    let motd = description
        .as_deref()
        .map(strip_formatting)
        .unwrap_or_else(|| NO_DESCRIPTION.to_string());

    let quality = quality_score(status.players_online, &motd, &version, response_time_ms);

    EnrichedServer {
        ip,
        port,
        timestamp: Utc::now(),
        response_time_ms,
        version,
        protocol: status.protocol,
        players: Players {
            online: status.players_online,
            max: status.players_max,
            sample: status.sample.clone(),
        },
        description: description.unwrap_or_default(),
        motd,
        favicon: status.favicon,
        modded: detect_modded(&status.raw),
        country: country_from_hostname(hostname),
        quality,
    }
}

/// Strip `§x` formatting codes (colors `0-9a-f`, styles `k-o`, reset `r`).
pub fn strip_formatting(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '§' {
            if let Some(&next) = chars.peek() {
                if matches!(next, '0'..='9' | 'a'..='f' | 'k'..='o' | 'r') {
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// A server counts as modded when its raw response mentions any of the
/// well-known loader or plugin platform names anywhere.
pub fn detect_modded(raw: &Value) -> bool {
    let text = raw.to_string().to_lowercase();
    MOD_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

pub fn country_from_hostname(hostname: Option<&str>) -> String {
    let Some(hostname) = hostname else {
        return UNKNOWN.to_string();
    };
    let hostname = hostname.to_lowercase();
    for (needle, country) in HOSTNAME_COUNTRIES {
        if hostname.contains(needle) {
            return country.to_string();
        }
    }
    UNKNOWN.to_string()
}

/// 0-100 desirability score: active players, a real MOTD, a recent version,
/// and a fast response each add points.
pub fn quality_score(online: i64, motd: &str, version: &str, response_time_ms: u64) -> u8 {
    let mut score: u32 = 0;
    if online > 0 {
        score += 20;
    }
    if online > 10 {
        score += 20;
    }
    if online > 50 {
        score += 20;
    }
    if motd.chars().count() > 10 {
        score += 15;
    }
    if MODERN_VERSIONS.iter().any(|v| version.contains(v)) {
        score += 15;
    }
    if response_time_ms < 100 {
        score += 10;
    }
    score.min(100) as u8
}

/// Whether a discovered server is worth emitting at all.
pub fn passes_filters(
    server: &EnrichedServer,
    version_filter: Option<&Vec<String>>,
    min_players: i64,
    max_players: i64,
) -> bool {
    if let Some(allowed) = version_filter {
        if !allowed.iter().any(|v| *v == server.version) {
            return false;
        }
    }
    server.players.online >= min_players && server.players.online <= max_players
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn status(value: Value) -> RawStatus {
        RawStatus::from_json(value)
    }

    #[test]
    fn test_description_plain() {
        let s = status(json!({"description": "A server"}));
        assert_eq!(s.description, Description::Plain("A server".to_string()));
        assert_eq!(s.description.flatten().as_deref(), Some("A server"));
    }

    #[test]
    fn test_description_object_with_text() {
        let s = status(json!({"description": {"text": "Welcome"}}));
        assert_eq!(s.description.flatten().as_deref(), Some("Welcome"));
    }

    #[test]
    fn test_description_extra_parts() {
        let s = status(json!({"description": {
            "text": "A ",
            "extra": [{"text": "Minecraft"}, " ", {"text": "Server"}],
        }}));
        assert_eq!(s.description.flatten().as_deref(), Some("A Minecraft Server"));
    }

    #[test]
    fn test_description_missing() {
        let s = status(json!({"players": {"online": 0, "max": 10}}));
        assert_eq!(s.description, Description::Missing);

        let server = enrich(Ipv4Addr::new(1, 2, 3, 4), 25565, &s, 200, None);
        assert_eq!(server.motd, NO_DESCRIPTION);
        assert_eq!(server.description, "");
    }

    #[test]
    fn test_strip_formatting() {
        assert_eq!(strip_formatting("§6Gold §lBold§r plain"), "Gold Bold plain");
        // an unknown code char is left alone
        assert_eq!(strip_formatting("§zstays"), "§zstays");
        assert_eq!(strip_formatting("trailing§"), "trailing§");
        assert_eq!(strip_formatting("no codes"), "no codes");
    }

    #[test]
    fn test_detect_modded() {
        assert!(detect_modded(&json!({"version": {"name": "Paper 1.20.4"}})));
        assert!(detect_modded(&json!({"forgeData": {"fmlNetworkVersion": 3}})));
        assert!(!detect_modded(&json!({"version": {"name": "1.20.4"}})));
    }

    #[test]
    fn test_country_lookup() {
        assert_eq!(
            country_from_hostname(Some("host.provider.US")),
            "United States"
        );
        // first table entry wins when several match
        assert_eq!(
            country_from_hostname(Some("us-node.de.example")),
            "United States"
        );
        assert_eq!(country_from_hostname(Some("host.example.xyz")), UNKNOWN);
        assert_eq!(country_from_hostname(None), UNKNOWN);
    }

    #[test]
    fn test_quality_score() {
        // 25 online (+20 +20), modern version (+15), short motd, slow probe
        assert_eq!(quality_score(25, "Welcome", "1.20.4", 200), 55);
        // everything maxed clamps at 100
        assert_eq!(quality_score(200, "A very long server motd", "1.21", 50), 100);
        assert_eq!(quality_score(0, "", "beta", 500), 0);
        // 60 online earns all three player bonuses
        assert_eq!(quality_score(60, "", "ancient", 500), 60);
    }

    #[test]
    fn test_enrich_full_status() {
        let s = status(json!({
            "version": {"name": "1.20.4", "protocol": 765},
            "players": {"online": 25, "max": 100, "sample": [{"name": "steve", "id": "x"}]},
            "description": {"text": "§aWelcome"},
            "favicon": "data:image/png;base64,xyz",
        }));
        let server = enrich(Ipv4Addr::new(203, 0, 113, 17), 25565, &s, 200, None);

        assert_eq!(server.version, "1.20.4");
        assert_eq!(server.protocol, Some(765));
        assert_eq!(server.players.online, 25);
        assert_eq!(server.players.max, 100);
        assert_eq!(server.players.sample, vec!["steve".to_string()]);
        assert_eq!(server.motd, "Welcome");
        assert_eq!(server.description, "§aWelcome");
        assert!(server.favicon);
        assert!(!server.modded);
        assert_eq!(server.country, UNKNOWN);
        assert_eq!(server.quality, 55);
    }

    #[test]
    fn test_enrich_is_deterministic() {
        let payload = json!({
            "version": {"name": "1.19.2"},
            "players": {"online": 3, "max": 20},
            "description": "hi",
        });
        let a = enrich(
            Ipv4Addr::new(1, 2, 3, 4),
            25565,
            &status(payload.clone()),
            80,
            Some("node.example.de"),
        );
        let b = enrich(
            Ipv4Addr::new(1, 2, 3, 4),
            25565,
            &status(payload),
            80,
            Some("node.example.de"),
        );

        // identical apart from the wall-clock timestamp
        assert_eq!((&a.version, &a.motd, &a.country, a.quality, a.modded),
                   (&b.version, &b.motd, &b.country, b.quality, b.modded));
    }

    #[test]
    fn test_missing_version_is_unknown() {
        let s = status(json!({"players": {"online": 0, "max": 10}}));
        let server = enrich(Ipv4Addr::new(1, 2, 3, 4), 25565, &s, 200, None);
        assert_eq!(server.version, UNKNOWN);
        assert_eq!(server.protocol, None);
    }

    #[test]
    fn test_filters() {
        let s = status(json!({
            "version": {"name": "1.20.4"},
            "players": {"online": 25, "max": 100},
        }));
        let server = enrich(Ipv4Addr::new(1, 2, 3, 4), 25565, &s, 200, None);

        assert!(passes_filters(&server, None, 0, 1_000_000));
        assert!(passes_filters(
            &server,
            Some(&vec!["1.20.4".to_string()]),
            0,
            1_000_000
        ));
        assert!(!passes_filters(
            &server,
            Some(&vec!["1.8.9".to_string()]),
            0,
            1_000_000
        ));
        assert!(!passes_filters(&server, None, 30, 1_000_000));
        assert!(!passes_filters(&server, None, 0, 10));
    }
}
