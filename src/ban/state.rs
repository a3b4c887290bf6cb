//! Ban state as stored in firewall rules.
//!
//! A rule is the only persisted record of a ban. The name carries the network
//! and the description carries ban time, unban time and offense number:
//!
//! ```text
//! name:        Banned 192.0.2.0/24
//! description: Banned 2026-10-18T12:00:00Z. Will unban 2026-10-19T12:00:00Z. Offense #1.
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use super::NetworkKey;
use crate::firewall::FirewallRule;

/// Group tag on every rule this service creates.
pub const GROUP_NAME: &str = "banwarden";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Last instant whose year still formats with four digits.
fn latest_encodable() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed ban rule name {0:?}")]
    Name(String),

    #[error("malformed ban rule description {0:?}")]
    Description(String),
}

/// A decoded ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanState {
    pub network: NetworkKey,
    pub banned_at: DateTime<Utc>,
    pub unban_at: DateTime<Utc>,
    pub offense: u32,
}

impl BanState {
    pub fn new(network: NetworkKey, banned_at: DateTime<Utc>, duration: Duration, offense: u32) -> Self {
        let latest = latest_encodable().max(banned_at);
        let unban_at = TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| banned_at.checked_add_signed(delta))
            .map_or(latest, |unban_at| unban_at.min(latest));

        Self {
            network,
            banned_at,
            unban_at,
            offense,
        }
    }

    /// Inbound block rule for this ban, tagged with [`GROUP_NAME`].
    pub fn to_rule(&self) -> FirewallRule {
        FirewallRule::block_inbound(
            rule_name(&self.network),
            GROUP_NAME,
            encode_description(self.banned_at, self.unban_at, self.offense),
            self.network.network(),
        )
    }

    pub fn from_rule(rule: &FirewallRule) -> Result<Self, StateError> {
        let network = parse_rule_name(&rule.name).ok_or_else(|| StateError::Name(rule.name.clone()))?;
        let (banned_at, unban_at, offense) = decode_description(&rule.description)
            .ok_or_else(|| StateError::Description(rule.description.clone()))?;

        Ok(Self {
            network,
            banned_at,
            unban_at,
            offense,
        })
    }

    /// Time left until the unban, `None` once due.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.unban_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Deterministic rule name for a network.
pub fn rule_name(network: &NetworkKey) -> String {
    format!("Banned {}", network)
}

/// Whether `rule` is one of ours, optionally for one network only.
pub fn is_ban_rule(rule: &FirewallRule, network: Option<&NetworkKey>) -> bool {
    rule.in_group(GROUP_NAME) && network.map_or(true, |n| rule.name == rule_name(n))
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Banned (?<subnet>[\d./]+?)$").expect("rule name pattern is valid"))
}

fn description_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^Banned (?<banned>[\dT:-]+?Z?)\. Will unban (?<unban>[\dT:-]+?Z?)\. Offense #(?<offense>[\d, .']+?)\.$",
        )
        .expect("rule description pattern is valid")
    })
}

pub fn parse_rule_name(name: &str) -> Option<NetworkKey> {
    let caps = name_pattern().captures(name)?;
    caps["subnet"].parse().ok()
}

pub fn encode_description(banned_at: DateTime<Utc>, unban_at: DateTime<Utc>, offense: u32) -> String {
    format!(
        "Banned {}Z. Will unban {}Z. Offense #{}.",
        banned_at.format(TIMESTAMP_FORMAT),
        unban_at.format(TIMESTAMP_FORMAT),
        group_thousands(offense)
    )
}

/// Inverse of [`encode_description`]. Timestamps without a `Z` are read as local time.
pub fn decode_description(description: &str) -> Option<(DateTime<Utc>, DateTime<Utc>, u32)> {
    let caps = description_pattern().captures(description)?;

    let banned_at = parse_timestamp(&caps["banned"])?;
    let unban_at = parse_timestamp(&caps["unban"])?;

    let digits: String = caps["offense"]
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '.' | '\''))
        .collect();
    let offense = digits.parse().ok()?;

    Some((banned_at, unban_at, offense))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match value.strip_suffix('Z') {
        Some(utc) => NaiveDateTime::parse_from_str(utc, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc()),
        None => {
            let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()?;
            Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc))
        }
    }
}

fn group_thousands(value: u32) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap().and_utc()
    }

    #[test]
    fn test_rule_name() {
        let network: NetworkKey = "192.0.2.0/24".parse().unwrap();
        assert_eq!(rule_name(&network), "Banned 192.0.2.0/24");
        assert_eq!(parse_rule_name("Banned 192.0.2.0/24"), Some(network));
        assert_eq!(parse_rule_name("Banned 192.0.2.0/24 extra"), None);
        assert_eq!(parse_rule_name("Banned hello"), None);
        assert_eq!(parse_rule_name("Allowed 192.0.2.0/24"), None);
    }

    #[test]
    fn test_encode_description() {
        let description = encode_description(at("2026-10-18T12:00:00"), at("2026-10-19T12:00:00"), 1234);
        assert_eq!(
            description,
            "Banned 2026-10-18T12:00:00Z. Will unban 2026-10-19T12:00:00Z. Offense #1,234."
        );
    }

    #[test]
    fn test_decode_description() {
        let decoded =
            decode_description("Banned 2026-10-18T12:00:00Z. Will unban 2026-10-19T12:00:00Z. Offense #1,234.");
        assert_eq!(
            decoded,
            Some((at("2026-10-18T12:00:00"), at("2026-10-19T12:00:00"), 1234))
        );
    }

    #[test]
    fn test_decode_local_timestamps() {
        let (banned_at, unban_at, offense) =
            decode_description("Banned 2026-10-18T12:00:00. Will unban 2026-10-19T12:00:00. Offense #2.").unwrap();

        assert_eq!(unban_at - banned_at, TimeDelta::days(1));
        assert_eq!(offense, 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_description("hello"), None);
        assert_eq!(
            decode_description("Banned yesterday. Will unban tomorrow. Offense #1."),
            None
        );
        assert_eq!(
            decode_description("Banned 2026-10-18T12:00:00Z. Will unban 2026-10-19T12:00:00Z. Offense #."),
            None
        );
    }

    #[test]
    fn test_rule_round_trip() {
        let network: NetworkKey = "198.51.100.0/24".parse().unwrap();
        let state = BanState::new(network, at("2026-10-18T12:00:00"), Duration::from_secs(3600), 3);
        let rule = state.to_rule();

        assert_eq!(rule.name, "Banned 198.51.100.0/24");
        assert_eq!(rule.group, GROUP_NAME);
        assert_eq!(rule.remote_addresses, vec![network.network()]);
        assert!(is_ban_rule(&rule, Some(&network)));
        assert!(is_ban_rule(&rule, None));
        assert!(!is_ban_rule(&rule, Some(&"198.51.101.0/24".parse().unwrap())));

        assert_eq!(BanState::from_rule(&rule), Ok(state));
    }

    #[test]
    fn test_unrepresentable_unban_is_clamped() {
        let network: NetworkKey = "203.0.113.0/24".parse().unwrap();
        let state = BanState::new(network, at("2026-10-18T12:00:00"), Duration::MAX, 7);

        assert_eq!(state.unban_at, at("9999-12-31T23:59:59"));
        assert_eq!(
            state.to_rule().description,
            "Banned 2026-10-18T12:00:00Z. Will unban 9999-12-31T23:59:59Z. Offense #7."
        );
        assert_eq!(BanState::from_rule(&state.to_rule()), Ok(state));

        let centuries = Duration::from_secs(100_000 * 365 * 24 * 60 * 60);
        let far = BanState::new(network, at("2026-10-18T12:00:00"), centuries, 1);
        assert_eq!(far.unban_at, at("9999-12-31T23:59:59"));
    }

    #[test]
    fn test_from_rule_errors() {
        let mut rule = FirewallRule::block_inbound("junk", GROUP_NAME, "", "192.0.2.0/24".parse().unwrap());
        assert_eq!(BanState::from_rule(&rule), Err(StateError::Name("junk".to_string())));

        rule.name = "Banned 192.0.2.0/24".to_string();
        assert!(matches!(BanState::from_rule(&rule), Err(StateError::Description(_))));
    }

    #[test]
    fn test_remaining() {
        let network: NetworkKey = "192.0.2.1".parse().unwrap();
        let state = BanState::new(network, at("2026-10-18T12:00:00"), Duration::from_secs(60), 1);

        assert_eq!(state.remaining(at("2026-10-18T12:00:30")), Some(Duration::from_secs(30)));
        assert_eq!(state.remaining(at("2026-10-18T12:01:00")), None);
        assert_eq!(state.remaining(at("2026-10-18T13:00:00")), None);
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(1), "1");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
