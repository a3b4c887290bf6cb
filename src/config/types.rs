use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for banwarden
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Failure aggregation and ban policy
    #[serde(default)]
    pub bans: BanSettings,

    /// Log selectors that produce authentication failures
    #[serde(default)]
    pub selectors: Vec<EventSelector>,

    /// Firewall backend
    #[serde(default)]
    pub firewall: FirewallBackendConfig,

    /// Logging settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Ban policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BanSettings {
    /// Log decisions without touching the firewall
    #[serde(default)]
    pub dry_run: bool,

    /// Failures tolerated inside the window before a ban
    #[serde(default = "default_max_allowed_failures")]
    pub max_allowed_failures: usize,

    /// Sliding window over which failures are counted
    #[serde(default = "default_one_day", with = "humantime_serde")]
    pub failure_window: Duration,

    /// Duration of a first offense ban
    #[serde(default = "default_one_day", with = "humantime_serde")]
    pub ban_period: Duration,

    /// Low-order address bits ignored when grouping failures (8 groups by /24)
    #[serde(default)]
    pub ban_subnet_bits: Option<u8>,

    /// Extra ban periods added per repeated offense
    #[serde(default)]
    pub ban_repeated_offense_coefficient: Option<f64>,

    /// Offense count after which the ban duration stops growing
    #[serde(default)]
    pub ban_repeated_offense_max: Option<u32>,

    /// Networks that are never banned
    #[serde(default, deserialize_with = "deserialize_networks")]
    pub never_ban_subnets: Vec<Ipv4Net>,

    /// Skip private-use blocks (10/8, 172.16/12, 192.168/16)
    #[serde(default = "default_true")]
    pub never_ban_reserved_subnets: bool,

    /// Delete every existing ban rule on startup instead of resuming timers
    #[serde(default = "default_true")]
    pub unban_all_on_startup: bool,
}

impl Default for BanSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_allowed_failures: default_max_allowed_failures(),
            failure_window: default_one_day(),
            ban_period: default_one_day(),
            ban_subnet_bits: None,
            ban_repeated_offense_coefficient: None,
            ban_repeated_offense_max: None,
            never_ban_subnets: Vec::new(),
            never_ban_reserved_subnets: true,
            unban_all_on_startup: true,
        }
    }
}

impl BanSettings {
    /// Host bits masked off source addresses, clamped to 32.
    pub fn subnet_bits(&self) -> u8 {
        self.ban_subnet_bits.unwrap_or(0).min(32)
    }

    /// Escalation coefficient, 0 when unset.
    pub fn offense_coefficient(&self) -> f64 {
        self.ban_repeated_offense_coefficient.unwrap_or(0.0)
    }

    /// Escalation cap, 4 when unset.
    pub fn offense_max(&self) -> u32 {
        self.ban_repeated_offense_max.unwrap_or(4).max(1)
    }
}

fn default_max_allowed_failures() -> usize {
    9
}

fn default_one_day() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_true() -> bool {
    true
}

/// Describes which log records carry authentication failures.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EventSelector {
    /// Log to subscribe to (a file path for the file source)
    pub log_name: String,

    /// Numeric event identifier
    #[serde(default)]
    pub event_id: u32,

    /// Provider that must have written the record
    #[serde(default)]
    pub source: Option<String>,

    /// Pattern with an `ipAddress` named group; defaults to any IPv4 address
    #[serde(default)]
    pub ip_address_pattern: Option<String>,

    /// Named data field holding the text to search
    #[serde(default)]
    pub ip_address_event_data_name: Option<String>,

    /// Index of the text to search: into the values of the named field when
    /// one is given, otherwise into the record's properties
    #[serde(default)]
    pub ip_address_event_data_index: usize,

    /// Extra filter clause appended verbatim to the subscription query
    #[serde(default)]
    pub event_predicate: Option<String>,
}

/// Firewall backend type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// In-process rule list (nothing is blocked)
    Memory,
    #[default]
    Iptables,
}

/// Firewall backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallBackendConfig {
    #[serde(default)]
    pub backend: FirewallBackend,

    /// Dedicated chain holding ban rules
    #[serde(default = "default_chain")]
    pub chain: String,

    /// iptables executable
    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,
}

impl Default for FirewallBackendConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::default(),
            chain: default_chain(),
            iptables_path: default_iptables_path(),
        }
    }
}

fn default_chain() -> String {
    "BANWARDEN".to_string()
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("iptables")
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a network in CIDR form; a bare address means a single host.
pub fn parse_network(value: &str) -> Result<Ipv4Net, String> {
    let value = value.trim();
    let network = if value.contains('/') {
        value
            .parse::<Ipv4Net>()
            .map_err(|e| format!("invalid network {value:?}: {e}"))?
    } else {
        let addr = value
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("invalid address {value:?}: {e}"))?;
        Ipv4Net::from(addr)
    };
    Ok(network.trunc())
}

fn deserialize_networks<'de, D>(deserializer: D) -> Result<Vec<Ipv4Net>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<String>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .iter()
        .map(|value| parse_network(value).map_err(serde::de::Error::custom))
        .collect()
}
