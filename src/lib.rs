//! banwarden: host intrusion prevention.
//!
//! Watches log sources for authentication failures, aggregates them per source
//! network and blocks offending networks at the firewall for an escalating period.
//!
//! ```text
//! LogSource → EventTranslator → Ipv4Addr → BanEngine → RuleStore
//!                                              ↑            │
//!                                              └── unban ───┘
//! ```

pub mod ban;
pub mod bootstrap;
pub mod config;
pub mod events;
pub mod firewall;
pub mod telemetry;

pub use ban::{BanEngine, FailureHistory, NetworkKey};
pub use config::{BanSettings, Config, EventSelector};
pub use events::{EventRecord, EventTranslator, LogSource};
pub use firewall::{FirewallRule, MemoryRuleStore, RuleStore};
