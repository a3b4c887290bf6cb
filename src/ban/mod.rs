//! Failure aggregation and ban decisions.
//!
//! - [`FailureHistory`]: sliding window of failures for one network
//! - [`BanPolicy`]: exemptions, threshold and escalating ban duration
//! - [`BanState`]: ban metadata encoded in firewall rule names and descriptions
//! - [`BanEngine`]: ties it together and schedules unbans

mod engine;
mod history;
mod network;
pub mod policy;
pub mod state;
pub mod timer;

pub use engine::BanEngine;
pub use history::FailureHistory;
pub use network::{prefix_len_for, NetworkKey};
pub use policy::{ban_duration, BanPolicy, Exemption};
pub use state::{BanState, StateError, GROUP_NAME};
pub use timer::{sleep_chained, MAX_TIMER_STEP};
