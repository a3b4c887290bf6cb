//! Firewall rule stores.
//!
//! The ban engine treats the firewall as an ordered, shared and mutable
//! collection of rules. Every ban is persisted only as a rule in that
//! collection, so a store must round-trip names and descriptions verbatim.
//!
//! # Built-in Implementations
//!
//! - [`MemoryRuleStore`] - in-process rule list (testing, dry deployments)
//! - [`IptablesRuleStore`] - rules in a dedicated iptables chain

mod iptables;
mod memory;
mod types;

pub use iptables::IptablesRuleStore;
pub use memory::MemoryRuleStore;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Firewall rule storage backend.
///
/// Operations are not atomic with respect to each other; callers that need
/// check-then-act semantics must tolerate concurrent modification.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Append a rule.
    async fn add(&self, rule: FirewallRule) -> Result<(), FirewallError>;

    /// Remove a rule by identity. Returns `false` if no such rule exists.
    async fn remove(&self, rule: &FirewallRule) -> Result<bool, FirewallError>;

    /// Snapshot of all rules, in store order.
    async fn rules(&self) -> Result<Vec<FirewallRule>, FirewallError>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Rules matching a predicate, in store order.
    async fn find(
        &self,
        predicate: &(dyn for<'r> Fn(&'r FirewallRule) -> bool + Sync),
    ) -> Result<Vec<FirewallRule>, FirewallError> {
        Ok(self
            .rules()
            .await?
            .into_iter()
            .filter(|rule| predicate(rule))
            .collect())
    }
}

/// A shared rule store.
pub type SharedRuleStore = Arc<dyn RuleStore>;
