//! In-memory rule store.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{FirewallError, FirewallRule, RuleStore};

/// In-memory rule store.
///
/// Keeps rules in insertion order. Nothing reaches the host firewall, so this
/// backend is used by tests and by deployments that only want the decision log.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<Vec<FirewallRule>>,
}

impl MemoryRuleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with rules.
    pub fn with_rules(rules: Vec<FirewallRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// Current rules.
    pub fn snapshot(&self) -> Vec<FirewallRule> {
        self.rules.lock().clone()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    /// Check if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn add(&self, rule: FirewallRule) -> Result<(), FirewallError> {
        debug!(rule = %rule.name, "adding rule");
        self.rules.lock().push(rule);
        Ok(())
    }

    async fn remove(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        let mut rules = self.rules.lock();
        match rules.iter().position(|existing| existing == rule) {
            Some(index) => {
                rules.remove(index);
                debug!(rule = %rule.name, "removed rule");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rules(&self) -> Result<Vec<FirewallRule>, FirewallError> {
        Ok(self.snapshot())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
