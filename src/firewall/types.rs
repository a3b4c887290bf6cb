//! Firewall rule types.

use ipnet::Ipv4Net;
use thiserror::Error;

/// What a rule does with matching traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RuleAction {
    #[default]
    Block,
    Allow,
}

/// Traffic direction a rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RuleDirection {
    #[default]
    Inbound,
    Outbound,
}

/// Network profiles a rule is scoped to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RuleProfile {
    /// Every profile (domain, private and public)
    #[default]
    All,
    Domain,
    Private,
    Public,
}

/// A firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    /// Rule name
    pub name: String,
    /// Group tag used to find rules owned by one service
    pub group: String,
    /// Free-form description
    pub description: String,
    pub action: RuleAction,
    pub direction: RuleDirection,
    pub profile: RuleProfile,
    /// Remote networks the rule matches
    pub remote_addresses: Vec<Ipv4Net>,
    pub enabled: bool,
}

impl FirewallRule {
    /// Rule blocking all inbound traffic from one network on every profile.
    pub fn block_inbound(
        name: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
        network: Ipv4Net,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            description: description.into(),
            action: RuleAction::Block,
            direction: RuleDirection::Inbound,
            profile: RuleProfile::All,
            remote_addresses: vec![network],
            enabled: true,
        }
    }

    /// Check whether the rule belongs to the given group.
    pub fn in_group(&self, group: &str) -> bool {
        self.group == group
    }
}

/// Rule store error.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// External command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rule listing could not be parsed.
    #[error("failed to parse rule: {0}")]
    Parse(String),

    /// Rule cannot be represented by the backend.
    #[error("unsupported rule: {0}")]
    Unsupported(String),

    /// Backend-specific error.
    #[error("backend error: {0}")]
    Backend(String),
}
