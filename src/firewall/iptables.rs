//! iptables-backed rule store.
//!
//! Ban rules live in a dedicated chain jumped to from `INPUT`. Rule name,
//! group and description are packed into the iptables comment as
//! `group|name|description`, so the rule listing alone is enough to rebuild
//! every [`FirewallRule`].

use async_trait::async_trait;
use ipnet::Ipv4Net;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::{FirewallError, FirewallRule, RuleAction, RuleDirection, RuleStore};
use crate::config::{parse_network, FirewallBackendConfig};

const COMMENT_SEPARATOR: char = '|';

/// iptables rule store.
pub struct IptablesRuleStore {
    binary: PathBuf,
    chain: String,
    ready: OnceCell<()>,
}

impl IptablesRuleStore {
    /// Create a store using the configured binary and chain.
    pub fn new(config: &FirewallBackendConfig) -> Self {
        Self {
            binary: config.iptables_path.clone(),
            chain: config.chain.clone(),
            ready: OnceCell::new(),
        }
    }

    /// Chain holding the ban rules.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    async fn run(&self, args: &[&str]) -> Result<String, FirewallError> {
        trace!(binary = %self.binary.display(), ?args, "running iptables");

        let output = Command::new(&self.binary).arg("-w").args(args).output().await?;

        if !output.status.success() {
            return Err(FirewallError::CommandFailed {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Create the chain and hook it into INPUT if needed.
    async fn ensure_chain(&self) -> Result<(), FirewallError> {
        self.ready
            .get_or_try_init(|| async {
                match self.run(&["-N", &self.chain]).await {
                    Ok(_) => info!(chain = %self.chain, "created iptables chain"),
                    Err(FirewallError::CommandFailed { stderr, .. })
                        if stderr.contains("exists") =>
                    {
                        debug!(chain = %self.chain, "iptables chain already exists");
                    }
                    Err(e) => return Err(e),
                }

                if self.run(&["-C", "INPUT", "-j", &self.chain]).await.is_err() {
                    self.run(&["-I", "INPUT", "-j", &self.chain]).await?;
                    info!(chain = %self.chain, "hooked chain into INPUT");
                }

                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn rule_specs(rule: &FirewallRule) -> Result<Vec<(String, String)>, FirewallError> {
        if rule.action != RuleAction::Block || rule.direction != RuleDirection::Inbound {
            return Err(FirewallError::Unsupported(format!(
                "{}: only inbound block rules are supported",
                rule.name
            )));
        }

        let comment = encode_comment(rule)?;
        Ok(rule
            .remote_addresses
            .iter()
            .map(|network| (network.to_string(), comment.clone()))
            .collect())
    }
}

#[async_trait]
impl RuleStore for IptablesRuleStore {
    async fn add(&self, rule: FirewallRule) -> Result<(), FirewallError> {
        self.ensure_chain().await?;

        for (source, comment) in Self::rule_specs(&rule)? {
            self.run(&[
                "-A", &self.chain, "-s", &source, "-m", "comment", "--comment", &comment, "-j",
                "DROP",
            ])
            .await?;
        }

        debug!(rule = %rule.name, chain = %self.chain, "added iptables rule");
        Ok(())
    }

    async fn remove(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        self.ensure_chain().await?;

        let mut removed = false;
        for (source, comment) in Self::rule_specs(rule)? {
            let result = self
                .run(&[
                    "-D", &self.chain, "-s", &source, "-m", "comment", "--comment", &comment,
                    "-j", "DROP",
                ])
                .await;

            match result {
                Ok(_) => removed = true,
                Err(FirewallError::CommandFailed { stderr, .. })
                    if stderr.contains("does a matching rule exist") => {}
                Err(e) => return Err(e),
            }
        }

        Ok(removed)
    }

    async fn rules(&self) -> Result<Vec<FirewallRule>, FirewallError> {
        self.ensure_chain().await?;
        let listing = self.run(&["-S", &self.chain]).await?;
        parse_listing(&self.chain, &listing)
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}

fn encode_comment(rule: &FirewallRule) -> Result<String, FirewallError> {
    if rule.group.contains(COMMENT_SEPARATOR) || rule.name.contains(COMMENT_SEPARATOR) {
        return Err(FirewallError::Unsupported(format!(
            "{}: group and name must not contain '{}'",
            rule.name, COMMENT_SEPARATOR
        )));
    }

    Ok(format!(
        "{}{sep}{}{sep}{}",
        rule.group,
        rule.name,
        rule.description,
        sep = COMMENT_SEPARATOR
    ))
}

fn decode_comment(comment: &str) -> (String, String, String) {
    let mut parts = comment.splitn(3, COMMENT_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(group), Some(name), Some(description)) => {
            (group.to_string(), name.to_string(), description.to_string())
        }
        _ => (String::new(), comment.to_string(), String::new()),
    }
}

fn listing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"^-A (?P<chain>\S+) -s (?P<source>\S+) -m comment --comment (?P<comment>"(?:[^"\\]|\\.)*"|\S+) -j DROP$"#,
        )
        .expect("iptables listing pattern is valid")
    })
}

fn unquote(value: &str) -> String {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse `iptables -S <chain>` output into rules.
///
/// Lines that are not commented DROP rules (the `-N` header, foreign rules)
/// are skipped.
pub(crate) fn parse_listing(chain: &str, listing: &str) -> Result<Vec<FirewallRule>, FirewallError> {
    let mut rules = Vec::new();

    for line in listing.lines().map(str::trim) {
        let Some(caps) = listing_pattern().captures(line) else {
            continue;
        };

        if &caps["chain"] != chain {
            continue;
        }

        let network: Ipv4Net = parse_network(&caps["source"]).map_err(FirewallError::Parse)?;
        let (group, name, description) = decode_comment(&unquote(&caps["comment"]));

        rules.push(FirewallRule::block_inbound(name, group, description, network));
    }

    Ok(rules)
}
