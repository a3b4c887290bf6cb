//! The ban engine.
//!
//! Failure signals are aggregated per [`NetworkKey`]. Recording a failure,
//! evaluating the ban predicate and applying the ban happen under that
//! network's lock, so decisions for one network are serialized while
//! different networks proceed in parallel.
//!
//! On start the engine reconciles the rules left by a previous run (delete all,
//! or resume their unban timers). New bans wait until that pass has finished.

use chrono::Utc;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::policy::BanPolicy;
use super::state::{is_ban_rule, BanState};
use super::timer::UnbanScheduler;
use super::{prefix_len_for, FailureHistory, NetworkKey};
use crate::config::BanSettings;
use crate::firewall::{FirewallError, FirewallRule, RuleStore, SharedRuleStore};
use crate::telemetry::counters;

type SharedHistory = Arc<Mutex<FailureHistory>>;

/// Aggregates failures and manages ban rules.
pub struct BanEngine {
    policy: BanPolicy,
    prefix_len: u8,
    store: SharedRuleStore,
    histories: DashMap<NetworkKey, SharedHistory>,
    /// Offense numbers read from surviving rules, applied on the next ban
    recovered_offenses: DashMap<NetworkKey, u32>,
    scheduler: UnbanScheduler,
    cancel: CancellationToken,
    ready: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl BanEngine {
    /// Create the engine and start reconciling existing rules in the background.
    pub fn start(settings: BanSettings, store: SharedRuleStore) -> Arc<Self> {
        if settings.dry_run {
            warn!(
                "started in dry run mode, no firewall rules will be changed; \
                 set bans.dry_run to false to actually ban networks"
            );
        }

        let cancel = CancellationToken::new();
        let (ready, _) = watch::channel(false);

        let engine = Arc::new(Self {
            prefix_len: prefix_len_for(settings.subnet_bits()),
            policy: BanPolicy::new(settings),
            store,
            histories: DashMap::new(),
            recovered_offenses: DashMap::new(),
            scheduler: UnbanScheduler::new(cancel.child_token()),
            cancel,
            ready,
            disposed: AtomicBool::new(false),
        });

        let recovery = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::select! {
                _ = recovery.cancel.cancelled() => {}
                result = recovery.recover() => {
                    if let Err(e) = result {
                        error!(error = %e, "failed to reconcile existing ban rules");
                    }
                }
            }

            // opened even after a failed pass so bans are not blocked forever
            recovery.ready.send_replace(true);
        });

        engine
    }

    pub fn settings(&self) -> &BanSettings {
        self.policy.settings()
    }

    /// Network key an address is aggregated under.
    pub fn network_for(&self, address: Ipv4Addr) -> NetworkKey {
        NetworkKey::from_address(address, self.prefix_len)
    }

    /// Ban length for the given offense number.
    pub fn ban_duration(&self, offense: u32) -> Duration {
        self.policy.ban_duration(offense)
    }

    /// Number of scheduled unbans.
    pub fn pending_unbans(&self) -> usize {
        self.scheduler.len()
    }

    /// Number of networks with a failure history.
    pub fn tracked_networks(&self) -> usize {
        self.histories.len()
    }

    /// Snapshot of a network's history.
    pub async fn history(&self, network: &NetworkKey) -> Option<FailureHistory> {
        let history = self.histories.get(network)?.clone();
        let snapshot = history.lock().await.clone();
        Some(snapshot)
    }

    /// Wait until startup reconciliation finished. Returns `false` if disposed first.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.subscribe();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = ready.wait_for(|ready| *ready) => result.is_ok(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Consume failure signals, handling each on its own task.
    pub fn attach(self: &Arc<Self>, mut failures: mpsc::Receiver<Ipv4Addr>) -> JoinHandle<()> {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let address = tokio::select! {
                    biased;
                    _ = engine.cancel.cancelled() => break,
                    address = failures.recv() => match address {
                        Some(address) => address,
                        None => break,
                    },
                };

                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.on_failure(address).await });
            }

            debug!("failure dispatcher stopped");
        })
    }

    /// Record one failure from `address` and ban its network if warranted.
    pub async fn on_failure(&self, address: Ipv4Addr) {
        if self.cancel.is_cancelled() {
            return;
        }

        let network = self.network_for(address);
        let history = self.histories.entry(network).or_default().clone();
        let mut history = history.lock().await;

        let now = Instant::now();
        history.record(now);
        counters::failure_recorded();

        if self.should_ban(&network, &mut history, now).await {
            self.ban(network, &mut history).await;
        }
    }

    async fn should_ban(&self, network: &NetworkKey, history: &mut FailureHistory, now: Instant) -> bool {
        // prunes the history even for exempt networks
        let failures = history.count_within(now, self.settings().failure_window);

        if let Some(exemption) = self.policy.exemption(network) {
            debug!(network = %network, reason = %exemption, "not banning");
            return false;
        }

        if let Some(exemption) = self.policy.check_threshold(failures) {
            debug!(
                network = %network,
                window = ?self.settings().failure_window,
                reason = %exemption,
                "not banning"
            );
            return false;
        }

        match self.store.find(&|rule: &FirewallRule| is_ban_rule(rule, Some(network))).await {
            Ok(existing) if !existing.is_empty() => {
                debug!(network = %network, "not banning, already banned");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(network = %network, error = %e, "failed to list firewall rules, not banning");
                false
            }
        }
    }

    async fn ban(&self, network: NetworkKey, history: &mut FailureHistory) {
        if !self.wait_ready().await {
            return;
        }

        if let Some((_, offense)) = self.recovered_offenses.remove(&network) {
            history.restore_ban_count(offense);
        }

        let offense = history.ban_count().saturating_add(1);
        let duration = self.policy.ban_duration(offense);
        let state = BanState::new(network, Utc::now(), duration, offense);

        if self.settings().dry_run {
            history.increment_ban_count();
            counters::ban_applied(true);
            info!(
                network = %network,
                offense,
                unban_at = %state.unban_at,
                ?duration,
                "would have added firewall rule, but dry run mode is enabled"
            );
        } else {
            if let Err(e) = self.store.add(state.to_rule()).await {
                error!(network = %network, error = %e, "failed to add firewall rule");
                return;
            }

            history.increment_ban_count();
            history.clear();
            counters::ban_applied(false);
            info!(
                network = %network,
                offense,
                unban_at = %state.unban_at,
                ?duration,
                "added firewall rule to block inbound traffic"
            );
        }

        self.schedule_unban(network, duration);
    }

    fn schedule_unban(&self, network: NetworkKey, delay: Duration) {
        let store = Arc::clone(&self.store);
        let dry_run = self.settings().dry_run;

        self.scheduler.schedule(network, delay, move || async move {
            unban(store.as_ref(), &network, dry_run).await;
        });
    }

    async fn recover(&self) -> Result<(), FirewallError> {
        let existing = self
            .store
            .find(&|rule: &FirewallRule| is_ban_rule(rule, None))
            .await?;

        if existing.is_empty() {
            debug!("no existing ban rules");
            return Ok(());
        }

        let dry_run = self.settings().dry_run;

        if self.settings().unban_all_on_startup {
            info!(
                count = existing.len(),
                "deleting existing ban rules after restart; set bans.unban_all_on_startup to false to keep them"
            );

            if !dry_run {
                for rule in &existing {
                    self.remove_rule(rule).await;
                }
            }

            return Ok(());
        }

        let now = Utc::now();
        let mut resumed = 0usize;

        for rule in existing {
            let state = match BanState::from_rule(&rule) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        rule = %rule.name,
                        description = %rule.description,
                        error = %e,
                        "deleting malformed ban rule"
                    );
                    if !dry_run {
                        self.remove_rule(&rule).await;
                    }
                    continue;
                }
            };

            self.recovered_offenses
                .entry(state.network)
                .and_modify(|offense| *offense = (*offense).max(state.offense))
                .or_insert(state.offense);

            match state.remaining(now) {
                Some(remaining) => {
                    self.schedule_unban(state.network, remaining);
                    resumed += 1;
                    debug!(
                        network = %state.network,
                        unban_at = %state.unban_at,
                        ?remaining,
                        "resumed unban timer"
                    );
                }
                None if !dry_run => {
                    info!(
                        network = %state.network,
                        rule = %rule.name,
                        "ban expired while not running, removing firewall rule"
                    );
                    self.remove_rule(&rule).await;
                }
                None => {}
            }
        }

        info!(resumed, "resumed unban timers after restart");
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) {
        match self.store.remove(rule).await {
            Ok(_) => counters::unban_applied(),
            Err(e) => {
                counters::unban_failed();
                error!(rule = %rule.name, error = %e, "failed to remove firewall rule");
            }
        }
    }

    /// Stop accepting failures and cancel every pending unban. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        self.scheduler.cancel_all();
        info!("ban engine stopped");
    }
}

impl Drop for BanEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Remove every rule of ours for `network`. Returns the number removed.
///
/// Failures are logged and not retried.
pub(crate) async fn unban(store: &dyn RuleStore, network: &NetworkKey, dry_run: bool) -> usize {
    let rules = match store.find(&|rule: &FirewallRule| is_ban_rule(rule, Some(network))).await {
        Ok(rules) => rules,
        Err(e) => {
            counters::unban_failed();
            error!(network = %network, error = %e, "failed to list firewall rules for unban");
            return 0;
        }
    };

    let mut removed = 0;
    for rule in rules {
        info!(network = %network, rule = %rule.name, "ban has expired, removing firewall rule");

        if dry_run {
            continue;
        }

        match store.remove(&rule).await {
            Ok(_) => {
                removed += 1;
                counters::unban_applied();
            }
            Err(e) => {
                counters::unban_failed();
                error!(network = %network, rule = %rule.name, error = %e, "failed to remove firewall rule");
            }
        }
    }

    removed
}
