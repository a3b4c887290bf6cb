use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, span, warn, Instrument, Level};

use crate::ban::BanEngine;
use crate::config::{Config, FirewallBackend};
use crate::events::{EventTranslator, FileLogSource, LogSource};
use crate::firewall::{IptablesRuleStore, MemoryRuleStore, SharedRuleStore};

/// The banwarden daemon.
///
/// Wires the log source, translator, ban engine and rule store together:
/// - translator: one subscription per selector, emits failing addresses
/// - ban engine: aggregates failures, adds and expires ban rules
/// - rule store: the configured firewall backend
pub struct Service {
    config: Arc<Config>,
    store: SharedRuleStore,
    source: Arc<dyn LogSource>,
}

impl Service {
    /// Build the service with the configured firewall backend and the file log source.
    pub fn new(config: Config) -> Result<Self> {
        let store: SharedRuleStore = match config.firewall.backend {
            FirewallBackend::Iptables => Arc::new(IptablesRuleStore::new(&config.firewall)),
            FirewallBackend::Memory => {
                warn!("using in-memory firewall backend, bans will not block any traffic");
                Arc::new(MemoryRuleStore::new())
            }
        };

        Ok(Self::with_components(config, store, Arc::new(FileLogSource::new())))
    }

    /// Build the service around an explicit rule store and log source.
    pub fn with_components(config: Config, store: SharedRuleStore, source: Arc<dyn LogSource>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            source,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the engine and subscribe every selector.
    pub async fn start(&self) -> Result<RunningService> {
        info!(
            selectors = self.config.selectors.len(),
            firewall = self.store.name(),
            source = self.source.name(),
            dry_run = self.config.bans.dry_run,
            "starting banwarden"
        );

        let engine = BanEngine::start(self.config.bans.clone(), Arc::clone(&self.store));

        let (translator, failures) = match EventTranslator::start(&self.config.selectors, self.source.as_ref()).await {
            Ok(started) => started,
            Err(e) => {
                engine.dispose();
                return Err(e).context("failed to start event translator");
            }
        };

        if translator.active_subscriptions() == 0 {
            warn!("no log selector could be subscribed, no failures will be detected");
        }

        let dispatcher = engine.attach(failures);

        info!(
            subscriptions = translator.active_subscriptions(),
            max_allowed_failures = self.config.bans.max_allowed_failures,
            failure_window = ?self.config.bans.failure_window,
            ban_period = ?self.config.bans.ban_period,
            "banwarden started"
        );

        Ok(RunningService {
            engine,
            translator,
            dispatcher,
        })
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "banwarden", version = env!("CARGO_PKG_VERSION"));

        async {
            let running = self.start().await?;

            let signal = self.wait_for_shutdown().await;
            running.stop().await;

            signal?;
            info!("banwarden stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    async fn wait_for_shutdown(&self) -> Result<()> {
        let ctrl_c = async { signal::ctrl_c().await.context("failed to listen for Ctrl+C") };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?
                .recv()
                .await;
            Ok::<(), anyhow::Error>(())
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Result<()>>();

        tokio::select! {
            result = ctrl_c => {
                info!("received SIGINT (Ctrl+C)");
                result
            }
            result = terminate => {
                info!("received SIGTERM");
                result
            }
        }
    }
}

/// A started service.
pub struct RunningService {
    engine: Arc<BanEngine>,
    translator: EventTranslator,
    dispatcher: JoinHandle<()>,
}

impl RunningService {
    pub fn engine(&self) -> &Arc<BanEngine> {
        &self.engine
    }

    pub fn translator(&self) -> &EventTranslator {
        &self.translator
    }

    /// Dispose the engine, then stop the translator.
    pub async fn stop(self) {
        self.engine.dispose();
        self.translator.shutdown().await;
        let _ = self.dispatcher.await;
    }
}
