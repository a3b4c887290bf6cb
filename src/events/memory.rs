//! In-process log source.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{EventQuery, EventRecord, LogSource, SubscribeError, Subscription};

const SUBSCRIPTION_BUFFER: usize = 256;

struct Subscriber {
    query: EventQuery,
    tx: mpsc::Sender<EventRecord>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Default)]
struct Log {
    denied: bool,
    subscribers: Vec<Subscriber>,
}

/// Log source whose logs are registered by name and fed programmatically.
#[derive(Default)]
pub struct MemoryLogSource {
    logs: RwLock<HashMap<String, Log>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log. Existing logs are left untouched.
    pub fn register_log(&self, name: impl Into<String>) {
        self.logs.write().entry(name.into()).or_default();
    }

    /// Make future subscriptions to `name` fail with access denied.
    pub fn deny_access(&self, name: impl Into<String>) {
        self.logs.write().entry(name.into()).or_default().denied = true;
    }

    /// Number of live subscriptions to `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.logs.read().get(name).map_or(0, |log| {
            log.subscribers.iter().filter(|s| !s.is_closed()).count()
        })
    }

    /// Deliver a record to every matching subscription. Returns the number of deliveries.
    pub async fn publish(&self, record: EventRecord) -> usize {
        let targets: Vec<mpsc::Sender<EventRecord>> = {
            let mut logs = self.logs.write();
            let Some(log) = logs.get_mut(&record.log_name) else {
                return 0;
            };

            log.subscribers.retain(|s| !s.is_closed());
            log.subscribers
                .iter()
                .filter(|s| s.query.matches(&record))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(record.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        trace!(log = %record.log_name, event_id = record.event_id, delivered, "published record");
        delivered
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn subscribe(&self, query: EventQuery) -> Result<Subscription, SubscribeError> {
        let mut logs = self.logs.write();
        let log = logs
            .get_mut(&query.log_name)
            .ok_or_else(|| SubscribeError::LogNotFound(query.log_name.clone()))?;

        if log.denied {
            return Err(SubscribeError::AccessDenied {
                log: query.log_name.clone(),
                reason: "access to log denied".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();

        log.subscribers.push(Subscriber {
            query,
            tx,
            cancel: cancel.clone(),
        });

        Ok(Subscription::new(rx, cancel))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
