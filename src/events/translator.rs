//! Turns log records into failure signals.
//!
//! One subscription task runs per selector. Every record is searched with the
//! selector's pattern (or the built-in IPv4 pattern) and each `ipAddress`
//! capture is sent on the failure channel.

use regex::Regex;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{EventQuery, EventRecord, LogSource, SubscribeError, Subscription};
use crate::config::EventSelector;
use crate::telemetry::counters;

/// Time budget for searching one record.
pub const MATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the failure signal channel.
pub const FAILURE_CHANNEL_CAPACITY: usize = 1024;

const IP_ADDRESS_GROUP: &str = "ipAddress";

const DEFAULT_IPV4_PATTERN: &str = r"(?<ipAddress>\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9]{1,2})\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9]{1,2})\b)";

/// Fatal translator construction error.
#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error(
        "pattern {pattern:?} does not contain a named capturing group \"ipAddress\"; \
         use a group like (?<ipAddress>(?:\\d{{1,3}}\\.){{3}}\\d{{1,3}})"
    )]
    MissingCaptureGroup { pattern: String },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to subscribe to log {log}: {source}")]
    Subscribe {
        log: String,
        #[source]
        source: SubscribeError,
    },
}

/// Compile an address pattern, requiring the `ipAddress` group.
pub fn compile_pattern(pattern: &str) -> Result<Regex, TranslatorError> {
    let regex = Regex::new(pattern).map_err(|source| TranslatorError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;

    if !regex.capture_names().flatten().any(|name| name == IP_ADDRESS_GROUP) {
        return Err(TranslatorError::MissingCaptureGroup {
            pattern: pattern.to_string(),
        });
    }

    Ok(regex)
}

fn default_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(DEFAULT_IPV4_PATTERN).expect("default IPv4 pattern is valid"))
}

fn find_addresses(pattern: &Regex, text: &str) -> Vec<Ipv4Addr> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.name(IP_ADDRESS_GROUP))
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// A selector with its query and compiled pattern.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    selector: EventSelector,
    query: EventQuery,
    pattern: Regex,
}

impl CompiledSelector {
    pub fn new(selector: EventSelector) -> Result<Self, TranslatorError> {
        let pattern = match selector.ip_address_pattern.as_deref() {
            Some(pattern) => compile_pattern(pattern)?,
            None => default_pattern().clone(),
        };

        Ok(Self {
            query: EventQuery::from_selector(&selector),
            selector,
            pattern,
        })
    }

    pub fn selector(&self) -> &EventSelector {
        &self.selector
    }

    pub fn query(&self) -> &EventQuery {
        &self.query
    }

    /// Text to search: the indexed value of the named field if configured,
    /// else the indexed property.
    pub fn extract_text<'a>(&self, record: &'a EventRecord) -> Option<&'a str> {
        let index = self.selector.ip_address_event_data_index;
        match self.selector.ip_address_event_data_name.as_deref() {
            Some(name) => record.field_values(name).get(index).map(String::as_str),
            None => record.property(index),
        }
    }

    /// Every address in `text`. Captures that are not IPv4 addresses are skipped.
    pub fn addresses_in(&self, text: &str) -> Vec<Ipv4Addr> {
        find_addresses(&self.pattern, text)
    }

    /// Addresses in a record, searched under [`MATCH_TIMEOUT`].
    pub async fn translate(&self, record: &EventRecord) -> Vec<Ipv4Addr> {
        let Some(text) = self.extract_text(record) else {
            return Vec::new();
        };

        trace!(text, "searching for IPv4 address");

        let pattern = self.pattern.clone();
        let text = text.to_string();
        let search = tokio::task::spawn_blocking(move || find_addresses(&pattern, &text));

        search_within(record, MATCH_TIMEOUT, search).await
    }
}

/// Await an address search for at most `budget`. A search that runs over is
/// logged and counted, and yields no addresses.
async fn search_within<F>(record: &EventRecord, budget: Duration, search: F) -> Vec<Ipv4Addr>
where
    F: Future<Output = Result<Vec<Ipv4Addr>, JoinError>>,
{
    match tokio::time::timeout(budget, search).await {
        Ok(Ok(addresses)) => addresses,
        Ok(Err(e)) => {
            warn!(error = %e, "address search task failed");
            Vec::new()
        }
        Err(_) => {
            counters::match_timed_out();
            warn!(
                record_id = ?record.record_id,
                event_id = record.event_id,
                provider = %record.provider_name,
                log = %record.log_name,
                timeout = ?budget,
                "searching for IP address took too long, ignoring this event"
            );
            Vec::new()
        }
    }
}

/// Running set of selector subscriptions.
pub struct EventTranslator {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EventTranslator {
    /// Compile every selector, then subscribe each one.
    ///
    /// Selectors whose log is missing or inaccessible are skipped with a warning.
    /// Any other error stops the subscriptions already started and is returned.
    pub async fn start(
        selectors: &[EventSelector],
        source: &dyn LogSource,
    ) -> Result<(Self, mpsc::Receiver<Ipv4Addr>), TranslatorError> {
        let compiled = selectors
            .iter()
            .cloned()
            .map(CompiledSelector::new)
            .collect::<Result<Vec<_>, _>>()?;

        let (tx, rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(compiled.len());

        for selector in compiled {
            let query = selector.query().clone();

            match source.subscribe(query.clone()).await {
                Ok(subscription) => {
                    info!(
                        log = %query.log_name,
                        event_id = query.event_id,
                        source = query.provider.as_deref().unwrap_or("any"),
                        "listening for log records"
                    );

                    tasks.push(tokio::spawn(run_subscription(
                        selector,
                        subscription,
                        tx.clone(),
                        cancel.child_token(),
                    )));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        log = %query.log_name,
                        event_id = query.event_id,
                        error = %e,
                        "failed to listen for events, skipping this selector"
                    );
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(TranslatorError::Subscribe {
                        log: query.log_name,
                        source: e,
                    });
                }
            }
        }

        Ok((Self { cancel, tasks }, rx))
    }

    /// Number of subscriptions that were enabled.
    pub fn active_subscriptions(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Stop every subscription. Safe to call more than once.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Stop every subscription and wait for the tasks to exit.
    pub async fn shutdown(mut self) {
        self.dispose();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for EventTranslator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_subscription(
    selector: CompiledSelector,
    mut subscription: Subscription,
    tx: mpsc::Sender<Ipv4Addr>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = subscription.next() => match record {
                Some(record) => record,
                None => break,
            },
        };

        trace!(
            log = %record.log_name,
            event_id = record.event_id,
            provider = %record.provider_name,
            "received log record"
        );

        for address in selector.translate(&record).await {
            info!(
                address = %address,
                log = %record.log_name,
                event_id = record.event_id,
                source = %record.provider_name,
                "authentication failure detected"
            );

            if tx.send(address).await.is_err() {
                debug!(log = %record.log_name, "failure receiver closed");
                return;
            }
        }
    }

    debug!(log = %selector.query().log_name, "subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(pattern: Option<&str>) -> EventSelector {
        EventSelector {
            log_name: "Application".to_string(),
            event_id: 0,
            source: Some("sshd".to_string()),
            ip_address_pattern: pattern.map(str::to_string),
            ip_address_event_data_name: None,
            ip_address_event_data_index: 0,
            event_predicate: None,
        }
    }

    #[test]
    fn test_compile_pattern_requires_group() {
        assert!(matches!(
            compile_pattern("hello"),
            Err(TranslatorError::MissingCaptureGroup { .. })
        ));
        assert!(matches!(
            compile_pattern("(?<ipAddress>"),
            Err(TranslatorError::InvalidPattern { .. })
        ));
        assert!(compile_pattern(r"from (?<ipAddress>\S+)").is_ok());
    }

    #[test]
    fn test_missing_group_message_mentions_group() {
        let err = compile_pattern("hello").unwrap_err();
        assert!(err.to_string().contains("ipAddress"));
    }

    #[test]
    fn test_default_pattern_finds_all_addresses() {
        let compiled = CompiledSelector::new(selector(None)).unwrap();
        let addresses = compiled.addresses_in("from 192.0.2.1 via 198.51.100.20, not 300.1.1.1");

        assert_eq!(
            addresses,
            vec![Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(198, 51, 100, 20)]
        );
    }

    #[test]
    fn test_custom_pattern() {
        let compiled = CompiledSelector::new(selector(Some(
            r"^sshd: PID \d+: Failed password for(?: invalid user)? \S+ from (?<ipAddress>(?:\d{1,3}\.){3}\d{1,3}) port \d+ ssh\d?$",
        )))
        .unwrap();

        let addresses = compiled.addresses_in(
            "sshd: PID 29722: Failed password for invalid user root from 71.194.180.25 port 48316 ssh2",
        );
        assert_eq!(addresses, vec![Ipv4Addr::new(71, 194, 180, 25)]);
    }

    #[test]
    fn test_unparseable_capture_skipped() {
        let compiled = CompiledSelector::new(selector(Some(r"(?<ipAddress>\d+\.\d+\.\d+\.\d+)"))).unwrap();
        assert!(compiled.addresses_in("999.1.1.1").is_empty());
    }

    #[test]
    fn test_extract_text_by_field() {
        let mut config = selector(None);
        config.ip_address_event_data_name = Some("IpAddress".to_string());
        let compiled = CompiledSelector::new(config).unwrap();

        let record = EventRecord::new("Security", 4625, "auditing")
            .with_property("10.0.0.1")
            .with_field("IpAddress", "141.98.9.20");

        assert_eq!(compiled.extract_text(&record), Some("141.98.9.20"));
    }

    #[test]
    fn test_extract_text_indexes_field_values() {
        let mut config = selector(None);
        config.ip_address_event_data_name = Some("IpAddress".to_string());
        config.ip_address_event_data_index = 1;
        let compiled = CompiledSelector::new(config).unwrap();

        let single = EventRecord::new("Security", 4625, "auditing")
            .with_property("10.0.0.1")
            .with_property("10.0.0.2")
            .with_field("IpAddress", "141.98.9.20");
        assert_eq!(compiled.extract_text(&single), None);

        let repeated = single.clone().with_field("IpAddress", "141.98.9.21");
        assert_eq!(compiled.extract_text(&repeated), Some("141.98.9.21"));
    }

    #[test]
    fn test_extract_text_by_index() {
        let mut config = selector(None);
        config.ip_address_event_data_index = 1;
        let compiled = CompiledSelector::new(config).unwrap();

        let record = EventRecord::new("Application", 0, "sshd")
            .with_property("first")
            .with_property("second");
        assert_eq!(compiled.extract_text(&record), Some("second"));

        let empty = EventRecord::new("Application", 0, "sshd");
        assert_eq!(compiled.extract_text(&empty), None);
    }

    #[tokio::test]
    async fn test_translate_record_without_text() {
        let compiled = CompiledSelector::new(selector(None)).unwrap();
        let record = EventRecord::new("Application", 0, "sshd");
        assert!(compiled.translate(&record).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_timeout_discards_only_that_record() {
        let compiled = CompiledSelector::new(selector(None)).unwrap();
        let stuck = EventRecord::new("Application", 0, "sshd")
            .with_record_id(1)
            .with_property("from 192.0.2.1");

        let started = tokio::time::Instant::now();
        let never = std::future::pending::<Result<Vec<Ipv4Addr>, JoinError>>();
        assert!(search_within(&stuck, MATCH_TIMEOUT, never).await.is_empty());
        assert!(started.elapsed() >= MATCH_TIMEOUT);

        let next = EventRecord::new("Application", 0, "sshd")
            .with_record_id(2)
            .with_property("from 198.51.100.7");
        assert_eq!(compiled.translate(&next).await, vec![Ipv4Addr::new(198, 51, 100, 7)]);
    }

    #[tokio::test]
    async fn test_search_failure_yields_nothing() {
        let record = EventRecord::new("Application", 0, "sshd");
        let panicked = tokio::task::spawn_blocking(|| -> Vec<Ipv4Addr> { panic!("search panicked") });
        assert!(search_within(&record, MATCH_TIMEOUT, panicked).await.is_empty());
    }
}
