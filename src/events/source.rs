//! Log source trait and record types.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EventSelector;

/// Error raised when enabling a subscription.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The named log does not exist.
    #[error("log not found: {0}")]
    LogNotFound(String),

    /// The process may not read (or create) the named log.
    #[error("access denied to log {log}: {reason}")]
    AccessDenied { log: String, reason: String },

    /// Any other failure.
    #[error("subscription failed: {0}")]
    Other(String),
}

impl SubscribeError {
    /// Whether the failure only disables this subscription.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LogNotFound(_) | Self::AccessDenied { .. })
    }
}

/// What a subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub log_name: String,
    pub event_id: u32,
    /// Provider (source) name, any provider when `None`
    pub provider: Option<String>,
    /// Extra filter clause appended verbatim
    pub predicate: Option<String>,
}

impl EventQuery {
    pub fn new(log_name: impl Into<String>, event_id: u32) -> Self {
        Self {
            log_name: log_name.into(),
            event_id,
            provider: None,
            predicate: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Build the query for a selector. Blank provider and predicate are ignored.
    pub fn from_selector(selector: &EventSelector) -> Self {
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
        };

        Self {
            log_name: selector.log_name.clone(),
            event_id: selector.event_id,
            provider: non_blank(&selector.source),
            predicate: non_blank(&selector.event_predicate),
        }
    }

    /// Canonical filter text, e.g. `*[System/EventID=0][System/Provider/@Name="sshd"]`.
    pub fn filter(&self) -> String {
        let mut filter = format!("*[System/EventID={}]", self.event_id);

        if let Some(provider) = &self.provider {
            filter.push_str(&format!(
                "[System/Provider/@Name=\"{}\"]",
                escape_xml(provider)
            ));
        }

        if let Some(predicate) = &self.predicate {
            filter.push_str(predicate);
        }

        filter
    }

    /// Check log name, event id and provider. The predicate is source-specific.
    pub fn matches(&self, record: &EventRecord) -> bool {
        record.log_name == self.log_name
            && record.event_id == self.event_id
            && self
                .provider
                .as_deref()
                .map_or(true, |p| p.eq_ignore_ascii_case(&record.provider_name))
    }
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '&' => escaped.push_str("&amp;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// A delivered log record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRecord {
    pub log_name: String,
    pub event_id: u32,
    pub record_id: Option<u64>,
    pub provider_name: String,
    /// Ordered event properties
    pub properties: Vec<String>,
    /// Named data fields. A name may carry several values, in record order.
    pub fields: HashMap<String, Vec<String>>,
}

impl EventRecord {
    pub fn new(log_name: impl Into<String>, event_id: u32, provider_name: impl Into<String>) -> Self {
        Self {
            log_name: log_name.into(),
            event_id,
            provider_name: provider_name.into(),
            ..Default::default()
        }
    }

    pub fn with_record_id(mut self, record_id: u64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn with_property(mut self, value: impl Into<String>) -> Self {
        self.properties.push(value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Property at `index`.
    pub fn property(&self, index: usize) -> Option<&str> {
        self.properties.get(index).map(String::as_str)
    }

    /// First rendered value of a named field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.field_values(name).first().map(String::as_str)
    }

    /// Every rendered value of a named field.
    pub fn field_values(&self, name: &str) -> &[String] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

/// A live subscription.
///
/// Dropping the subscription stops its producer.
pub struct Subscription {
    records: mpsc::Receiver<EventRecord>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(records: mpsc::Receiver<EventRecord>, cancel: CancellationToken) -> Self {
        Self { records, cancel }
    }

    /// Next record, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<EventRecord> {
        self.records.recv().await
    }

    /// Token cancelled when the subscription is released.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Source of live log records.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Enable a live subscription. Only records written after this call are delivered.
    async fn subscribe(&self, query: EventQuery) -> Result<Subscription, SubscribeError>;

    /// Source name for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(source: Option<&str>, predicate: Option<&str>) -> EventSelector {
        EventSelector {
            log_name: "Application".to_string(),
            event_id: 0,
            source: source.map(str::to_string),
            ip_address_pattern: None,
            ip_address_event_data_name: None,
            ip_address_event_data_index: 0,
            event_predicate: predicate.map(str::to_string),
        }
    }

    #[test]
    fn test_filter_without_provider() {
        let query = EventQuery::new("Security", 4625);
        assert_eq!(query.filter(), "*[System/EventID=4625]");
    }

    #[test]
    fn test_filter_with_provider() {
        let query = EventQuery::from_selector(&selector(Some("sshd"), None));
        assert_eq!(query.filter(), "*[System/EventID=0][System/Provider/@Name=\"sshd\"]");
    }

    #[test]
    fn test_filter_escapes_provider_and_appends_predicate() {
        let query = EventQuery::from_selector(&selector(
            Some("a\"b&c"),
            Some("[EventData/Data[@Name=\"LogonType\"]=3]"),
        ));
        assert_eq!(
            query.filter(),
            "*[System/EventID=0][System/Provider/@Name=\"a&quot;b&amp;c\"][EventData/Data[@Name=\"LogonType\"]=3]"
        );
    }

    #[test]
    fn test_blank_selector_values_ignored() {
        let query = EventQuery::from_selector(&selector(Some("  "), Some("")));
        assert_eq!(query.provider, None);
        assert_eq!(query.predicate, None);
    }

    #[test]
    fn test_matches() {
        let query = EventQuery::new("Application", 0).with_provider("sshd");

        assert!(query.matches(&EventRecord::new("Application", 0, "SSHD")));
        assert!(!query.matches(&EventRecord::new("Application", 0, "cron")));
        assert!(!query.matches(&EventRecord::new("Application", 1, "sshd")));
        assert!(!query.matches(&EventRecord::new("System", 0, "sshd")));
        assert!(EventQuery::new("Application", 0).matches(&EventRecord::new("Application", 0, "any")));
    }

    #[test]
    fn test_record_accessors() {
        let record = EventRecord::new("Security", 4625, "Microsoft-Windows-Security-Auditing")
            .with_property("first")
            .with_field("IpAddress", "192.0.2.1");

        assert_eq!(record.property(0), Some("first"));
        assert_eq!(record.property(1), None);
        assert_eq!(record.field("IpAddress"), Some("192.0.2.1"));
        assert_eq!(record.field("Missing"), None);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SubscribeError::LogNotFound("x".into()).is_recoverable());
        assert!(SubscribeError::AccessDenied { log: "x".into(), reason: "y".into() }.is_recoverable());
        assert!(!SubscribeError::Other("x".into()).is_recoverable());
    }
}
