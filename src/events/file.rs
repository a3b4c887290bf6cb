//! Text log file source.
//!
//! The log name is the file path. Each appended line becomes one record with
//! event id 0. Syslog-formatted lines are split so that the program tag becomes
//! the provider name and the message becomes property 0. The event predicate,
//! when present, is a regular expression the raw line must match.

use async_trait::async_trait;
use regex::Regex;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventQuery, EventRecord, LogSource, SubscribeError, Subscription};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SUBSCRIPTION_BUFFER: usize = 256;

/// Event id assigned to every line.
pub const LINE_EVENT_ID: u32 = 0;

/// Tails text log files.
#[derive(Debug, Clone)]
pub struct FileLogSource {
    poll_interval: Duration,
}

impl Default for FileLogSource {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl FileLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the file is checked for new data.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn map_open_error(path: &str, error: std::io::Error) -> SubscribeError {
    match error.kind() {
        ErrorKind::NotFound => SubscribeError::LogNotFound(path.to_string()),
        ErrorKind::PermissionDenied => SubscribeError::AccessDenied {
            log: path.to_string(),
            reason: error.to_string(),
        },
        _ => SubscribeError::Other(format!("{}: {}", path, error)),
    }
}

#[async_trait]
impl LogSource for FileLogSource {
    async fn subscribe(&self, query: EventQuery) -> Result<Subscription, SubscribeError> {
        let predicate = query
            .predicate
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| SubscribeError::Other(format!("invalid event predicate: {}", e)))?;

        let mut file = File::open(&query.log_name)
            .await
            .map_err(|e| map_open_error(&query.log_name, e))?;

        let metadata = file
            .metadata()
            .await
            .map_err(|e| map_open_error(&query.log_name, e))?;

        if metadata.is_dir() {
            return Err(SubscribeError::Other(format!(
                "{} is a directory",
                query.log_name
            )));
        }

        let position = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| map_open_error(&query.log_name, e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();

        let tail = Tail {
            path: PathBuf::from(&query.log_name),
            query,
            predicate,
            reader: BufReader::new(file),
            position,
            file_id: file_id(&metadata),
            pending: Vec::new(),
            line_count: 0,
            poll_interval: self.poll_interval,
        };

        tokio::spawn(tail.run(tx, cancel.clone()));

        Ok(Subscription::new(rx, cancel))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

struct Tail {
    path: PathBuf,
    query: EventQuery,
    predicate: Option<Regex>,
    reader: BufReader<File>,
    position: u64,
    file_id: Option<u64>,
    pending: Vec<u8>,
    line_count: u64,
    poll_interval: Duration,
}

impl Tail {
    async fn run(mut self, tx: mpsc::Sender<EventRecord>, cancel: CancellationToken) {
        debug!(path = %self.path.display(), "tailing log file");

        loop {
            if !self.drain(&tx).await {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            self.check_rotation().await;
        }

        debug!(path = %self.path.display(), "stopped tailing log file");
    }

    /// Read every complete line available. Returns `false` once the receiver is gone.
    async fn drain(&mut self, tx: &mpsc::Sender<EventRecord>) -> bool {
        loop {
            let mut chunk = Vec::new();
            match self.reader.read_until(b'\n', &mut chunk).await {
                Ok(0) => return true,
                Ok(n) => {
                    self.position += n as u64;
                    self.pending.extend_from_slice(&chunk);

                    if !self.pending.ends_with(b"\n") {
                        // partial line, wait for the rest
                        continue;
                    }

                    let raw = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\r', '\n']);

                    if let Some(record) = self.to_record(line) {
                        if tx.send(record).await.is_err() {
                            return false;
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to read log file");
                    return !tx.is_closed();
                }
            }
        }
    }

    fn to_record(&mut self, line: &str) -> Option<EventRecord> {
        if line.is_empty() {
            return None;
        }

        self.line_count += 1;

        if let Some(predicate) = &self.predicate {
            if !predicate.is_match(line) {
                return None;
            }
        }

        let record = parse_line(&self.query.log_name, line).with_record_id(self.line_count);
        self.query.matches(&record).then_some(record)
    }

    async fn check_rotation(&mut self) {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // mid-rotation, try again next poll
            Err(_) => return,
        };

        let replaced = match (self.file_id, file_id(&metadata)) {
            (Some(old), Some(new)) => old != new,
            _ => false,
        };

        if !replaced && metadata.len() >= self.position {
            return;
        }

        match File::open(&self.path).await {
            Ok(file) => {
                info!(
                    path = %self.path.display(),
                    replaced,
                    "log file rotated or truncated, reopening"
                );
                self.reader = BufReader::new(file);
                self.position = 0;
                self.file_id = file_id(&metadata);
                self.pending.clear();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to reopen log file");
            }
        }
    }
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

fn syslog_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}T\S+)\s+(?P<host>\S+)\s+(?P<tag>[^\s\[:]+)(?:\[(?P<pid>\d+)\])?:\s?(?P<message>.*)$",
        )
        .expect("syslog pattern is valid")
    })
}

/// Turn one log line into a record.
pub(crate) fn parse_line(log_name: &str, line: &str) -> EventRecord {
    let mut record = EventRecord::new(log_name, LINE_EVENT_ID, "").with_field("line", line);

    match syslog_pattern().captures(line) {
        Some(caps) => {
            let message = caps.name("message").map_or("", |m| m.as_str());
            record.provider_name = caps["tag"].to_string();
            record = record
                .with_property(message)
                .with_field("host", &caps["host"])
                .with_field("message", message);

            if let Some(pid) = caps.name("pid") {
                record = record.with_field("pid", pid.as_str());
            }
        }
        None => {
            record = record.with_property(line).with_field("message", line);
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn source() -> FileLogSource {
        FileLogSource::new().with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_parse_syslog_line() {
        let record = parse_line(
            "/var/log/auth.log",
            "Oct 18 12:00:01 host sshd[29722]: Failed password for root from 192.0.2.7 port 48316 ssh2",
        );

        assert_eq!(record.provider_name, "sshd");
        assert_eq!(record.event_id, LINE_EVENT_ID);
        assert_eq!(
            record.property(0),
            Some("Failed password for root from 192.0.2.7 port 48316 ssh2")
        );
        assert_eq!(record.field("host"), Some("host"));
        assert_eq!(record.field("pid"), Some("29722"));
    }

    #[test]
    fn test_parse_plain_line() {
        let record = parse_line("app.log", "login failed from 192.0.2.7");
        assert_eq!(record.provider_name, "");
        assert_eq!(record.property(0), Some("login failed from 192.0.2.7"));
        assert_eq!(record.field("line"), Some("login failed from 192.0.2.7"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");

        let result = source()
            .subscribe(EventQuery::new(path.to_string_lossy(), 0))
            .await;
        assert!(matches!(result, Err(SubscribeError::LogNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_predicate() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let query = EventQuery::new(file.path().to_string_lossy(), 0).with_predicate("(");

        let result = source().subscribe(query).await;
        assert!(matches!(result, Err(SubscribeError::Other(_))));
    }

    #[tokio::test]
    async fn test_tails_new_lines_only() {
        let file = tempfile::NamedTempFile::new().unwrap();
        append(file.path(), "Oct 18 12:00:00 host sshd[1]: old line\n");

        let mut subscription = source()
            .subscribe(EventQuery::new(file.path().to_string_lossy(), 0).with_provider("sshd"))
            .await
            .unwrap();

        append(file.path(), "Oct 18 12:00:01 host cron[2]: ignored\n");
        append(file.path(), "Oct 18 12:00:02 host sshd[3]: new ");
        append(file.path(), "line\n");

        let record = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
        assert_eq!(record.property(0), Some("new line"));
        assert_eq!(record.provider_name, "sshd");
    }

    #[tokio::test]
    async fn test_predicate_filters_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let query = EventQuery::new(file.path().to_string_lossy(), 0).with_predicate("Failed");

        let mut subscription = source().subscribe(query).await.unwrap();

        append(file.path(), "Accepted password for alice\nFailed password for bob\n");

        let record = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
        assert_eq!(record.property(0), Some("Failed password for bob"));
    }

    #[tokio::test]
    async fn test_reopens_after_truncation() {
        let file = tempfile::NamedTempFile::new().unwrap();
        append(file.path(), "some existing content that is fairly long\n");

        let mut subscription = source()
            .subscribe(EventQuery::new(file.path().to_string_lossy(), 0))
            .await
            .unwrap();

        std::fs::write(file.path(), "").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(file.path(), "after truncate\n");

        let record = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
        assert_eq!(record.property(0), Some("after truncate"));
    }
}
