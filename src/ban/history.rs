//! Per-network failure history.

use std::time::Duration;
use tokio::time::Instant;

/// Sliding window of failure instants plus the number of bans so far.
///
/// Not synchronized; the engine serializes access per network.
#[derive(Debug, Default, Clone)]
pub struct FailureHistory {
    failures: Vec<Instant>,
    ban_count: u32,
}

impl FailureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, instant: Instant) {
        self.failures.push(instant);
    }

    /// Drop failures older than `cutoff` and count the rest.
    pub fn count_since(&mut self, cutoff: Instant) -> usize {
        self.failures.retain(|failure| *failure >= cutoff);
        self.failures.len()
    }

    /// [`count_since`](Self::count_since) for the window ending at `now`.
    pub fn count_within(&mut self, now: Instant, window: Duration) -> usize {
        match now.checked_sub(window) {
            Some(cutoff) => self.count_since(cutoff),
            None => self.failures.len(),
        }
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of bans applied so far.
    pub fn ban_count(&self) -> u32 {
        self.ban_count
    }

    pub fn increment_ban_count(&mut self) -> u32 {
        self.ban_count = self.ban_count.saturating_add(1);
        self.ban_count
    }

    /// Raise the ban count to at least `offense` (restored from a surviving rule).
    pub fn restore_ban_count(&mut self, offense: u32) {
        self.ban_count = self.ban_count.max(offense);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_count_prunes_old_failures() {
        let mut history = FailureHistory::new();
        let start = Instant::now();

        history.record(start);
        history.record(start + Duration::from_secs(1));
        history.record(start + Duration::from_secs(2));

        assert_eq!(history.count_since(start + Duration::from_secs(1)), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.count_since(start), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_within_window() {
        let mut history = FailureHistory::new();
        let start = Instant::now();

        history.record(start);
        tokio::time::advance(Duration::from_secs(10)).await;
        history.record(Instant::now());

        assert_eq!(history.count_within(Instant::now(), Duration::from_secs(60)), 2);
        assert_eq!(history.count_within(Instant::now(), Duration::from_secs(5)), 1);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_ban_count() {
        let mut history = FailureHistory::new();
        assert_eq!(history.ban_count(), 0);
        assert_eq!(history.increment_ban_count(), 1);
        assert_eq!(history.increment_ban_count(), 2);

        history.restore_ban_count(1);
        assert_eq!(history.ban_count(), 2);
        history.restore_ban_count(5);
        assert_eq!(history.ban_count(), 5);
    }

    #[test]
    fn test_clear_keeps_ban_count() {
        let mut history = FailureHistory::new();
        history.record(Instant::now());
        history.increment_ban_count();
        history.clear();

        assert!(history.is_empty());
        assert_eq!(history.ban_count(), 1);
    }
}
