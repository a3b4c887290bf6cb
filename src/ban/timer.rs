//! Cancellable long delays and the per-network unban schedule.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::NetworkKey;

/// Longest single wait. Longer delays are chained.
pub const MAX_TIMER_STEP: Duration = Duration::from_millis(i32::MAX as u64);

/// Sleep for `duration` in steps of at most [`MAX_TIMER_STEP`].
///
/// Returns `false` if `cancel` fired first.
pub async fn sleep_chained(duration: Duration, cancel: &CancellationToken) -> bool {
    sleep_in_steps(duration, MAX_TIMER_STEP, cancel).await
}

pub(crate) async fn sleep_in_steps(
    duration: Duration,
    step: Duration,
    cancel: &CancellationToken,
) -> bool {
    let step = step.max(Duration::from_millis(1));
    let mut remaining = duration;

    while !remaining.is_zero() {
        let wait = remaining.min(step);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(wait) => {}
        }

        remaining -= wait;
        trace!(?remaining, "timer step elapsed");
    }

    !cancel.is_cancelled()
}

type Scheduled = Arc<Mutex<HashMap<NetworkKey, (u64, AbortHandle)>>>;

/// One pending unban task per network.
///
/// Scheduling a network again replaces its previous task.
pub(crate) struct UnbanScheduler {
    tasks: Scheduled,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl UnbanScheduler {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            cancel,
        }
    }

    /// Run `action` after `delay` unless cancelled or replaced first.
    pub(crate) fn schedule<F, Fut>(&self, network: NetworkKey, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let cancel = self.cancel.clone();

        // held until the entry is inserted so the task cannot remove it first
        let mut scheduled = self.tasks.lock();

        let handle = tokio::spawn(async move {
            if !sleep_chained(delay, &cancel).await {
                return;
            }

            {
                let mut tasks = tasks.lock();
                if matches!(tasks.get(&network), Some((current, _)) if *current == id) {
                    tasks.remove(&network);
                }
            }

            action().await;
        });

        if let Some((_, previous)) = scheduled.insert(network, (id, handle.abort_handle())) {
            previous.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel and forget every pending task.
    pub(crate) fn cancel_all(&self) {
        self.cancel.cancel();
        for (_, (_, handle)) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_sleep_chained_spans_multiple_steps() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(sleep_in_steps(Duration::from_secs(10), Duration::from_secs(3), &cancel).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_chained_year_long() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        assert!(sleep_chained(364 * DAY, &cancel).await);
        assert!(start.elapsed() >= 364 * DAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_chained_cancelled() {
        let cancel = CancellationToken::new();
        let sleeper = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sleep_chained(364 * DAY, &cancel).await })
        };

        tokio::time::advance(DAY).await;
        cancel.cancel();

        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_zero() {
        assert!(sleep_chained(Duration::ZERO, &CancellationToken::new()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_and_forgets() {
        let scheduler = UnbanScheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let network: NetworkKey = "192.0.2.0/24".parse().unwrap();

        let counter = Arc::clone(&runs);
        scheduler.schedule(network, Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous() {
        let scheduler = UnbanScheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let network: NetworkKey = "192.0.2.0/24".parse().unwrap();

        for delay in [60, 120] {
            let counter = Arc::clone(&runs);
            scheduler.schedule(network, Duration::from_secs(delay), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = UnbanScheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        scheduler.schedule("192.0.2.0/24".parse().unwrap(), Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.cancel_all();
        assert_eq!(scheduler.len(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let counter = Arc::clone(&runs);
        scheduler.schedule("192.0.2.0/24".parse().unwrap(), Duration::ZERO, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.len(), 0);
    }
}
