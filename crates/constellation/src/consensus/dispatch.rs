//! Bounded callback dispatch.
//!
//! Lease and leadership notifications go through a fixed-size queue drained
//! by a fixed number of workers. Each callback runs on the blocking pool, so
//! a slow or panicking callback only ties up its own worker.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Notification callback; the flag is the new state (lease held / leader)
pub type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct Job {
    label: String,
    callback: Callback,
    value: bool,
}

#[derive(Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of dispatcher counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CallbackStats {
    pub dispatched: u64,
    pub completed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub queued: usize,
}

pub struct CallbackDispatcher {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<DispatchCounters>,
    capacity: usize,
}

impl CallbackDispatcher {
    /// Start `workers` workers behind a queue of `capacity` jobs
    pub fn new(workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(DispatchCounters::default());

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), counters.clone())))
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            counters,
            capacity,
        }
    }

    /// Queue a callback. Returns false if the notification was dropped.
    pub fn dispatch(&self, label: &str, callback: Callback, value: bool) -> bool {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(callback = %label, "Dispatcher stopped, dropping notification");
            return false;
        };

        let job = Job {
            label: label.to_string(),
            callback,
            value,
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    callback = %job.label,
                    value = job.value,
                    capacity = self.capacity,
                    "Callback queue full, dropping notification"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(callback = %job.label, "Callback workers gone, dropping notification");
                false
            }
        }
    }

    pub fn stats(&self) -> CallbackStats {
        let queued = self
            .tx
            .lock()
            .as_ref()
            .map(|tx| self.capacity.saturating_sub(tx.capacity()))
            .unwrap_or(0);

        CallbackStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queued,
        }
    }

    /// Stop accepting jobs and let workers drain the queue for up to `grace`
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.tx.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();

        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Callback workers still busy after shutdown grace period");
        }
    }
}

async fn worker(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>, counters: Arc<DispatchCounters>) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(Job { label, callback, value }) = job else {
            break;
        };

        match tokio::task::spawn_blocking(move || callback(value)).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = id, callback = %label, error = %e, "Callback failed");
            }
        }
    }
    tracing::debug!(worker = id, "Callback worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_dispatch_runs_callback() {
        let dispatcher = CallbackDispatcher::new(2, 8);
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();

        assert!(dispatcher.dispatch("lease:dns_writer", Arc::new(move |held| flag.store(held, Ordering::SeqCst)), true));
        assert!(eventually(|| seen.load(Ordering::SeqCst)).await);
        assert!(eventually(|| dispatcher.stats().completed == 1).await);
        assert_eq!(dispatcher.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_counts_as_failed() {
        let dispatcher = CallbackDispatcher::new(1, 4);
        dispatcher.dispatch("boom", Arc::new(|_| panic!("callback exploded")), true);
        dispatcher.dispatch("fine", Arc::new(|_| {}), false);

        assert!(eventually(|| {
            let stats = dispatcher.stats();
            stats.failed == 1 && stats.completed == 1
        })
        .await);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let dispatcher = CallbackDispatcher::new(1, 1);
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let blocker: Callback = Arc::new(move |_| {
            let _ = started_tx.lock().send(());
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
        });
        assert!(dispatcher.dispatch("slow", blocker, true));
        assert!(eventually(|| started_rx.try_recv().is_ok()).await);

        assert!(dispatcher.dispatch("queued", Arc::new(|_| {}), true));
        assert!(!dispatcher.dispatch("overflow", Arc::new(|_| {}), true));
        assert_eq!(dispatcher.stats().dropped, 1);
        assert_eq!(dispatcher.stats().queued, 1);

        release_tx.send(()).unwrap();
        assert!(eventually(|| dispatcher.stats().completed == 2).await);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let dispatcher = CallbackDispatcher::new(1, 4);
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert!(!dispatcher.dispatch("late", Arc::new(|_| {}), true));
        assert_eq!(dispatcher.stats().dropped, 1);
    }
}
