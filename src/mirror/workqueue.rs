//! Bounded concurrency for planning and copying
//!
//! A [`WorkQueue`] runs futures handed to [`Work::parallel`] on tokio tasks, at most
//! `workers` at a time. [`WorkQueue::batch`] waits for the parallel work started inside it;
//! [`WorkQueue::done`] waits for everything ever started on the queue and then closes it.
//!
//! Work running on one queue may open a batch on a different queue but must not open one on
//! its own queue, since the waiting task would hold one of the permits its batch needs.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};

/// Counts outstanding work and lets callers wait until none is left
#[derive(Clone)]
struct Tracker(Arc<watch::Sender<usize>>);

impl Tracker {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(0)))
    }

    fn enter(&self) -> TrackerGuard {
        self.0.send_modify(|n| *n += 1);
        TrackerGuard(self.clone())
    }

    async fn idle(&self) {
        let mut rx = self.0.subscribe();
        // the sender lives in `self`, so the channel cannot close while waiting
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Releases one unit of outstanding work on drop, including when the work panics
struct TrackerGuard(Tracker);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.0.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    semaphore: Arc<Semaphore>,
    outstanding: Tracker,
}

/// Handle for starting parallel work, tied to a batch or to the queue itself
pub struct Work {
    semaphore: Arc<Semaphore>,
    trackers: Vec<Tracker>,
}

impl Work {
    /// Run `fut` once a worker is free. Returns immediately.
    pub fn parallel<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guards: Vec<TrackerGuard> = self.trackers.iter().map(Tracker::enter).collect();
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _guards = guards;
            match semaphore.acquire_owned().await {
                Ok(_permit) => fut.await,
                Err(_) => tracing::warn!("work queue is closed, dropping queued work"),
            }
        });
    }
}

impl WorkQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            outstanding: Tracker::new(),
        }
    }

    /// Hand `f` a handle whose parallel work is only awaited by [`WorkQueue::done`]
    pub fn queue(&self, f: impl FnOnce(&Work)) {
        f(&Work {
            semaphore: self.semaphore.clone(),
            trackers: vec![self.outstanding.clone()],
        });
    }

    /// Run `f` and wait until every parallel task it started has finished
    pub async fn batch(&self, f: impl FnOnce(&Work)) {
        let batch = Tracker::new();
        f(&Work {
            semaphore: self.semaphore.clone(),
            trackers: vec![self.outstanding.clone(), batch.clone()],
        });
        batch.idle().await;
    }

    /// Wait for all outstanding work, then stop accepting more
    pub async fn done(&self) {
        self.outstanding.idle().await;
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_batch_waits_and_bounds_concurrency() {
        let q = WorkQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        q.batch(|w| {
            for _ in 0..8 {
                let (running, peak, finished) = (running.clone(), peak.clone(), finished.clone());
                w.parallel(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
        })
        .await;

        assert_eq!(finished.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_batch_nested_on_other_queue() {
        let outer = WorkQueue::new(1);
        let inner = WorkQueue::new(3);
        let count = Arc::new(AtomicUsize::new(0));

        outer
            .batch(|w| {
                for _ in 0..2 {
                    let (inner, count) = (inner.clone(), count.clone());
                    w.parallel(async move {
                        inner
                            .batch(|w| {
                                for _ in 0..3 {
                                    let count = count.clone();
                                    w.parallel(async move {
                                        count.fetch_add(1, Ordering::SeqCst);
                                    });
                                }
                            })
                            .await;
                    });
                }
            })
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_done_waits_for_queued_work_then_closes() {
        let q = WorkQueue::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        q.queue(|w| {
            for _ in 0..4 {
                let count = count.clone();
                w.parallel(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        q.done().await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        let late = count.clone();
        q.batch(|w| {
            w.parallel(async move {
                late.fetch_add(1, Ordering::SeqCst);
            })
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
