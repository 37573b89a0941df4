//! # Worker Pool
//!
//! A fixed roster of stateful workers and an availability queue. `work` takes
//! the first idle worker off the queue (waiting if there is none), runs the
//! task on a blocking-pool thread, writes the single result to the caller's
//! sink and puts the worker back. Whichever worker returns first serves the
//! next task, so the pool behaves as least-recently-busy rather than a fixed
//! rotation.
//!
//! A task that panics is dropped and logged; its worker still goes back on
//! the queue.
//!
//! A worker is only ever touched by the task that took it off the queue. The
//! per-worker mutex is therefore never contended; it only gives the roster a
//! way to reach the workers for stats and release.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::core::error::{PipelineError, Result};

/// A stateful task → result transformation unit.
pub trait Worker: Send + 'static {
    /// Input consumed by one call to [`Worker::work`].
    type Task: Send + 'static;
    /// Output produced by one call to [`Worker::work`].
    type Output: Send + 'static;

    /// Stable identifier inside the roster.
    fn id(&self) -> usize;
    /// One-line human readable status.
    fn stat(&self) -> String;
    /// Bumps the processed-task counter.
    fn increment_tasks(&mut self);
    /// Transforms one task.
    fn work(&mut self, task: Self::Task) -> Self::Output;
    /// Releases whatever external resource the worker holds.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

type Slot<W> = Arc<Mutex<W>>;

/// Fixed roster of workers dispatched by availability.
pub struct WorkerPool<W> {
    /// Label used in stats output.
    pub name: String,
    roster: Mutex<Vec<Slot<W>>>,
    available_tx: mpsc::Sender<Slot<W>>,
    available_rx: tokio::sync::Mutex<mpsc::Receiver<Slot<W>>>,
    tracker: TaskTracker,
}

impl<W> WorkerPool<W> {
    /// Builds the pool. Call [`WorkerPool::create`] before dispatching.
    pub fn new(name: &str, workers: Vec<W>) -> Self {
        let (available_tx, available_rx) = mpsc::channel(workers.len().max(1));
        Self {
            name: name.to_string(),
            roster: Mutex::new(workers.into_iter().map(|w| Arc::new(Mutex::new(w))).collect()),
            available_tx,
            available_rx: tokio::sync::Mutex::new(available_rx),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of workers in the roster.
    pub fn size(&self) -> usize {
        self.roster.lock().expect("Worker roster lock poisoned").len()
    }

    /// Seeds the availability queue with every worker.
    pub fn create(&self) {
        let roster = self.roster.lock().expect("Worker roster lock poisoned");
        for slot in roster.iter() {
            // Capacity equals the roster size.
            if self.available_tx.try_send(Arc::clone(slot)).is_err() {
                log::warn!("Worker pool '{}' availability queue already seeded", self.name);
                break;
            }
        }
    }

    /// Number of idle workers right now.
    pub fn idle(&self) -> usize {
        self.available_tx.max_capacity() - self.available_tx.capacity()
    }
}

impl<W: Worker> WorkerPool<W> {
    /// Waits for an idle worker and dispatches `task` to it.
    ///
    /// Returns once the task is handed off; the result arrives on `sink`.
    /// Results of concurrent calls may arrive in any order. A pool with an
    /// empty roster, or one already released, rejects the task.
    pub async fn work(&self, task: W::Task, sink: mpsc::Sender<W::Output>) -> Result<()> {
        if self.tracker.is_closed() || self.size() == 0 {
            return Err(PipelineError::ResourceClosed("worker pool"));
        }
        let slot = {
            let mut available = self.available_rx.lock().await;
            available
                .recv()
                .await
                .ok_or(PipelineError::ResourceClosed("worker pool"))?
        };

        let back = self.available_tx.clone();
        let pool = self.name.clone();
        self.tracker.spawn_blocking(move || {
            {
                let mut worker = slot.lock().unwrap_or_else(PoisonError::into_inner);
                let id = worker.id();
                match panic::catch_unwind(AssertUnwindSafe(|| worker.work(task))) {
                    Ok(result) => {
                        if sink.blocking_send(result).is_err() {
                            log::warn!("Result sink closed before worker {} reported", id);
                        }
                        worker.increment_tasks();
                    }
                    Err(_) => log::error!("Worker {} in pool '{}' panicked, task dropped", id, pool),
                }
            }
            if back.blocking_send(slot).is_err() {
                log::debug!("Worker pool '{}' availability queue closed", pool);
            }
        });
        Ok(())
    }

    /// Waits for in-flight dispatches, then releases every worker.
    ///
    /// Every worker is closed even if an earlier one fails; the first failure
    /// is returned. Further calls to `work` are rejected.
    pub async fn wait(&self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;

        let roster = self.roster.lock().expect("Worker roster lock poisoned");
        let mut first_error = None;
        for slot in roster.iter() {
            let mut worker = match slot.lock() {
                Ok(worker) => worker,
                Err(poisoned) => {
                    let worker = poisoned.into_inner();
                    let e = PipelineError::WorkerRelease {
                        id: worker.id(),
                        reason: "worker lock poisoned".into(),
                    };
                    log::error!("Worker pool '{}': {}", self.name, e);
                    first_error.get_or_insert(e);
                    worker
                }
            };
            if let Err(e) = worker.close() {
                log::error!("Worker pool '{}': {}", self.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Per-worker status lines.
    pub fn stats(&self) -> Vec<String> {
        let roster = self.roster.lock().expect("Worker roster lock poisoned");
        roster
            .iter()
            .map(|slot| match slot.try_lock() {
                Ok(worker) => worker.stat(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().stat(),
                Err(TryLockError::WouldBlock) => "busy".to_string(),
            })
            .collect()
    }

    /// Logs a stats report for the whole roster.
    pub fn print_stats(&self) {
        let mut report = format!(
            "------------------------------- Worker Pool: {} Stats -------------------------------\n",
            self.name
        );
        for line in self.stats() {
            report.push_str(&line);
            report.push('\n');
        }
        log::info!("{}", report);
    }
}
