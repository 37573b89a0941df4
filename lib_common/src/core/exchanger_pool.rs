//! # Exchanger Pool
//!
//! Owns the registry of running producers, the shared task queue and the shared
//! result queue, and keeps the number of concurrent producers under a fixed
//! bound.
//!
//! Every producer runs its stream loop on its own tracked task. When the loop
//! returns, the same task removes the producer from the registry and frees its
//! slot, under the registry lock. `stop_pool` cancels everything, waits on the
//! tracker until every loop has exited, and only then drops the pool's own
//! senders so that both queues close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::error::{PipelineError, Result};
use crate::ingestors::{
    ExchangeResult, Exchanger, GenerateFn, LiveExchanger, ParseFn, StreamSinks, Task, TestExchanger,
};

/// Tick period of producers created with [`ExchangerPool::add_test`].
pub const TEST_TICK: Duration = Duration::from_millis(100);

/// Construction parameters for an [`ExchangerPool`].
#[derive(Debug, Clone)]
pub struct ExchangerPoolConfig {
    /// Slot bound. At most `max_count - 1` producers run at once.
    pub max_count: usize,
    /// Capacity of the shared task queue.
    pub task_capacity: usize,
    /// Tick period for synthetic producers.
    pub test_tick: Duration,
}

impl Default for ExchangerPoolConfig {
    fn default() -> Self {
        Self {
            max_count: 16,
            task_capacity: 1024,
            test_tick: TEST_TICK,
        }
    }
}

/// A registered producer and the token that ends its loop, started or not.
struct Entry<T> {
    exchanger: Arc<Exchanger<T>>,
    cancel: CancellationToken,
}

struct Registry<T> {
    exchangers: HashMap<String, Entry<T>>,
    active: usize,
    stopped: bool,
}

/// Bounded set of streaming producers feeding one task queue.
pub struct ExchangerPool<T> {
    config: ExchangerPoolConfig,
    registry: Arc<Mutex<Registry<T>>>,
    tracker: TaskTracker,
    token: CancellationToken,
    out_tx: Mutex<Option<mpsc::Sender<Task<T>>>>,
    out_rx: Mutex<Option<mpsc::Receiver<Task<T>>>>,
    result_tx: Mutex<Option<mpsc::UnboundedSender<ExchangeResult>>>,
    result_rx: Mutex<Option<mpsc::UnboundedReceiver<ExchangeResult>>>,
}

impl<T: Send + 'static> ExchangerPool<T> {
    /// Creates an empty pool.
    pub fn new(config: ExchangerPoolConfig) -> Self {
        let (out_tx, out_rx) = mpsc::channel(config.task_capacity.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry {
                exchangers: HashMap::new(),
                active: 0,
                stopped: false,
            })),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: Mutex::new(Some(out_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
        }
    }

    /// Convenience constructor with default queue sizes.
    pub fn with_max_count(max_count: usize) -> Self {
        Self::new(ExchangerPoolConfig {
            max_count,
            ..Default::default()
        })
    }

    /// Registers a live TCP producer and starts its stream loop.
    pub fn add(&self, name: &str, host: &str, port: &str, parse: ParseFn<T>) -> Result<()> {
        let live = LiveExchanger::new(name, host, port, parse)?;
        self.register(Exchanger::Live(live))
    }

    /// Registers a synthetic producer and starts its stream loop.
    pub fn add_test(&self, name: &str, generate: GenerateFn<T>) -> Result<()> {
        let test = TestExchanger::new(name, self.config.test_tick, generate);
        self.register(Exchanger::Test(test))
    }

    fn register(&self, exchanger: Exchanger<T>) -> Result<()> {
        let name = exchanger.name().to_string();
        let mut registry = self.registry.lock().expect("Exchanger registry lock poisoned");

        if registry.stopped {
            return Err(PipelineError::ResourceClosed("exchanger pool"));
        }
        if registry.active + 1 >= self.config.max_count {
            return Err(PipelineError::CapacityExceeded(self.config.max_count));
        }
        if registry.exchangers.contains_key(&name) {
            return Err(PipelineError::DuplicateName(name));
        }

        let sinks = self.sinks()?;
        let exchanger = Arc::new(exchanger);
        let cancel = self.token.child_token();
        registry.exchangers.insert(
            name.clone(),
            Entry {
                exchanger: Arc::clone(&exchanger),
                cancel: cancel.clone(),
            },
        );
        registry.active += 1;
        log::info!("Exchanger '{}' registered ({} active)", name, registry.active);

        let registry_handle = Arc::clone(&self.registry);
        self.tracker.spawn(async move {
            exchanger.stream(cancel, sinks).await;

            let mut registry = registry_handle.lock().expect("Exchanger registry lock poisoned");
            // `remove` may already have taken the entry, or a new producer may
            // have reused the name since.
            let ours = registry
                .exchangers
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(&current.exchanger, &exchanger));
            if ours {
                registry.exchangers.remove(&name);
                registry.active -= 1;
                log::debug!("Exchanger '{}' deregistered ({} active)", name, registry.active);
            }
        });
        Ok(())
    }

    fn sinks(&self) -> Result<StreamSinks<T>> {
        let out = self.out_tx.lock().expect("Task queue lock poisoned").clone();
        let results = self.result_tx.lock().expect("Result queue lock poisoned").clone();
        match (out, results) {
            (Some(out), Some(results)) => Ok(StreamSinks { out, results }),
            _ => Err(PipelineError::ResourceClosed("exchanger pool")),
        }
    }

    /// Cancels and deregisters `name`. Unknown names are ignored.
    pub fn remove(&self, name: &str) {
        let mut registry = self.registry.lock().expect("Exchanger registry lock poisoned");
        if let Some(entry) = registry.exchangers.remove(name) {
            // Reaches the loop even if it has not installed its own handle yet.
            entry.cancel.cancel();
            if let Err(e) = entry.exchanger.stop() {
                log::debug!("Removing exchanger '{}': {}", name, e);
            }
            registry.active -= 1;
            log::info!("Exchanger '{}' removed ({} active)", name, registry.active);
        }
    }

    /// Names of the currently registered producers.
    pub fn connected(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("Exchanger registry lock poisoned");
        let mut names: Vec<String> = registry.exchangers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of occupied slots.
    pub fn active_count(&self) -> usize {
        self.registry.lock().expect("Exchanger registry lock poisoned").active
    }

    /// Stops every producer, waits for all stream loops to exit, then closes
    /// both shared queues. Later calls return immediately.
    pub async fn stop_pool(&self) {
        {
            let mut registry = self.registry.lock().expect("Exchanger registry lock poisoned");
            if registry.stopped {
                return;
            }
            registry.stopped = true;
            log::info!("Stopping {} exchangers", registry.exchangers.len());
            for (name, entry) in registry.exchangers.iter() {
                log::warn!("stopping exchanger... {}", name);
                entry.cancel.cancel();
                if let Err(e) = entry.exchanger.stop() {
                    log::debug!("{}", e);
                }
            }
        }
        // Covers loops that had not installed their handle yet.
        self.token.cancel();

        self.tracker.close();
        self.tracker.wait().await;

        self.out_tx.lock().expect("Task queue lock poisoned").take();
        self.result_tx.lock().expect("Result queue lock poisoned").take();
        log::info!("Exchanger pool stopped");
    }

    /// Hands over the receiving end of the task queue. `None` after the first call.
    pub fn out(&self) -> Option<mpsc::Receiver<Task<T>>> {
        self.out_rx.lock().expect("Task queue lock poisoned").take()
    }

    /// Hands over the receiving end of the result queue. `None` after the first call.
    pub fn results(&self) -> Option<mpsc::UnboundedReceiver<ExchangeResult>> {
        self.result_rx.lock().expect("Result queue lock poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn counter() -> GenerateFn<u64> {
        let n = Arc::new(AtomicU64::new(0));
        Arc::new(move |_: &str| n.fetch_add(1, Ordering::SeqCst))
    }

    fn drain(pool: &ExchangerPool<u64>) -> tokio::task::JoinHandle<Vec<Task<u64>>> {
        let mut out = pool.out().unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(task) = out.recv().await {
                seen.push(task);
            }
            seen
        })
    }

    #[tokio::test]
    async fn capacity_is_strict() {
        let pool = ExchangerPool::with_max_count(3);
        let _drain = drain(&pool);
        assert!(pool.add_test("a", counter()).is_ok());
        assert!(pool.add_test("b", counter()).is_ok());
        assert_eq!(
            pool.add_test("c", counter()),
            Err(PipelineError::CapacityExceeded(3))
        );
        assert_eq!(pool.active_count(), 2);
        pool.stop_pool().await;
    }

    #[tokio::test]
    async fn duplicate_name_keeps_first_registration() {
        let pool = ExchangerPool::with_max_count(8);
        let drained = drain(&pool);
        let mut results = pool.results().unwrap();

        pool.add_test("feed", counter()).unwrap();
        assert_eq!(
            pool.add_test("feed", counter()),
            Err(PipelineError::DuplicateName("feed".into()))
        );
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.connected(), vec!["feed".to_string()]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.stop_pool().await;

        let tasks = drained.await.unwrap();
        assert!(!tasks.is_empty());
        assert!(tasks.iter().all(|t| t.exchanger == "feed"));
        assert_eq!(results.recv().await.unwrap().name, "feed");
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_pool_joins_and_closes_queues() {
        let pool = ExchangerPool::with_max_count(8);
        let drained = drain(&pool);
        let mut results = pool.results().unwrap();

        for name in ["a", "b", "c"] {
            pool.add_test(name, counter()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.stop_pool().await;

        assert_eq!(pool.active_count(), 0);
        assert!(pool.connected().is_empty());
        // Queue is closed once every loop exited.
        drained.await.unwrap();

        let mut names = Vec::new();
        while let Some(result) = results.recv().await {
            assert_eq!(result.error, None);
            names.push(result.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);

        assert_eq!(
            pool.add_test("late", counter()),
            Err(PipelineError::ResourceClosed("exchanger pool"))
        );
        // Second stop is a no-op.
        pool.stop_pool().await;
    }

    #[tokio::test]
    async fn failed_producer_frees_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"5\n").await.unwrap();
        });

        let pool: ExchangerPool<u64> = ExchangerPool::with_max_count(2);
        let drained = drain(&pool);
        let mut results = pool.results().unwrap();
        let parse: ParseFn<u64> =
            Arc::new(|raw: &str| -> anyhow::Result<u64> { Ok(raw.parse::<u64>()?) });

        pool.add("live", "127.0.0.1", &port, parse).unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.name, "live");
        assert_eq!(result.received_tasks, 1);
        assert!(matches!(result.error, Some(PipelineError::ConnectivityFailure(_))));

        // Deregistration happens right after the report.
        for _ in 0..50 {
            if pool.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.active_count(), 0);
        assert!(pool.add_test("next", counter()).is_ok());

        pool.stop_pool().await;
        let tasks = drained.await.unwrap();
        assert_eq!(tasks.first().map(|t| t.data), Some(5));
    }

    #[tokio::test]
    async fn remove_cancels_and_frees_slot_once() {
        let pool = ExchangerPool::with_max_count(4);
        let _drain = drain(&pool);
        let mut results = pool.results().unwrap();

        pool.add_test("a", counter()).unwrap();
        pool.add_test("b", counter()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.remove("a");
        pool.remove("missing");
        assert_eq!(pool.connected(), vec!["b".to_string()]);
        assert_eq!(pool.active_count(), 1);

        let result = results.recv().await.unwrap();
        assert_eq!(result.name, "a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The loop exit must not free the slot a second time.
        assert_eq!(pool.active_count(), 1);

        pool.stop_pool().await;
    }

    #[tokio::test]
    async fn remove_before_first_poll_stops_the_loop() {
        let pool = ExchangerPool::with_max_count(2);
        let drained = drain(&pool);
        let mut results = pool.results().unwrap();

        // None of these loops has been polled when it is removed.
        for _ in 0..5 {
            pool.add_test("a", counter()).unwrap();
            pool.remove("a");
            assert_eq!(pool.active_count(), 0);
        }

        // Several tick periods; a surviving loop would emit here.
        tokio::time::sleep(Duration::from_millis(350)).await;
        for _ in 0..5 {
            let result = results.recv().await.unwrap();
            assert_eq!(result.name, "a");
            assert_eq!(result.received_tasks, 0);
        }
        assert!(results.try_recv().is_err());

        pool.stop_pool().await;
        assert!(drained.await.unwrap().is_empty());
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_pool_interrupts_a_blocked_live_producer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for n in 0..64u64 {
                socket.write_all(format!("{}\n", n).as_bytes()).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let pool: ExchangerPool<u64> = ExchangerPool::new(ExchangerPoolConfig {
            max_count: 4,
            task_capacity: 1,
            ..Default::default()
        });
        // Held but never read, so the second offer blocks.
        let _out = pool.out().unwrap();
        let mut results = pool.results().unwrap();
        let parse: ParseFn<u64> =
            Arc::new(|raw: &str| -> anyhow::Result<u64> { Ok(raw.parse::<u64>()?) });
        pool.add("live", "127.0.0.1", &port, parse).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(2), pool.stop_pool())
            .await
            .expect("stop_pool hung on a blocked producer");

        let result = results.recv().await.unwrap();
        assert_eq!(result.name, "live");
        assert_eq!(result.error, Some(PipelineError::Cancelled));
        assert_eq!(result.received_tasks, 1);
        assert!(results.recv().await.is_none());
        assert_eq!(pool.active_count(), 0);
    }
}
