//! # Data Ingestors Module
//!
//! The "front door" of the pipeline. Each ingestor is a producer (an
//! "exchanger") that turns some external source into a stream of typed
//! [`Task`]s and, when its stream loop exits for any reason, reports exactly
//! one terminal [`ExchangeResult`].
//!
//! ## Contained Modules:
//! - **`live_tcp`**: dials a TCP endpoint and decodes newline-delimited records
//!   with a caller supplied parse function.
//! - **`synthetic`**: a timer driven producer that fabricates payloads, used for
//!   load tests and demos.
//!
//! Both variants sit behind the [`Exchanger`] enum so the exchanger pool only
//! ever talks to the shared `stream` / `stop` contract.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::{PipelineError, Result};

/// TCP producer decoding newline-delimited records.
pub mod live_tcp;
/// Timer driven producer fabricating payloads.
pub mod synthetic;

pub use live_tcp::LiveExchanger;
pub use synthetic::TestExchanger;

/// Record decoder supplied by the owner of a live producer.
pub type ParseFn<T> = Arc<dyn Fn(&str) -> anyhow::Result<T> + Send + Sync>;

/// Payload factory supplied by the owner of a synthetic producer.
pub type GenerateFn<T> = Arc<dyn Fn(&str) -> T + Send + Sync>;

/// One payload unit tagged with the name of the producer that emitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<T> {
    /// Name of the originating exchanger.
    pub exchanger: String,
    /// The decoded payload.
    pub data: T,
}

impl<T> Task<T> {
    /// Wraps a payload produced by `from`.
    pub fn wrap(from: &str, data: T) -> Self {
        Self {
            exchanger: from.to_string(),
            data,
        }
    }
}

/// Terminal status record closing one producer lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResult {
    /// Producer name.
    pub name: String,
    /// Remote host, empty for synthetic producers.
    pub host: String,
    /// Remote port, empty for synthetic producers.
    pub port: String,
    /// Number of tasks accepted by the task queue.
    pub received_tasks: usize,
    /// Why the loop ended. `None` is a clean exit.
    pub error: Option<PipelineError>,
}

/// The queues every stream loop writes into.
#[derive(Clone)]
pub struct StreamSinks<T> {
    /// Shared task queue.
    pub out: mpsc::Sender<Task<T>>,
    /// Shared result queue.
    pub results: mpsc::UnboundedSender<ExchangeResult>,
}

/// A producer variant managed by the exchanger pool.
pub enum Exchanger<T> {
    /// Network backed producer.
    Live(LiveExchanger<T>),
    /// Synthetic producer.
    Test(TestExchanger<T>),
}

impl<T: Send + 'static> Exchanger<T> {
    /// Runs the stream loop until it terminates. Reports exactly one result.
    pub async fn stream(&self, parent: CancellationToken, sinks: StreamSinks<T>) {
        match self {
            Exchanger::Live(live) => live.stream(parent, sinks).await,
            Exchanger::Test(test) => test.stream(parent, sinks).await,
        }
    }

    /// Signals the running loop to stop.
    ///
    /// Returns [`PipelineError::NotRunning`] when the loop has not installed its
    /// cancellation handle yet.
    pub fn stop(&self) -> Result<()> {
        match self {
            Exchanger::Live(live) => live.stop(),
            Exchanger::Test(test) => test.stop(),
        }
    }

    /// Producer name.
    pub fn name(&self) -> &str {
        match self {
            Exchanger::Live(live) => &live.name,
            Exchanger::Test(test) => &test.name,
        }
    }
}

/// Cancellation slot filled by the stream loop once it starts.
#[derive(Default)]
pub(crate) struct CancelSlot(std::sync::Mutex<Option<CancellationToken>>);

impl CancelSlot {
    /// Derives the loop token from `parent` and publishes it.
    pub(crate) fn install(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let mut slot = self.0.lock().expect("cancel slot lock poisoned");
        *slot = Some(token.clone());
        token
    }

    pub(crate) fn cancel(&self, name: &str) -> Result<()> {
        let slot = self.0.lock().expect("cancel slot lock poisoned");
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(PipelineError::NotRunning(name.to_string())),
        }
    }
}
