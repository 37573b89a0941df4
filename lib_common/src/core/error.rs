//! # Pipeline Errors
//!
//! One error type shared by the exchanger pool, the worker pool and the
//! connection manager. Failures local to a single producer, worker or
//! connection are carried as values (terminal results, log entries) and never
//! tear down their siblings; only the capacity and naming errors are returned
//! synchronously to callers.

use thiserror::Error;

/// Convenience alias used across the core modules.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The full error taxonomy of the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The exchanger pool has no free slot left.
    #[error("max exchangers limit reached: {0}")]
    CapacityExceeded(usize),

    /// A producer with this name is already registered.
    #[error("exchanger with name {0} already exists")]
    DuplicateName(String),

    /// Dial, read or a remote close on a producer or connection transport.
    #[error("connectivity failure: {0}")]
    ConnectivityFailure(String),

    /// The record decoder rejected a raw record.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// The unit observed its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// The identity resolver did not accept the connection.
    #[error("unauthorized")]
    Unauthorized,

    /// The protocol handshake failed.
    #[error("upgrade failure: {0}")]
    UpgradeFailure(String),

    /// The pool or manager has already been torn down.
    #[error("{0} is closed")]
    ResourceClosed(&'static str),

    /// `stop` was called before the stream loop installed its cancel handle.
    #[error("exchanger {0} not running")]
    NotRunning(String),

    /// The producer could not be built from the given arguments.
    #[error("invalid exchanger: {0}")]
    InvalidProducer(String),

    /// A worker failed to release the resource it holds.
    #[error("worker {id} failed to close: {reason}")]
    WorkerRelease {
        /// Worker identifier.
        id: usize,
        /// Reason reported by the worker.
        reason: String,
    },
}

impl PipelineError {
    /// True for the outcome a producer reports when it was asked to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::ConnectivityFailure(err.to_string())
    }
}
