//! # Core Engine Module
//!
//! The three concurrency components of the tracker pipeline and their shared
//! error type:
//!
//! - **`exchanger_pool`**: registry and lifecycle of producers under a strict
//!   capacity bound, with shared task and result queues.
//! - **`worker_pool`**: a fixed roster of stateful workers scheduled by
//!   availability.
//! - **`connection_manager`**: multiplexes subscriber connections into one
//!   inbound queue and routes outbound frames by identity, with a race-free
//!   shutdown.
//! - **`error`**: the [`PipelineError`] taxonomy every component reports with.

/// Subscriber connection multiplexer.
pub mod connection_manager;
/// Pipeline error taxonomy.
pub mod error;
/// Producer registry and lifecycle.
pub mod exchanger_pool;
/// Availability-scheduled worker roster.
pub mod worker_pool;

pub use connection_manager::{
    ConnectionManager, ConnectionManagerConfig, DeliverySnapshot, InboundFrame, OutboundFrame,
};
pub use error::{PipelineError, Result};
pub use exchanger_pool::{ExchangerPool, ExchangerPoolConfig};
pub use worker_pool::{Worker, WorkerPool};
