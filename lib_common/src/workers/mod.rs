//! # Workers
//!
//! Concrete [`Worker`](crate::core::worker_pool::Worker) implementations run
//! by the worker pool.

/// Route aggregation worker.
pub mod route_worker;

pub use route_worker::{RouteJob, RouteReport, RouteWorker};
