//! # lib_common
//!
//! Building blocks of the GPS tracker streaming pipeline, gated per folder the
//! same way as the rest of the workspace:
//!
//! - `core` (feature `core`): exchanger pool, worker pool, connection manager
//!   and the shared error type. Pulls in `ingestors`, the producers the
//!   exchanger pool runs.
//! - `geo` and `workers` (feature `geo`): GPS models, route aggregation, feed
//!   decoding and the route worker.
//! - `connections` (feature `connections`): identity resolution and the axum
//!   WebSocket adapter.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod ingestors;

#[cfg(feature = "geo")]
pub mod geo;
#[cfg(feature = "geo")]
pub mod workers;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "core")]
pub use crate::core::error::{PipelineError, Result};
