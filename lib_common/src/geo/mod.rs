//! # GPS Domain
//!
//! The payloads the tracker pipeline moves around and the math it runs on
//! them.
//!
//! - **`models`**: fixes, routes and aggregates, all JSON serializable.
//! - **`aggregator`**: haversine distance, duration and speed over a route.
//! - **`feed`**: the NDJSON record parser for live feeds and a synthetic
//!   walker for test feeds.

/// Route statistics.
pub mod aggregator;
/// Feed decoding and synthetic generation.
pub mod feed;
/// Fixes, routes and aggregates.
pub mod models;

pub use aggregator::{aggregate_route, distance_meters};
pub use feed::{gps_parser, parse_gps_line, walker};
pub use models::{AggregatedData, GpsData, Location, Route};
