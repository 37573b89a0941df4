//! # Feed Records
//!
//! Glue between the generic producers in `ingestors` and the GPS model:
//! - [`parse_gps_line`] decodes one newline-delimited JSON record for a live
//!   producer.
//! - [`walker`] builds a generator for a synthetic producer that moves one
//!   entity along a straight line, one step per tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use uuid::Uuid;

use super::models::{GpsData, Location};
use crate::ingestors::{GenerateFn, ParseFn};

/// Degrees moved per tick by [`walker`] on each axis.
pub const WALK_STEP_DEGREES: f64 = 0.0001;

/// Decodes one JSON feed record.
pub fn parse_gps_line(raw: &str) -> anyhow::Result<GpsData> {
    let raw = raw.trim();
    anyhow::ensure!(!raw.is_empty(), "empty feed record");
    serde_json::from_str(raw).with_context(|| format!("invalid feed record: {}", raw))
}

/// [`parse_gps_line`] in the form a live producer takes.
pub fn gps_parser() -> ParseFn<GpsData> {
    Arc::new(parse_gps_line)
}

/// A generator emitting fixes for `entity_id`, starting at `origin` and
/// drifting north-east by [`WALK_STEP_DEGREES`] per call.
pub fn walker(entity_id: Uuid, origin: Location) -> GenerateFn<GpsData> {
    let step = Arc::new(AtomicU64::new(0));
    Arc::new(move |_: &str| {
        let n = step.fetch_add(1, Ordering::Relaxed) as f64;
        GpsData {
            entity_id,
            location: Location {
                latitude: origin.latitude + n * WALK_STEP_DEGREES,
                longitude: origin.longitude + n * WALK_STEP_DEGREES,
                altitude: origin.altitude,
            },
            timestamp: Utc::now(),
        }
    })
}
