//! # GPS Domain Models
//!
//! Plain data carried through the pipeline: raw fixes from the feeds, the
//! routes assembled from them and the aggregates produced by the workers.
//! Everything serializes to JSON with `snake_case` field names.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A geographic position. Altitude is in meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Meters above sea level.
    #[serde(default)]
    pub altitude: f64,
}

impl Location {
    /// A sea-level position.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }
}

/// One fix reported by a tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsData {
    /// The tracked entity. Also the identity of the subscriber that receives
    /// its aggregates.
    pub entity_id: Uuid,
    /// Where.
    pub location: Location,
    /// When.
    pub timestamp: DateTime<Utc>,
}

/// An ordered sequence of fixes belonging to one trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier.
    pub route_id: Uuid,
    /// Fixes in arrival order.
    #[serde(default)]
    pub path: Vec<GpsData>,
    /// Explicit start, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Explicit end, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Whether the trip is over.
    #[serde(default)]
    pub finished: bool,
}

impl Route {
    /// An empty, open route.
    pub fn new(route_id: Uuid) -> Self {
        Self {
            route_id,
            path: Vec::new(),
            start_time: None,
            end_time: None,
            finished: false,
        }
    }

    /// Appends a fix.
    pub fn push(&mut self, point: GpsData) {
        self.path.push(point);
    }

    /// Number of fixes collected so far.
    pub fn len(&self) -> usize {
        self.path.len()
    }

    /// True when no fix has been collected.
    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

/// Statistics computed over a [`Route`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedData {
    /// The route these figures describe.
    pub route_id: Uuid,
    /// Meters per second.
    pub average_speed: f64,
    /// Meters.
    pub total_distance: f64,
    /// Elapsed time, serialized as fractional seconds.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Number of fixes aggregated.
    pub amount_points: usize,
    /// When the figures are valid for.
    pub timestamp: DateTime<Utc>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
