//! Route statistics: distance, duration and average speed.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::models::{AggregatedData, GpsData, Location, Route};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Computes the aggregate for `route`.
///
/// An empty route yields only its id and a timestamp.
pub fn aggregate_route(route: &Route) -> AggregatedData {
    let points = &route.path;
    let Some(last) = points.last() else {
        return AggregatedData {
            route_id: route.route_id,
            average_speed: 0.0,
            total_distance: 0.0,
            duration: Duration::ZERO,
            amount_points: 0,
            timestamp: resolve_timestamp(route, None),
        };
    };

    let total_distance: f64 = points
        .windows(2)
        .map(|pair| distance_meters(&pair[0].location, &pair[1].location))
        .sum();

    let (start, end) = duration_bounds(route, points);
    // Negative spans clamp to zero.
    let duration = (end - start).to_std().unwrap_or(Duration::ZERO);

    let seconds = duration.as_secs_f64();
    let average_speed = if seconds > 0.0 {
        total_distance / seconds
    } else {
        0.0
    };

    AggregatedData {
        route_id: route.route_id,
        average_speed,
        total_distance,
        duration,
        amount_points: points.len(),
        timestamp: resolve_timestamp(route, Some(last.timestamp)),
    }
}

/// Great-circle distance combined with the altitude delta, in meters.
pub fn distance_meters(a: &Location, b: &Location) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let sin_lat = (d_lat / 2.0).sin();
    let sin_lon = (d_lon / 2.0).sin();
    let h = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
    let central_angle = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    let horizontal = EARTH_RADIUS_METERS * central_angle;

    let alt_delta = b.altitude - a.altitude;
    if alt_delta == 0.0 {
        horizontal
    } else {
        horizontal.hypot(alt_delta)
    }
}

fn duration_bounds(route: &Route, points: &[GpsData]) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = route
        .end_time
        .or_else(|| points.last().map(|p| p.timestamp))
        .unwrap_or_else(Utc::now);
    let start = route
        .start_time
        .or_else(|| points.first().map(|p| p.timestamp))
        .unwrap_or(end);
    (start, end)
}

fn resolve_timestamp(route: &Route, fallback: Option<DateTime<Utc>>) -> DateTime<Utc> {
    route
        .end_time
        .or(fallback)
        .or(route.start_time)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use uuid::Uuid;

    fn fix(lat: f64, lon: f64, at: DateTime<Utc>) -> GpsData {
        GpsData {
            entity_id: Uuid::nil(),
            location: Location::new(lat, lon),
            timestamp: at,
        }
    }

    #[test]
    fn three_point_route() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000);
        let mut route = Route::new(Uuid::new_v4());
        route.push(fix(0.0, 0.0, t0));
        route.push(fix(0.0, 0.001, t0 + TimeDelta::seconds(10)));
        route.push(fix(0.0, 0.002, t0 + TimeDelta::seconds(20)));

        let agg = aggregate_route(&route);
        assert_eq!(agg.route_id, route.route_id);
        assert_eq!(agg.amount_points, 3);
        assert_eq!(agg.duration, Duration::from_secs(20));
        // 0.002 degrees of longitude on the equator.
        assert!((agg.total_distance - 222.39).abs() < 0.1, "{}", agg.total_distance);
        assert!((agg.average_speed - agg.total_distance / 20.0).abs() < 1e-9);
        assert_eq!(agg.timestamp, t0 + TimeDelta::seconds(20));
    }

    #[test]
    fn explicit_bounds_win_over_points() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let mut route = Route::new(Uuid::new_v4());
        route.push(fix(10.0, 10.0, t0 + TimeDelta::seconds(5)));
        route.start_time = Some(t0);
        route.end_time = Some(t0 + TimeDelta::seconds(60));

        let agg = aggregate_route(&route);
        assert_eq!(agg.duration, Duration::from_secs(60));
        assert_eq!(agg.total_distance, 0.0);
        assert_eq!(agg.average_speed, 0.0);
        assert_eq!(agg.timestamp, t0 + TimeDelta::seconds(60));
    }

    #[test]
    fn inverted_bounds_clamp_to_zero() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(100);
        let mut route = Route::new(Uuid::new_v4());
        route.push(fix(0.0, 0.0, t0));
        route.push(fix(0.0, 0.001, t0 + TimeDelta::seconds(1)));
        route.start_time = Some(t0 + TimeDelta::seconds(50));

        let agg = aggregate_route(&route);
        assert_eq!(agg.duration, Duration::ZERO);
        assert_eq!(agg.average_speed, 0.0);
        assert!(agg.total_distance > 0.0);
    }

    #[test]
    fn empty_route_carries_only_id_and_time() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(42);
        let mut route = Route::new(Uuid::new_v4());
        route.start_time = Some(t0);

        let agg = aggregate_route(&route);
        assert_eq!(agg.route_id, route.route_id);
        assert_eq!(agg.amount_points, 0);
        assert_eq!(agg.total_distance, 0.0);
        assert_eq!(agg.timestamp, t0);
    }

    #[test]
    fn altitude_adds_to_distance() {
        let a = Location::new(0.0, 0.0);
        let b = Location {
            altitude: 30.0,
            ..Location::new(0.0, 0.0)
        };
        assert!((distance_meters(&a, &b) - 30.0).abs() < 1e-9);
    }
}
