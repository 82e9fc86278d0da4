//! Trip reconstruction: one unordered batch of raw points in, one
//! [`TripSummary`] out.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Serialize;

use crate::types::{TelemetryPoint, TripKey, TripSummary};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const METERS_PER_MILE: f64 = 1609.34;
/// Slack above the posted limit before a sample counts as overspeed (~1.1 mph).
pub const OVERSPEED_TOLERANCE_MPS: f64 = 0.5;
/// Night window is [22:00, 06:00) on the UTC wall clock.
pub const NIGHT_START_HOUR: u32 = 22;
pub const NIGHT_END_HOUR: u32 = 6;

/// All raw points collected for one trip, as read from the ingest boundary.
#[derive(Debug, Clone)]
pub struct TripBatch {
    pub key: TripKey,
    pub points: Vec<TelemetryPoint>,
    /// Lines the reader could not decode at all.
    pub malformed_lines: usize,
}

/// Outcome of reconstructing a single trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// `None` when every point had an unparseable timestamp.
    pub summary: Option<TripSummary>,
    pub dropped_points: usize,
    pub points_missing_coords: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructStats {
    pub trips_seen: usize,
    pub summaries: usize,
    pub empty_trips: usize,
    pub dropped_points: usize,
    pub malformed_lines: usize,
    pub points_missing_coords: usize,
}

/// Parse a timestamp to an absolute instant.
///
/// Accepts RFC 3339 and the space-separated offset form; naive date-times and
/// bare dates are taken as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Great-circle distance in meters. Any missing coordinate yields 0.
pub fn haversine_m(a: (Option<f64>, Option<f64>), b: (Option<f64>, Option<f64>)) -> f64 {
    let (Some(lat1), Some(lon1), Some(lat2), Some(lon2)) = (a.0, a.1, b.0, b.1) else {
        return 0.0;
    };
    let p1 = lat1.to_radians();
    let p2 = lat2.to_radians();
    let dphi = p2 - p1;
    let dlambda = (lon2 - lon1).to_radians();
    let h = ((dphi / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dlambda / 2.0).sin().powi(2)).clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn is_night(ts: &DateTime<Utc>) -> bool {
    let h = ts.hour();
    h >= NIGHT_START_HOUR || h < NIGHT_END_HOUR
}

fn cmp_opt(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
}

// Points sharing an instant are ordered by position and speed so the distance
// sum does not depend on arrival order.
fn cmp_points(a: &(DateTime<Utc>, &TelemetryPoint), b: &(DateTime<Utc>, &TelemetryPoint)) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| cmp_opt(a.1.lat, b.1.lat))
        .then_with(|| cmp_opt(a.1.lon, b.1.lon))
        .then_with(|| cmp_opt(a.1.speed_mps, b.1.speed_mps))
        .then_with(|| cmp_opt(a.1.road_speed_limit, b.1.road_speed_limit))
}

/// Rebuild the trip summary for one (policy, trip) batch.
pub fn reconstruct(key: &TripKey, points: &[TelemetryPoint]) -> Reconstruction {
    let mut timed: Vec<(DateTime<Utc>, &TelemetryPoint)> = points
        .iter()
        .filter_map(|p| p.ts.as_deref().and_then(parse_instant).map(|ts| (ts, p)))
        .collect();
    let dropped_points = points.len() - timed.len();
    let points_missing_coords = timed
        .iter()
        .filter(|(_, p)| p.lat.is_none() || p.lon.is_none())
        .count();

    if timed.is_empty() {
        return Reconstruction {
            summary: None,
            dropped_points,
            points_missing_coords,
        };
    }
    timed.sort_by(cmp_points);

    let dist_m: f64 = timed
        .windows(2)
        .map(|w| haversine_m((w[0].1.lat, w[0].1.lon), (w[1].1.lat, w[1].1.lon)))
        .sum();

    let start_ts = timed[0].0;
    let end_ts = timed[timed.len() - 1].0;
    let duration_s = ((end_ts - start_ts).num_milliseconds() as f64 / 1000.0).max(0.0);

    let n = timed.len() as f64;
    let mut speed_sum = 0.0;
    let mut harsh_brake_ct = 0u32;
    let mut phone_usage_ct = 0u32;
    let mut overspeed = 0usize;
    let mut night = 0usize;
    for (ts, p) in &timed {
        let speed = p.speed_mps.unwrap_or(0.0);
        speed_sum += speed;
        if p.braking_flag.unwrap_or(false) {
            harsh_brake_ct += 1;
        }
        if p.phone_usage_flag.unwrap_or(false) {
            phone_usage_ct += 1;
        }
        // No posted limit: compare against the point's own speed, i.e. never over.
        let limit = p.road_speed_limit.unwrap_or(speed);
        if speed > limit + OVERSPEED_TOLERANCE_MPS {
            overspeed += 1;
        }
        if is_night(ts) {
            night += 1;
        }
    }

    Reconstruction {
        summary: Some(TripSummary {
            policy_id: key.policy_id.clone(),
            trip_id: key.trip_id.clone(),
            start_ts,
            end_ts,
            duration_s,
            miles: dist_m / METERS_PER_MILE,
            avg_speed_mps: speed_sum / n,
            harsh_brake_ct,
            phone_usage_ct,
            overspeed_ratio: overspeed as f64 / n,
            night_ratio: night as f64 / n,
        }),
        dropped_points,
        points_missing_coords,
    }
}

/// Reconstruct every batch. Summaries come back sorted by (policy, trip).
pub fn reconstruct_all(batches: &[TripBatch]) -> (Vec<TripSummary>, ReconstructStats) {
    let mut stats = ReconstructStats::default();
    let mut out = Vec::with_capacity(batches.len());
    for batch in batches {
        stats.trips_seen += 1;
        stats.malformed_lines += batch.malformed_lines;
        let r = reconstruct(&batch.key, &batch.points);
        stats.dropped_points += r.dropped_points;
        stats.points_missing_coords += r.points_missing_coords;
        match r.summary {
            Some(summary) => out.push(summary),
            None => {
                stats.empty_trips += 1;
                tracing::debug!(
                    policy_id = %batch.key.policy_id,
                    trip_id = %batch.key.trip_id,
                    points = batch.points.len(),
                    "empty trip: no parseable timestamps"
                );
            }
        }
    }
    out.sort_by(|a, b| (&a.policy_id, &a.trip_id).cmp(&(&b.policy_id, &b.trip_id)));
    stats.summaries = out.len();
    (out, stats)
}
