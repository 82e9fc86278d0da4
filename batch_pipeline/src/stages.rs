//! One function per pipeline stage. Each reads its inputs from the paths in
//! [`Settings`], writes its table atomically and returns counts for logging.

use anyhow::{Context, Result};
use std::collections::HashMap;
use telematics_core::store::{self, PricingPreviewRow};
use telematics_core::{labels, period, trip, DriverPeriodRow, ScoringContext, Settings, TripKey, TripSummary};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TripsReport {
    pub files: usize,
    pub trips: usize,
    pub empty_trips: usize,
    pub dropped_points: usize,
    pub malformed_lines: usize,
    /// Summaries that are new or differ from the previous trips table.
    pub changed: Vec<TripSummary>,
    /// Previous-table versions of trips that changed or disappeared.
    pub superseded: Vec<TripSummary>,
}

/// Whether the driver-period table was written after the current trips
/// table, so an incremental rebuild can start from it.
pub fn periods_current(settings: &Settings) -> bool {
    let modified = |p: &std::path::Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(&settings.driver_period_csv), modified(&settings.trips_csv)) {
        (Some(periods), Some(trips)) => periods >= trips,
        _ => false,
    }
}

/// Ingest directory -> trips table.
pub fn build_trips(settings: &Settings) -> Result<TripsReport> {
    let batches = store::read_ingest_dir(&settings.data_ingest)
        .with_context(|| format!("reading ingest dir {}", settings.data_ingest.display()))?;
    let (trips, stats) = trip::reconstruct_all(&batches);

    let previous: HashMap<TripKey, TripSummary> = if settings.trips_csv.exists() {
        let (prev, _) = store::read_trips(&settings.trips_csv)?;
        prev.into_iter().map(|t| (t.key(), t)).collect()
    } else {
        HashMap::new()
    };
    let current: HashMap<TripKey, &TripSummary> = trips.iter().map(|t| (t.key(), t)).collect();
    let changed = trips
        .iter()
        .filter(|t| previous.get(&t.key()) != Some(*t))
        .cloned()
        .collect();
    let mut superseded: Vec<TripSummary> = previous
        .into_iter()
        .filter(|(key, t)| current.get(key) != Some(&t))
        .map(|(_, t)| t)
        .collect();
    superseded.sort_by(|a, b| a.key().cmp(&b.key()));

    store::write_csv(&settings.trips_csv, &trips)?;
    tracing::info!(
        "trips: {} file(s) -> {} trip(s) ({} empty, {} point(s) dropped, {} malformed line(s), {} missing coords) -> {}",
        stats.trips_seen,
        stats.summaries,
        stats.empty_trips,
        stats.dropped_points,
        stats.malformed_lines,
        stats.points_missing_coords,
        settings.trips_csv.display()
    );
    Ok(TripsReport {
        files: stats.trips_seen,
        trips: stats.summaries,
        empty_trips: stats.empty_trips,
        dropped_points: stats.dropped_points,
        malformed_lines: stats.malformed_lines,
        changed,
        superseded,
    })
}

/// Trips table -> driver-period table.
///
/// With a trips report and a previous table on disk only the periods touched
/// by the report's changed or superseded trips are rebuilt; otherwise every
/// period is recomputed.
pub fn build_periods(settings: &Settings, changes: Option<&TripsReport>) -> Result<usize> {
    let (trips, dropped) = store::read_trips(&settings.trips_csv)
        .with_context(|| format!("reading {}; run the trips stage first", settings.trips_csv.display()))?;
    if dropped > 0 {
        tracing::warn!("periods: {} trip row(s) with unparseable timestamps dropped", dropped);
    }

    let (rows, stats) = match changes {
        Some(report) if settings.driver_period_csv.exists() => {
            let previous: Vec<DriverPeriodRow> = store::read_csv(&settings.driver_period_csv)?;
            period::refresh(&previous, &trips, &report.changed, &report.superseded)
        }
        _ => period::aggregate(&trips),
    };

    store::write_csv(&settings.driver_period_csv, &rows)?;
    tracing::info!(
        "periods: {} trip(s) -> {} row(s) ({} recomputed, {} removed, {} single-trip, {} zero-exposure, {} defaulted value(s)) -> {}",
        stats.trips_in,
        stats.rows_out,
        stats.rows_recomputed,
        stats.rows_removed,
        stats.single_trip_groups,
        stats.zero_exposure_groups,
        stats.defaulted_values,
        settings.driver_period_csv.display()
    );
    Ok(rows.len())
}

/// Driver-period table + claims -> labeled table. Returns (rows, positives).
pub fn label_periods(settings: &Settings) -> Result<(usize, usize)> {
    let rows: Vec<DriverPeriodRow> = store::read_csv(&settings.driver_period_csv)
        .with_context(|| format!("reading {}", settings.driver_period_csv.display()))?;
    let claims = match store::read_claims(&settings.claims_csv)? {
        Some(c) => c,
        None => {
            tracing::warn!(
                "label: no claims table at {}; every row labeled 0",
                settings.claims_csv.display()
            );
            Vec::new()
        }
    };

    let labeled = labels::label_rows(&rows, &claims, settings.label_window_days);
    let positives = labeled.iter().filter(|l| l.label_claim_next90d == 1).count();
    store::write_labeled(&settings.labeled_csv, &labeled)?;
    tracing::info!(
        "label: {} row(s), {} claim(s), {} positive -> {}",
        labeled.len(),
        claims.len(),
        positives,
        settings.labeled_csv.display()
    );
    Ok((labeled.len(), positives))
}

/// Latest period per policy -> pricing preview.
pub fn price_latest(settings: &Settings) -> Result<usize> {
    let calibration = settings.calibration()?;
    let ctx = ScoringContext::load(&settings.model_path)
        .with_context(|| format!("loading model artifact {}", settings.model_path.display()))?;
    let rows: Vec<DriverPeriodRow> = store::read_csv(&settings.driver_period_csv)
        .with_context(|| format!("reading {}", settings.driver_period_csv.display()))?;

    let mut preview = Vec::new();
    for row in period::latest_per_policy(&rows) {
        match ctx.price_row(row, &calibration) {
            Ok(res) => preview.push(PricingPreviewRow {
                policy_id: res.policy_id,
                period_start: res.period_start,
                risk_p: res.risk_p,
                telematics_factor: res.telematics_factor,
            }),
            Err(e) => tracing::warn!("price: skipping {} {}: {}", row.policy_id, row.period_start, e),
        }
    }

    store::write_csv(&settings.pricing_csv, &preview)?;
    tracing::info!(
        "price: {} polic(ies) priced -> {}",
        preview.len(),
        settings.pricing_csv.display()
    );
    Ok(preview.len())
}
