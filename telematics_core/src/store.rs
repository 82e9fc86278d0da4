//! Flat-file boundary: JSONL ingest files and CSV tables.
//!
//! Core transforms never call into this module; the binaries read complete
//! collections here, run the pure stages, and write complete tables back.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::labels::{ClaimRecord, LabeledRow};
use crate::trip::{parse_instant, TripBatch};
use crate::types::{TelemetryPoint, TripKey, TripSummary};

type Result<T> = std::result::Result<T, StoreError>;

/// Load every `<policy>__<trip>.jsonl` file in `dir`, in file-name order.
/// A missing directory reads as no trips.
pub fn read_ingest_dir(dir: impl AsRef<Path>) -> Result<Vec<TripBatch>> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    files.iter().map(|p| read_trip_file(p)).collect()
}

pub fn read_trip_file(path: &Path) -> Result<TripBatch> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let key = TripKey::from_file_stem(stem);
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut points = Vec::new();
    let mut malformed_lines = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryPoint>(&line) {
            Ok(p) => points.push(p),
            Err(_) => malformed_lines += 1,
        }
    }
    Ok(TripBatch {
        key,
        points,
        malformed_lines,
    })
}

/// Append points to the trip's JSONL file, creating the directory if needed.
/// Keys that fail [`TripKey::is_valid`] are refused before touching disk.
pub fn append_points(dir: impl AsRef<Path>, key: &TripKey, points: &[TelemetryPoint]) -> Result<PathBuf> {
    if !key.is_valid() {
        return Err(StoreError::InvalidKey {
            policy_id: key.policy_id.clone(),
            trip_id: key.trip_id.clone(),
        });
    }
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let path = dir.join(format!("{}.jsonl", key.file_stem()));
    let mut buf = String::new();
    for p in points {
        let mut rec = p.clone();
        rec.policy_id = Some(key.policy_id.clone());
        rec.trip_id = Some(key.trip_id.clone());
        buf.push_str(&serde_json::to_string(&rec)?);
        buf.push('\n');
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;
    f.write_all(buf.as_bytes()).map_err(|e| StoreError::io(&path, e))?;
    Ok(path)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("table");
    path.with_file_name(format!(".{name}.tmp"))
}

// Whole table or nothing: write a sibling temp file, then rename over the target.
fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<File>) -> std::result::Result<(), csv::Error>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = tmp_sibling(path);
    let result = (|| {
        let mut w = csv::Writer::from_path(&tmp)?;
        fill(&mut w)?;
        w.flush()?;
        Ok::<_, csv::Error>(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::csv(path, e));
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

pub fn write_csv<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> Result<()> {
    write_atomic(path.as_ref(), |w| {
        for r in rows {
            w.serialize(r)?;
        }
        Ok(())
    })
}

pub fn read_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    rdr.deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(|e| StoreError::csv(path, e))
}

// Tolerant view of a trips table written by any producer.
#[derive(Debug, Deserialize)]
struct TripCsvRow {
    #[serde(default)]
    policy_id: String,
    #[serde(default)]
    trip_id: String,
    #[serde(default)]
    start_ts: Option<String>,
    #[serde(default)]
    end_ts: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    duration_s: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    miles: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    avg_speed_mps: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    harsh_brake_ct: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    phone_usage_ct: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    overspeed_ratio: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    night_ratio: Option<f64>,
}

fn count(v: Option<f64>) -> u32 {
    match v {
        Some(c) if c.is_finite() && c > 0.0 => c.round().min(f64::from(u32::MAX)) as u32,
        _ => 0,
    }
}

/// Read a trips table. Rows whose start or end timestamp does not parse are
/// dropped; the second value is how many.
///
/// A missing average speed is kept as NaN so the aggregator can fall back to
/// distance over time.
pub fn read_trips(path: impl AsRef<Path>) -> Result<(Vec<TripSummary>, usize)> {
    let path = path.as_ref();
    let raw: Vec<TripCsvRow> = read_csv(path)?;
    let mut dropped = 0;
    let mut trips = Vec::with_capacity(raw.len());
    for r in raw {
        let start = r.start_ts.as_deref().and_then(parse_instant);
        let end = r.end_ts.as_deref().and_then(parse_instant);
        let (Some(start_ts), Some(end_ts)) = (start, end) else {
            dropped += 1;
            continue;
        };
        trips.push(TripSummary {
            policy_id: r.policy_id,
            trip_id: r.trip_id,
            start_ts,
            end_ts,
            duration_s: r.duration_s.unwrap_or(0.0),
            miles: r.miles.unwrap_or(0.0),
            avg_speed_mps: r.avg_speed_mps.unwrap_or(f64::NAN),
            harsh_brake_ct: count(r.harsh_brake_ct),
            phone_usage_ct: count(r.phone_usage_ct),
            overspeed_ratio: r.overspeed_ratio.unwrap_or(0.0),
            night_ratio: r.night_ratio.unwrap_or(0.0),
        });
    }
    Ok((trips, dropped))
}

#[derive(Debug, Deserialize)]
struct ClaimCsvRow {
    policy_id: String,
    #[serde(default)]
    loss_dt: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    at_fault_flag: Option<f64>,
}

/// Read the claims table. `Ok(None)` when the file does not exist.
pub fn read_claims(path: impl AsRef<Path>) -> Result<Option<Vec<ClaimRecord>>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let raw: Vec<ClaimCsvRow> = read_csv(path)?;
    let claims = raw
        .into_iter()
        .filter_map(|r| {
            let loss_dt = r.loss_dt.as_deref().and_then(parse_instant)?;
            Some(ClaimRecord {
                policy_id: r.policy_id,
                loss_dt,
                at_fault: r.at_fault_flag.is_some_and(|f| f >= 0.5),
            })
        })
        .collect();
    Ok(Some(claims))
}

const LABELED_HEADER: [&str; 15] = [
    "policy_id",
    "period_start",
    "trip_ct",
    "exposure_miles",
    "duration_s",
    "harsh_brake_per_100mi",
    "overspeed_ratio",
    "night_ratio",
    "avg_overspeed_ratio",
    "night_miles_ratio",
    "phone_usage_per_hr",
    "mean_speed_mps",
    "miles_per_trip",
    "speed_var_across_trips",
    "label_claim_next90d",
];

pub fn write_labeled(path: impl AsRef<Path>, rows: &[LabeledRow]) -> Result<()> {
    write_atomic(path.as_ref(), |w| {
        w.write_record(LABELED_HEADER)?;
        for l in rows {
            let r = &l.row;
            let mut rec = vec![
                r.policy_id.clone(),
                r.period_start.to_string(),
                r.trip_ct.to_string(),
            ];
            rec.extend(
                [
                    r.exposure_miles,
                    r.duration_s,
                    r.harsh_brake_per_100mi,
                    r.overspeed_ratio,
                    r.night_ratio,
                    r.avg_overspeed_ratio,
                    r.night_miles_ratio,
                    r.phone_usage_per_hr,
                    r.mean_speed_mps,
                    r.miles_per_trip,
                    r.speed_var_across_trips,
                ]
                .iter()
                .map(|v| v.to_string()),
            );
            rec.push(l.label_claim_next90d.to_string());
            w.write_record(&rec)?;
        }
        Ok(())
    })
}

/// One line of the batch pricing preview table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPreviewRow {
    pub policy_id: String,
    pub period_start: NaiveDate,
    pub risk_p: f64,
    pub telematics_factor: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DriverPeriodRow;
    use std::io::Write as _;

    #[test]
    fn test_ingest_round_trip_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let key = TripKey::new("P7", "T3");
        let p = TelemetryPoint {
            ts: Some("2024-05-01T10:00:00Z".into()),
            lat: Some(40.0),
            lon: Some(-3.7),
            speed_mps: Some(12.0),
            braking_flag: Some(true),
            ..Default::default()
        };
        let path = append_points(dir.path(), &key, &[p.clone(), p.clone()]).unwrap();
        assert!(path.ends_with("P7__T3.jsonl"));

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        writeln!(f).unwrap();

        let batches = read_ingest_dir(dir.path()).unwrap();
        assert_eq!(batches.len(), 1);
        let b = &batches[0];
        assert_eq!(b.key, key);
        assert_eq!(b.points.len(), 2);
        assert_eq!(b.malformed_lines, 1);
        assert_eq!(b.points[0].policy_id.as_deref(), Some("P7"));
        assert_eq!(b.points[0].braking_flag, Some(true));
    }

    #[test]
    fn test_append_refuses_escaping_key() {
        let dir = tempfile::tempdir().unwrap();
        let ingest = dir.path().join("data_ingest");
        let err = append_points(&ingest, &TripKey::new("../escaped", "T1"), &[TelemetryPoint::default()]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(!dir.path().join("escaped__T1.jsonl").exists());
        assert!(!ingest.exists(), "nothing written for a refused key");
    }

    #[test]
    fn test_missing_ingest_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let batches = read_ingest_dir(dir.path().join("nope")).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_lenient_trip_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trips.csv");
        fs::write(
            &path,
            "policy_id,trip_id,start_ts,end_ts,duration_s,miles,avg_speed_mps,harsh_brake_ct\n\
             P1,T1,2024-03-01T12:00:00+00:00,2024-03-01T12:10:00+00:00,600,2.0,,2\n\
             P1,T2,not-a-date,2024-03-01T12:10:00+00:00,600,2.0,10,0\n\
             P2,T1,2024-03-02 08:00:00+00:00,2024-03-02 08:01:00+00:00,60,abc,NaN,1.0\n",
        )
        .unwrap();
        let (trips, dropped) = read_trips(&path).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(trips.len(), 2);
        assert!(trips[0].avg_speed_mps.is_nan(), "blank speed stays missing");
        assert_eq!(trips[0].harsh_brake_ct, 2);
        assert_eq!(trips[0].night_ratio, 0.0, "absent column defaults to 0");
        assert_eq!(trips[1].miles, 0.0, "invalid number defaults to 0");
        assert_eq!(trips[1].harsh_brake_ct, 1);
    }

    #[test]
    fn test_atomic_write_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/driver_period.csv");
        let row = DriverPeriodRow {
            policy_id: "P1".into(),
            period_start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            trip_ct: 2,
            exposure_miles: 1.5,
            duration_s: 100.0,
            harsh_brake_per_100mi: 0.0,
            overspeed_ratio: 0.0,
            night_ratio: 0.0,
            avg_overspeed_ratio: 0.0,
            night_miles_ratio: 0.0,
            phone_usage_per_hr: 0.0,
            mean_speed_mps: 5.0,
            miles_per_trip: 0.75,
            speed_var_across_trips: 0.5,
        };
        write_csv(&path, &[row.clone(), row.clone()]).unwrap();
        write_csv(&path, &[row.clone()]).unwrap();
        let back: Vec<DriverPeriodRow> = read_csv(&path).unwrap();
        assert_eq!(back, vec![row.clone()]);
        assert!(!tmp_sibling(&path).exists(), "temp file is renamed away");

        let labeled = dir.path().join("labeled.csv");
        write_labeled(&labeled, &[LabeledRow { row, label_claim_next90d: 1 }]).unwrap();
        let txt = fs::read_to_string(&labeled).unwrap();
        assert!(txt.starts_with("policy_id,period_start,trip_ct"));
        assert!(txt.trim_end().ends_with(",1"));
    }

    #[test]
    fn test_claims_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.csv");
        assert!(read_claims(&path).unwrap().is_none());
        fs::write(
            &path,
            "claim_id,policy_id,loss_dt,at_fault_flag,severity\n\
             C1,P1,2024-02-10,1,1200\n\
             C2,P1,2024-02-11,0,100\n\
             C3,P2,??,1,50\n",
        )
        .unwrap();
        let claims = read_claims(&path).unwrap().unwrap();
        assert_eq!(claims.len(), 2);
        assert!(claims[0].at_fault);
        assert!(!claims[1].at_fault);
    }
}
