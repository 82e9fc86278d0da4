//! # batch_pipeline
//!
//! Offline stages of the telematics pricing pipeline.
//!
//! ## Usage
//! ```bash
//! batch_pipeline all
//! batch_pipeline --config settings.json periods
//! batch_pipeline --driver-period-csv /tmp/dp.csv price
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telematics_core::Settings;
use tracing_subscriber::EnvFilter;

mod stages;

#[derive(Parser, Debug)]
#[command(name = "batch_pipeline")]
#[command(about = "Trips, driver-period features, claim labels and pricing preview")]
#[command(version)]
struct Cli {
    /// JSON settings file; environment variables still override it
    #[arg(long, env = "TELEMATICS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    ingest_dir: Option<PathBuf>,

    #[arg(long)]
    trips_csv: Option<PathBuf>,

    #[arg(long)]
    driver_period_csv: Option<PathBuf>,

    #[arg(long)]
    claims_csv: Option<PathBuf>,

    #[arg(long)]
    model_path: Option<PathBuf>,

    #[command(subcommand)]
    stage: Stage,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Reconstruct trip summaries from the ingest directory
    Trips,
    /// Aggregate trips into monthly driver-period rows
    Periods,
    /// Attach the next-window claim label to every period row
    Label,
    /// Score the latest period of each policy and write the pricing preview
    Price,
    /// Run trips, periods, label and price in order
    All,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => {
                let _ = dotenvy::dotenv();
                let mut s = Settings::from_file(path)?;
                s.apply_overrides(|k| std::env::var(k).ok())?;
                s
            }
            None => Settings::load()?,
        };

        let overrides = [
            (&self.ingest_dir, &mut settings.data_ingest),
            (&self.trips_csv, &mut settings.trips_csv),
            (&self.driver_period_csv, &mut settings.driver_period_csv),
            (&self.claims_csv, &mut settings.claims_csv),
            (&self.model_path, &mut settings.model_path),
        ];
        for (arg, slot) in overrides {
            if let Some(p) = arg {
                *slot = p.clone();
            }
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn run(stage: Stage, settings: &Settings) -> Result<()> {
    match stage {
        Stage::Trips => {
            stages::build_trips(settings)?;
        }
        Stage::Periods => {
            stages::build_periods(settings, None)?;
        }
        Stage::Label => {
            stages::label_periods(settings)?;
        }
        Stage::Price => {
            stages::price_latest(settings)?;
        }
        Stage::All => {
            // checked before the trips stage rewrites its table
            let incremental = stages::periods_current(settings);
            let report = stages::build_trips(settings)?;
            stages::build_periods(settings, incremental.then_some(&report))?;
            stages::label_periods(settings)?;
            if settings.model_path.exists() {
                stages::price_latest(settings)?;
            } else {
                tracing::warn!(
                    "price: no model artifact at {}; pricing preview skipped",
                    settings.model_path.display()
                );
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings().context("invalid configuration")?;
    tracing::debug!("settings: {:?}", settings);
    run(cli.stage, &settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_paths_override_settings() {
        let cli = Cli::try_parse_from([
            "batch_pipeline",
            "--trips-csv",
            "/tmp/t.csv",
            "--model-path",
            "/tmp/m.json",
            "periods",
        ])
        .unwrap();
        assert_eq!(cli.stage, Stage::Periods);

        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("settings.json");
        std::fs::write(&cfg, r#"{"driver_period_csv":"/data/dp.csv","calibration":{"slope":0.8}}"#).unwrap();
        let cli = Cli {
            config: Some(cfg),
            ..cli
        };
        let s = cli.settings().unwrap();
        assert_eq!(s.trips_csv, PathBuf::from("/tmp/t.csv"));
        assert_eq!(s.model_path, PathBuf::from("/tmp/m.json"));
        assert_eq!(s.calibration.slope, 0.8);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!(Cli::try_parse_from(["batch_pipeline", "train"]).is_err());
    }
}
