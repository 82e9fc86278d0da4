use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use telematics_core::{period, store, Calibration, DriverPeriodRow, PricingResult, ScoringContext, Settings};
use tower_http::cors::CorsLayer;

use crate::model::ModelSlot;
use crate::types::{HealthOut, IngestOut, IngestPayload, ScoreOut};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(code: StatusCode, msg: impl std::fmt::Display) -> ApiError {
    (code, Json(json!({ "error": msg.to_string() })))
}

// ---------- Server state ----------

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub calibration: Calibration,
    pub model: Arc<ModelSlot>,
    // serializes appends to the per-trip ingest files
    pub ingest_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(settings: Settings, calibration: Calibration) -> Self {
        let model = Arc::new(ModelSlot::new(settings.model_path.clone()));
        Self {
            settings: Arc::new(settings),
            calibration,
            model,
            ingest_lock: Arc::new(Mutex::new(())),
        }
    }

    fn context(&self) -> Result<Arc<ScoringContext>, ApiError> {
        self.model
            .get()
            .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Model not loaded"))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ingest/telemetry", post(ingest))
        .route("/score", post(score))
        .route("/pricing/:policy_id", get(pricing))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// ---------- Handlers ----------

async fn healthz(State(state): State<AppState>) -> Json<HealthOut> {
    let ctx = state.model.get();
    Json(HealthOut {
        ok: true,
        model_loaded: ctx.is_some(),
        features: ctx.as_ref().map(|c| c.contract().names()),
        unknown_features: ctx.as_ref().map_or(0, |c| c.contract().unknown_names().len()),
        calibration: state.calibration.spec(),
    })
}

async fn ingest(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<IngestOut>, ApiError> {
    let batches = payload.into_batches();
    if batches.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "empty telemetry payload"));
    }
    if let Some(bad) = batches.iter().map(|b| b.key()).find(|k| !k.is_valid()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "invalid policy_id/trip_id {:?}/{:?}: no path separators, '..', '__' or edge '_'",
                bad.policy_id, bad.trip_id
            ),
        ));
    }

    let dir = state.settings.data_ingest.clone();
    let lock = state.ingest_lock.clone();
    let written = tokio::task::spawn_blocking(move || {
        let _guard = lock.lock();
        let mut received = 0;
        let mut last_file = None;
        for batch in batches {
            let key = batch.key();
            let points: Vec<_> = batch.points.into_iter().map(Into::into).collect();
            let path = store::append_points(&dir, &key, &points)?;
            received += points.len();
            last_file = Some(path.display().to_string());
        }
        Ok::<_, telematics_core::StoreError>((received, last_file))
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let (received, file) = written.map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    tracing::info!("ingested {} point(s)", received);

    Ok(Json(IngestOut {
        status: "ok",
        received,
        file,
    }))
}

async fn score(
    State(state): State<AppState>,
    Json(features): Json<HashMap<String, f64>>,
) -> Result<Json<ScoreOut>, ApiError> {
    let ctx = state.context()?;
    let vec = ctx.contract().vector_from_map(&features);

    // Debug signal so we can confirm we're not sending all-zeros
    if std::env::var("LOG_PRED").ok().as_deref() == Some("1") {
        let values = vec.values();
        let nz = values.iter().filter(|x| **x != 0.0).count();
        let mean = if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 };
        let std = if values.len() < 2 {
            0.0
        } else {
            (values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / values.len() as f64).sqrt()
        };
        let sample: Vec<String> = vec.iter().take(6).map(|(n, v)| format!("{n}={v:.3}")).collect();
        tracing::info!(
            "score in_dim={} nonzero={} mean={:.3} std={:.3} sample=[{}]",
            values.len(),
            nz,
            mean,
            std,
            sample.join(", ")
        );
    }

    let risk_p = ctx
        .probability(&vec)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ScoreOut { risk_p, features: vec }))
}

fn load_rows(settings: &Settings) -> Result<Vec<DriverPeriodRow>, ApiError> {
    let path = &settings.driver_period_csv;
    if !path.exists() {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{} not found; run the period builder first", path.display()),
        ));
    }
    store::read_csv(path).map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

async fn pricing(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<Json<PricingResult>, ApiError> {
    let ctx = state.context()?;
    let rows = load_rows(&state.settings)?;
    let row = period::latest_for_policy(&rows, &policy_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("No driver-period row for policy_id={policy_id}"),
        )
    })?;
    let res = ctx
        .price_row(row, &state.calibration)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    tracing::debug!(
        policy_id = %res.policy_id,
        risk_p = res.risk_p,
        factor = res.telematics_factor,
        "priced"
    );
    Ok(Json(res))
}
