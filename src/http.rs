//! Control surface for the collector: liveness, a status summary, and the
//! manual poll trigger. The read-side dashboard API lives elsewhere; these
//! endpoints only expose the collector's own state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use crate::scheduler::CollectionScheduler;

pub struct AppState {
    pub scheduler: Arc<CollectionScheduler>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/poll", post(trigger_poll))
        .with_state(state)
}

pub async fn serve(bind: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "control API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "minerwatch",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.scheduler.current_settings();
    let devices = state.scheduler.registry().snapshot();

    Json(json!({
        "status": "running",
        "polling_interval_minutes": settings.polling_interval_minutes,
        "device_check_interval_minutes": settings.device_check_interval_minutes,
        "pool_backend": settings.pool_backend.as_str(),
        "bitaxe_devices_count": devices.bitaxe.len(),
        "avalon_devices_count": devices.avalon.len(),
        "bitaxe_devices": devices.bitaxe.iter()
            .map(|d| json!({ "name": d.name, "ip": d.ip_address }))
            .collect::<Vec<_>>(),
        "avalon_devices": devices.avalon.iter()
            .map(|d| json!({ "name": d.name, "ip": d.ip_address }))
            .collect::<Vec<_>>(),
        "last_cycle": state.scheduler.last_summary(),
    }))
}

/// Manual trigger: runs exactly one cycle. Serialized against the periodic
/// schedule by the scheduler's cycle lock, so this can never overlap a
/// running cycle; the response is the cycle's best-effort summary even
/// under partial failure.
async fn trigger_poll(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("manual poll triggered via API");
    let summary = state.scheduler.run_cycle().await;
    Json(json!({
        "status": "success",
        "message": "poll cycle completed",
        "summary": summary,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
