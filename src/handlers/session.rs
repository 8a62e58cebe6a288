//! Session control for the UI: start, stop, status and transcript.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `POST /api/v1/session/start`
///
/// Waits until the backend session is ready (or failed). 409 while a session is live,
/// 503 when the microphone cannot be opened, 502 when the backend refuses.
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.coach.start().await?;
    info!("Session started via HTTP: {:?}", snapshot.session_id);

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    })))
}

/// `POST /api/v1/session/stop`, always succeeds.
pub async fn stop_session(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.coach.stop();

    HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    }))
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.coach.snapshot())
}

pub async fn get_transcript(state: web::Data<AppState>) -> HttpResponse {
    let entries = state.coach.transcript();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": entries.len(),
        "entries": entries
    }))
}
