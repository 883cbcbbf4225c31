use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use mux_bus::SessionSummary;
use serde::{Deserialize, Serialize};

use crate::{
    handler::ApiJsonResult,
    service::{RecorderService, SessionStatus},
};

pub fn session_router(service: RecorderService) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/start", post(start))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/frame", post(submit_frame))
        .with_state(service)
}

#[derive(Serialize, Deserialize)]
struct StartResponse {
    path: String,
}

async fn status(State(service): State<RecorderService>) -> ApiJsonResult<SessionStatus> {
    Ok(Json(service.status().await?))
}

async fn start(State(service): State<RecorderService>) -> ApiJsonResult<StartResponse> {
    let path = service.start().await?;
    Ok(Json(StartResponse {
        path: path.display().to_string(),
    }))
}

async fn pause(State(service): State<RecorderService>) -> ApiJsonResult<String> {
    service.pause().await?;
    Ok(Json("success".to_string()))
}

async fn resume(State(service): State<RecorderService>) -> ApiJsonResult<String> {
    service.resume().await?;
    Ok(Json("success".to_string()))
}

async fn stop(State(service): State<RecorderService>) -> ApiJsonResult<SessionSummary> {
    Ok(Json(service.stop().await?))
}

async fn submit_frame(State(service): State<RecorderService>, body: Bytes) -> StatusCode {
    if service.submit_frame(body) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    }
}
