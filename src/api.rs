//! REST API server for the fiscal pipeline
//!
//! Accepts document batches, returns job ids at once and serves job state
//! for polling.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::FiscalDocument;
use crate::orchestrator::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitJobRequest {
    pub documents: Vec<FiscalDocument>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn reject(status: StatusCode, message: impl Into<String>) -> Reply {
    (status, Json(ApiResponse::error(message)))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn parse_job_id(raw: &str) -> Result<Uuid, Reply> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| reject(StatusCode::BAD_REQUEST, format!("invalid job id: {}", raw)))
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Job Endpoints
/// =============================

async fn submit_job(
    State(state): State<ApiState>,
    Json(req): Json<SubmitJobRequest>,
) -> Reply {
    if req.documents.is_empty() {
        return reject(StatusCode::BAD_REQUEST, "at least one document is required");
    }
    if let Some(doc) = req.documents.iter().find(|d| d.name.trim().is_empty()) {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("document with empty name ({} chars of text)", doc.text.len()),
        );
    }

    info!(documents = req.documents.len(), "Received job submission");

    match state.orchestrator.submit(req.documents).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({
                "jobId": job_id,
                "status": "processing",
            }))),
        ),
        Err(e) => {
            error!(error = %e, "Job submission failed");
            reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Job submission failed: {}", e),
            )
        }
    }
}

async fn get_job(State(state): State<ApiState>, Path(raw_id): Path<String>) -> Reply {
    let job_id = match parse_job_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };

    match state.orchestrator.job(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(ApiResponse::success(job))),
        Ok(None) => reject(
            StatusCode::NOT_FOUND,
            format!("job {} not found or expired", job_id),
        ),
        Err(e) => reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Job lookup failed: {}", e),
        ),
    }
}

async fn get_job_events(State(state): State<ApiState>, Path(raw_id): Path<String>) -> Reply {
    let job_id = match parse_job_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };

    let events = state.orchestrator.event_log().events_for(job_id).await;
    if events.is_empty() {
        return reject(
            StatusCode::NOT_FOUND,
            format!("no events recorded for job {}", job_id),
        );
    }
    (StatusCode::OK, Json(ApiResponse::success(events)))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/events", get(get_job_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
