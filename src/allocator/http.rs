//! HTTP surface for running the allocator as a standalone service.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::service::{AllocatedRange, AllocatorMetricsSnapshot, IdAllocator, ServiceHealth};
use crate::error::ZipError;

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AllocateResponse {
    pub start: i64,
    pub end: i64,
    pub source: String,
}

impl From<AllocatedRange> for AllocateResponse {
    fn from(range: AllocatedRange) -> Self {
        Self {
            start: range.start,
            end: range.end,
            source: range.source.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AllocatorHealthResponse {
    pub status: ServiceHealth,
    pub cache: ServiceHealth,
    pub database: ServiceHealth,
}

#[derive(Debug, Serialize)]
pub struct AllocatorStatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub block_size: i64,
    pub health: AllocatorHealthResponse,
    pub metrics: AllocatorMetricsSnapshot,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn create_allocator_router(allocator: Arc<IdAllocator>) -> Router {
    Router::new()
        .route("/allocate", post(allocate))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(allocator)
}

async fn allocate(
    State(allocator): State<Arc<IdAllocator>>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, (StatusCode, Json<ErrorResponse>)> {
    let size = request.size.unwrap_or(allocator.config().block_size);

    match allocator.allocate_range(size).await {
        Ok(range) => Ok(Json(range.into())),
        Err(ZipError::InvalidArgument(message)) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: message }),
        )),
        Err(err @ ZipError::TemporarilyUnavailable(_)) | Err(err @ ZipError::Unavailable(_)) => {
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            ))
        }
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        )),
    }
}

async fn health(State(allocator): State<Arc<IdAllocator>>) -> Json<AllocatorHealthResponse> {
    let (overall, cache, database) = allocator.probe_health().await;
    Json(AllocatorHealthResponse {
        status: overall,
        cache,
        database,
    })
}

async fn metrics(State(allocator): State<Arc<IdAllocator>>) -> Json<AllocatorMetricsSnapshot> {
    Json(allocator.metrics())
}

async fn status(State(allocator): State<Arc<IdAllocator>>) -> Json<AllocatorStatusResponse> {
    let (overall, cache, database) = allocator.probe_health().await;
    Json(AllocatorStatusResponse {
        service: "zipline-allocator",
        version: env!("CARGO_PKG_VERSION"),
        block_size: allocator.config().block_size,
        health: AllocatorHealthResponse {
            status: overall,
            cache,
            database,
        },
        metrics: allocator.metrics(),
    })
}
