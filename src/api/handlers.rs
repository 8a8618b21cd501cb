use axum::extract::{Path, State};
use axum::http::header::{HeaderValue, LOCATION};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ZipError;
use crate::models::{CreateUrlRequest, HealthResponse, UrlResponse};
use crate::service::ShortenerService;

pub struct AppState {
    pub service: Arc<ShortenerService>,
    pub base_url: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_reply(err: ZipError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ZipError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ZipError::Conflict(_) => StatusCode::CONFLICT,
        ZipError::NotFound => StatusCode::NOT_FOUND,
        ZipError::TemporarilyUnavailable(_) | ZipError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ZipError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Create a new shortened URL.
pub async fn shorten_url(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateUrlRequest>,
) -> Result<(StatusCode, Json<UrlResponse>), (StatusCode, Json<ErrorResponse>)> {
    let CreateUrlRequest { url, custom_code } = payload;

    match state.service.create(&url, custom_code.as_deref()).await {
        Ok(record) => Ok((
            StatusCode::CREATED,
            Json(UrlResponse::from_record(&record, &state.base_url)),
        )),
        Err(err) => Err(error_reply(err)),
    }
}

/// URL statistics including clicks still buffered in the cache.
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
) -> Result<Json<UrlResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.service.statistics(&short_code).await {
        Ok(Some(record)) => Ok(Json(UrlResponse::from_record(&record, &state.base_url))),
        Ok(None) => Err(error_reply(ZipError::NotFound)),
        Err(err) => Err(error_reply(err)),
    }
}

/// Redirect to the original URL. 307 preserves the request method.
pub async fn redirect_url(
    State(state): State<Arc<AppState>>,
    Path(short_code): Path<String>,
) -> impl IntoResponse {
    match state.service.lookup(&short_code).await {
        Ok(Some(record)) => {
            state.service.track_click(&short_code).await;

            let location = match HeaderValue::try_from(&record.original_url) {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(
                        short_code = %short_code,
                        error = %err,
                        "stored url contains invalid header characters"
                    );
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "URL contains invalid characters for HTTP header",
                    )
                        .into_response();
                }
            };

            // Build the response from a header array directly; no HeaderMap
            // allocation on the hot path.
            (StatusCode::TEMPORARY_REDIRECT, [(LOCATION, location)]).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "URL not found").into_response(),
        Err(err) => error_reply(err).into_response(),
    }
}

/// Liveness plus backend reachability.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.service.health().await)
}
