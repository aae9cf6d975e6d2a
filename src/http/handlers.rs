use super::state::AppState;
use crate::error::ConverseError;
use crate::session::{ConversationStats, ConversationStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Serialize)]
pub struct StartConversationResponse {
    pub session_id: String,
    pub status: ConversationStatus,
}

#[derive(Debug, Serialize)]
pub struct StopConversationResponse {
    pub status: ConversationStatus,
    pub stats: ConversationStats,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: ConversationStatus,
    pub stats: Option<ConversationStats>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /conversation/start
/// Open devices and the session; responds once the service accepted it
pub async fn start_conversation(State(state): State<AppState>) -> impl IntoResponse {
    info!("Starting conversation via HTTP");

    match state.manager.start().await {
        Ok(session_id) => (
            StatusCode::OK,
            Json(StartConversationResponse {
                session_id,
                status: state.manager.status(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start conversation: {}", e);
            let status = match e {
                ConverseError::AlreadyRunning | ConverseError::Cancelled => StatusCode::CONFLICT,
                ConverseError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                ConverseError::SessionOpenFailed(_) | ConverseError::SessionErrored(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e.to_string())
        }
    }
}

/// POST /conversation/stop
/// Tear the conversation down and return its final stats
pub async fn stop_conversation(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.stop().await {
        Some(stats) => {
            info!("Conversation {} stopped via HTTP", stats.session_id);
            (
                StatusCode::OK,
                Json(StopConversationResponse {
                    status: state.manager.status(),
                    stats,
                }),
            )
                .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "No conversation running"),
    }
}

/// POST /conversation/mute
pub async fn set_mute(
    State(state): State<AppState>,
    Json(req): Json<MuteRequest>,
) -> impl IntoResponse {
    state.manager.set_muted(req.muted);
    (StatusCode::OK, Json(state.manager.status()))
}

/// GET /conversation/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.manager.stats().await;
    (
        StatusCode::OK,
        Json(StatusResponse {
            status: state.manager.status(),
            stats,
        }),
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
