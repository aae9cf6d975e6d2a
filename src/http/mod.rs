//! HTTP API for controlling the conversation
//!
//! Mirrors the controls of a voice UI:
//! - POST /conversation/start - Start talking
//! - POST /conversation/stop - Hang up
//! - POST /conversation/mute - Mute or unmute the microphone
//! - GET /conversation/status - Status line and live stats
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{
    ErrorResponse, MuteRequest, StartConversationResponse, StatusResponse,
    StopConversationResponse,
};
pub use routes::create_router;
pub use state::AppState;
