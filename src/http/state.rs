use crate::session::ConversationManager;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The single conversation this process controls
    pub manager: ConversationManager,
}

impl AppState {
    pub fn new(manager: ConversationManager) -> Self {
        Self { manager }
    }
}
