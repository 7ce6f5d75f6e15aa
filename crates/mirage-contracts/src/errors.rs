use thiserror::Error;

/// Failure taxonomy for every backend operation. Callers branch on the
/// variant, never on message text: `InsufficientCredits` routes to the
/// upgrade flow, `SessionExpired` to the auth layer, everything else is a
/// retryable-by-user error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("insufficient credits")]
    InsufficientCredits,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("session expired")]
    SessionExpired,
    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Navigation requests the engine emits but never performs itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedAction {
    RequireLogin,
    RequireUpgrade,
}

/// Lifecycle signals from the session refresh scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Renewed { expires_at_ms: i64 },
    Expired { reason: String },
}
