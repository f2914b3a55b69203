use std::time::Duration;

/// Failures surfaced by the message bus request/response primitive.
///
/// Everything else in the kernel reports failure through status codes,
/// booleans or per-instance error fields rather than raised errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is stopped")]
    Stopped,

    #[error("target '{0}' is not reachable")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("pending request was cancelled")]
    Cancelled,
}

impl BusError {
    /// Whether the failure was detected without waiting out a timeout.
    pub fn is_immediate(&self) -> bool {
        matches!(self, BusError::Stopped | BusError::Unreachable(_))
    }
}
