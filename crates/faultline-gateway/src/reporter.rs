use async_trait::async_trait;
use faultline_state::ErrorOccurrence;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Occurrence rejected: {0}")]
    Rejected(String),

    #[error("Reporter backend error: {0}")]
    Backend(String),
}

/// Receives occurrences captured by the interceptor.
///
/// Called on a detached task; a slow or failing reporter never affects the
/// response already sent to the client.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, occurrence: ErrorOccurrence) -> Result<(), ReportError>;
}
