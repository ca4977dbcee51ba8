use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
