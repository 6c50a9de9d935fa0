use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("remote event fetch failed: {0}")]
    Fetch(String),
    #[error("batch sub-batch response part count did not match request count: expected {expected}, got {got}")]
    PartCountMismatch { expected: usize, got: usize },
    #[error("sub-batch exhausted its retry budget: {0}")]
    RetryExhausted(String),
    #[error("sync run was cancelled")]
    Cancelled,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("security error: {0}")]
    Security(#[from] calsync_security::SecurityError),
}
