use thiserror::Error;

/// Aggregates the per-crate error enums so the app binary's top-level
/// `anyhow::Result` boundary has one conversion target.
#[derive(Debug, Error)]
pub enum CalsyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("security error: {0}")]
    Security(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("parser error: {0}")]
    Parser(String),
    #[error("calendar error: {0}")]
    Calendar(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}
