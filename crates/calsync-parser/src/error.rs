use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("recurrence rule is malformed: {0}")]
    Recurrence(String),
}
