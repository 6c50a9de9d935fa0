use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("oauth error: {0}")]
    OAuth(String),
    #[error("reauthorization required")]
    ReauthRequired,
    #[error("oauth callback rejected: {0}")]
    CallbackRejected(String),
    #[error("token store integrity check failed")]
    Integrity,
    #[error("token store passphrase required")]
    PassphraseRequired,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("loopback server error: {0}")]
    Server(String),
}
