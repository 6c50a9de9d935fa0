mod callback_server;
mod error;
mod oauth;
mod token_store;

pub use callback_server::{serve_loopback, CallbackOutcome};
pub use error::SecurityError;
pub use oauth::{OAuthProfile, OAuthWorkflow, PendingAuthorization};
pub use token_store::{decode as decode_token, encode as encode_token, StorageMode};
