use crate::SecurityError;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const PORT_RETRY_ATTEMPTS: u16 = 9;

/// Query parameters lifted off `GET /oauth2callback`, handed to the OAuth2
/// Manager untouched (spec.md §4.7).
#[derive(Debug, Clone, Default)]
pub struct CallbackOutcome {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl From<HashMap<String, String>> for CallbackOutcome {
    fn from(mut params: HashMap<String, String>) -> Self {
        Self {
            code: params.remove("code"),
            state: params.remove("state"),
            error: params.remove("error"),
        }
    }
}

struct ServerState<F> {
    on_callback: F,
}

/// Binds the loopback redirect listener, retrying `port+1..=port+9` on
/// `AddrInUse` (spec.md §4.7). Returns the port actually bound (the caller
/// must persist it and rebuild the redirect URI if it differs from
/// `configured_port`) plus a handle to the spawned server task.
pub async fn serve_loopback<F, Fut>(
    configured_port: u16,
    on_callback: F,
) -> Result<(u16, JoinHandle<()>), SecurityError>
where
    F: Fn(CallbackOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let mut last_error = None;
    for offset in 0..=PORT_RETRY_ATTEMPTS {
        let port = configured_port.saturating_add(offset);
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let state = Arc::new(ServerState { on_callback });
                let router = build_router(state);
                let handle = tokio::spawn(async move {
                    if let Err(err) = axum::serve(listener, router).await {
                        tracing::error!(error = %err, "loopback callback server exited");
                    }
                });
                return Ok((port, handle));
            }
            Err(err) => last_error = Some(err),
        }
    }

    Err(SecurityError::Server(format!(
        "could not bind loopback listener on {configured_port}..={}: {}",
        configured_port.saturating_add(PORT_RETRY_ATTEMPTS),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn build_router<F, Fut>(state: Arc<ServerState<F>>) -> Router
where
    F: Fn(CallbackOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Router::new()
        .route("/oauth2callback", get(handle_callback::<F, Fut>))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/", get(|| async { "calsync loopback listener is running" }))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

async fn handle_callback<F, Fut>(
    State(state): State<Arc<ServerState<F>>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>)
where
    F: Fn(CallbackOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let outcome = CallbackOutcome::from(params);
    match (state.on_callback)(outcome).await {
        Ok(()) => (
            StatusCode::OK,
            Html("<html><body>Authorization complete. You can close this tab.</body></html>".to_string()),
        ),
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!(
                "<html><body>Authorization failed: {}</body></html>",
                escape_html(&message)
            )),
        ),
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(escape_html("<script>&\"'"), "&lt;script&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn callback_outcome_extracts_known_params() {
        let mut params = HashMap::new();
        params.insert("code".to_string(), "abc".to_string());
        params.insert("state".to_string(), "xyz".to_string());
        let outcome: CallbackOutcome = params.into();
        assert_eq!(outcome.code.as_deref(), Some("abc"));
        assert_eq!(outcome.state.as_deref(), Some("xyz"));
        assert!(outcome.error.is_none());
    }
}
