use crate::state::AppState;
use anyhow::{bail, Context, Result};
use calsync_security::{serve_loopback, CallbackOutcome};
use std::sync::Arc;
use tokio::sync::oneshot;

/// `calsync authenticate` (spec.md §4.6/§4.7, SPEC_FULL.md §6). Binds the
/// loopback listener, prints the authorization URL for the operator to open
/// (the excluded host UI would open it for them), and blocks until the
/// single callback round trip completes.
pub async fn authenticate(state: Arc<AppState>) -> Result<()> {
    let settings = state.settings().await;
    let has_refresh_token = state.load_credentials().await?.is_some();

    let (callback_tx, callback_rx) = oneshot::channel::<CallbackOutcome>();
    let callback_tx = std::sync::Mutex::new(Some(callback_tx));

    let (bound_port, server_handle) = serve_loopback(settings.redirect_port, move |outcome| {
        let tx = callback_tx.lock().expect("callback mutex poisoned").take();
        async move {
            match tx {
                Some(tx) => tx.send(outcome).map_err(|_| "callback receiver dropped".to_string()),
                None => Err("authorization callback already handled".to_string()),
            }
        }
    })
    .await
    .context("bind oauth loopback listener")?;

    if bound_port != settings.redirect_port {
        eprintln!(
            "warning: configured redirect port {} was in use; bound {} instead. \
             Update the authorization server's redirect URI registration to match \
             http://127.0.0.1:{bound_port}/oauth2callback.",
            settings.redirect_port, bound_port
        );
        let mut advanced = settings.clone();
        advanced.redirect_port = bound_port;
        state.config_manager.save(&advanced).context("persist auto-advanced redirect port")?;
        *state.settings.lock().await = advanced;
    }

    let profile = state.oauth_profile(bound_port).await;
    let workflow = state.oauth_workflow(profile);
    let pending = workflow.begin(has_refresh_token)?;

    println!("Open this URL to authorize calsync:\n\n{}\n", pending.authorization_url);

    let outcome = callback_rx.await.context("oauth callback channel closed unexpectedly")?;
    server_handle.abort();

    let prior_refresh_token = state
        .load_credentials()
        .await?
        .and_then(|creds| creds.refresh_token);

    let credentials = workflow
        .handle_callback(
            &pending,
            outcome.state.as_deref().unwrap_or_default(),
            outcome.code.as_deref(),
            outcome.error.as_deref(),
            prior_refresh_token.as_deref(),
        )
        .await
        .context("exchange authorization code")?;

    state.persist_credentials(&credentials).await?;
    println!("Authorization complete. calsync can now sync this calendar.");
    Ok(())
}

/// `calsync revoke` (spec.md §4.6, SPEC_FULL.md §6): revokes the refresh
/// token at the provider, then clears local storage regardless of whether
/// the revocation call succeeds (a dead token left on the provider is not
/// worth failing the local cleanup over).
pub async fn revoke(state: Arc<AppState>) -> Result<()> {
    let Some(credentials) = state.load_credentials().await? else {
        bail!("no stored credentials to revoke");
    };
    let Some(refresh_token) = credentials.refresh_token else {
        state.clear_credentials().await?;
        bail!("stored credentials had no refresh token; local state cleared");
    };

    let settings = state.settings().await;
    let profile = state.oauth_profile(settings.redirect_port).await;
    let workflow = state.oauth_workflow(profile);

    if let Err(err) = workflow.revoke(&state.http, &refresh_token).await {
        tracing::warn!(error = %err, "provider revocation failed; clearing local credentials anyway");
    }

    state.clear_credentials().await?;
    println!("Revoked. calsync will require re-authorization before the next sync.");
    Ok(())
}
