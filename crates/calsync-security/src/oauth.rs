use crate::SecurityError;
use calsync_core::Credentials;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse,
    TokenUrl,
};

/// Everything the OAuth2 Manager needs to know about the provider and this
/// install; built from `Settings` by the caller (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct OAuthProfile {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

/// In-flight authorization state, recorded by `begin()` and consumed by
/// `handle_callback()`. The caller persists this across the loopback
/// round trip; it never touches disk here.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub authorization_url: String,
    state: String,
    pkce_verifier: String,
    issued_at: DateTime<Utc>,
}

const STATE_MAX_AGE_MINUTES: i64 = 10;
const ACCESS_TOKEN_REFRESH_WINDOW_MINUTES: i64 = 5;

/// Authorization-code + PKCE (S256) lifecycle manager. Generalizes the
/// teacher's single-shot `exchange_code` helper into `begin`/
/// `handle_callback`/`ensure_access_token`/`revoke` (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct OAuthWorkflow {
    profile: OAuthProfile,
}

impl OAuthWorkflow {
    pub fn new(profile: OAuthProfile) -> Self {
        Self { profile }
    }

    fn client(&self) -> Result<BasicClient, SecurityError> {
        let mut client = BasicClient::new(ClientId::new(self.profile.client_id.clone()))
            .set_auth_uri(AuthUrl::new(self.profile.auth_url.clone())?)
            .set_token_uri(TokenUrl::new(self.profile.token_url.clone())?)
            .set_redirect_uri(RedirectUrl::new(self.profile.redirect_url.clone())?);

        if let Some(secret) = &self.profile.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }

    /// Steps 1-5 of spec.md §4.6: builds the authorization URL with a
    /// fresh PKCE verifier/challenge and CSRF state, `access_type=offline`,
    /// and `prompt=consent` when no refresh token is already on file.
    pub fn begin(&self, has_refresh_token: bool) -> Result<PendingAuthorization, SecurityError> {
        let client = self.client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("access_type", "offline");

        if !has_refresh_token {
            request = request.add_extra_param("prompt", "consent");
        }

        for scope in &self.profile.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let (auth_url, csrf_state) = request.url();

        Ok(PendingAuthorization {
            authorization_url: auth_url.to_string(),
            state: csrf_state.secret().to_string(),
            pkce_verifier: pkce_verifier.secret().to_string(),
            issued_at: Utc::now(),
        })
    }

    /// Validates state and age, exchanges the code, and merges the result
    /// with `prior_refresh_token` (preserving it if the provider returns
    /// none on this exchange), per spec.md §4.6 "Callback".
    pub async fn handle_callback(
        &self,
        pending: &PendingAuthorization,
        received_state: &str,
        code: Option<&str>,
        error: Option<&str>,
        prior_refresh_token: Option<&str>,
    ) -> Result<Credentials, SecurityError> {
        if received_state != pending.state {
            return Err(SecurityError::CallbackRejected("state mismatch".into()));
        }
        if Utc::now() - pending.issued_at > Duration::minutes(STATE_MAX_AGE_MINUTES) {
            return Err(SecurityError::CallbackRejected("authorization state expired".into()));
        }
        if let Some(error) = error {
            return Err(SecurityError::CallbackRejected(error.to_string()));
        }
        let Some(code) = code else {
            return Err(SecurityError::CallbackRejected("missing authorization code".into()));
        };

        let client = self.client()?;
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pending.pkce_verifier.clone()))
            .request_async(&http_client)
            .await
            .map_err(|err| SecurityError::OAuth(err.to_string()))?;

        let refresh_token = token
            .refresh_token()
            .map(|t| t.secret().to_string())
            .or_else(|| prior_refresh_token.map(str::to_string));

        let expiry = Utc::now()
            + token
                .expires_in()
                .map(|d| Duration::from_std(d).unwrap_or(Duration::hours(1)))
                .unwrap_or(Duration::hours(1));

        Ok(Credentials {
            access_token: token.access_token().secret().to_string(),
            refresh_token,
            expiry,
            scope: self.profile.scopes.join(" "),
        })
    }

    /// spec.md §4.6 `ensureAccessToken()`. Returns the still-valid or
    /// freshly refreshed credentials; `Err(SecurityError::ReauthRequired)`
    /// signals the caller must drive a new `begin`/`handle_callback` round.
    pub async fn ensure_access_token(
        &self,
        current: &Credentials,
    ) -> Result<Credentials, SecurityError> {
        if !current.expires_within(ACCESS_TOKEN_REFRESH_WINDOW_MINUTES) {
            return Ok(current.clone());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(SecurityError::ReauthRequired);
        };

        let client = self.client()?;
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&http_client)
            .await
            .map_err(|err| {
                let message = err.to_string();
                if message.contains("invalid_grant") {
                    SecurityError::ReauthRequired
                } else {
                    SecurityError::OAuth(message)
                }
            })?;

        let expiry = Utc::now()
            + token
                .expires_in()
                .map(|d| Duration::from_std(d).unwrap_or(Duration::hours(1)))
                .unwrap_or(Duration::hours(1));

        Ok(Credentials {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token
                .refresh_token()
                .map(|t| t.secret().to_string())
                .or(Some(refresh_token)),
            expiry,
            scope: current.scope.clone(),
        })
    }

    /// Hits the provider's revocation endpoint; storage cleanup is the
    /// caller's responsibility (spec.md §4.6).
    pub async fn revoke(&self, http: &reqwest::Client, token: &str) -> Result<(), SecurityError> {
        http.post(&self.profile.revoke_url)
            .form(&[("token", token)])
            .send()
            .await?
            .error_for_status()
            .map_err(SecurityError::Request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> OAuthProfile {
        OAuthProfile {
            client_id: "client-123".to_string(),
            client_secret: None,
            auth_url: "https://accounts.example.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.example.com/token".to_string(),
            revoke_url: "https://oauth2.example.com/revoke".to_string(),
            redirect_url: "http://127.0.0.1:42813/oauth2callback".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/calendar.events".to_string()],
        }
    }

    #[test]
    fn begin_includes_consent_prompt_only_without_refresh_token() {
        let workflow = OAuthWorkflow::new(profile());
        let with_refresh = workflow.begin(true).expect("builds url");
        let without_refresh = workflow.begin(false).expect("builds url");
        assert!(!with_refresh.authorization_url.contains("prompt=consent"));
        assert!(without_refresh.authorization_url.contains("prompt=consent"));
        assert!(without_refresh.authorization_url.contains("access_type=offline"));
    }

    #[tokio::test]
    async fn handle_callback_rejects_state_mismatch() {
        let workflow = OAuthWorkflow::new(profile());
        let pending = workflow.begin(false).expect("builds url");
        let result = workflow
            .handle_callback(&pending, "wrong-state", Some("abc"), None, None)
            .await;
        assert!(matches!(result, Err(SecurityError::CallbackRejected(_))));
    }

    #[tokio::test]
    async fn ensure_access_token_short_circuits_when_still_fresh() {
        let workflow = OAuthWorkflow::new(profile());
        let current = Credentials {
            access_token: "still-good".to_string(),
            refresh_token: Some("r1".to_string()),
            expiry: Utc::now() + Duration::hours(1),
            scope: "calendar".to_string(),
        };
        let refreshed = workflow.ensure_access_token(&current).await.expect("no refresh needed");
        assert_eq!(refreshed.access_token, "still-good");
    }

    #[tokio::test]
    async fn ensure_access_token_requires_reauth_without_refresh_token() {
        let workflow = OAuthWorkflow::new(profile());
        let current = Credentials {
            access_token: "expiring".to_string(),
            refresh_token: None,
            expiry: Utc::now(),
            scope: "calendar".to_string(),
        };
        let result = workflow.ensure_access_token(&current).await;
        assert!(matches!(result, Err(SecurityError::ReauthRequired)));
    }
}
