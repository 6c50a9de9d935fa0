use anyhow::{Context, Result};
use calsync_config::ConfigManager;
use calsync_core::{Credentials, Settings};
use calsync_security::{decode_token, encode_token, OAuthProfile, OAuthWorkflow, SecurityError};
use calsync_storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.events";

/// spec.md §5: "a 3-second coalescing window suppresses redundant rewrites
/// when only the access token changed." Each encoded write picks a fresh
/// AES-GCM nonce/obf1 IV, so re-encoding an unchanged refresh token on every
/// sub-batch's `ensure_access_token` call would otherwise rewrite the
/// encrypted blob dozens of times per sync run for no semantic change.
const REFRESH_TOKEN_WRITE_COALESCE_WINDOW: chrono::Duration = chrono::Duration::seconds(3);

/// Wires the library crates together the way the teacher's `AppState`
/// composes its services from one `ConfigManager`/`Storage` pair
/// (SPEC_FULL.md §2). One instance is constructed per CLI invocation; the
/// scheduler subcommand keeps it alive for the process lifetime.
pub struct AppState {
    pub config_manager: ConfigManager,
    pub settings: Mutex<Settings>,
    pub storage: Storage,
    pub http: reqwest::Client,
    cached_access_token: Mutex<Option<Credentials>>,
    last_refresh_token_write: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl AppState {
    pub async fn initialize() -> Result<Self> {
        let config_manager = ConfigManager::new().context("initialize config manager")?;
        let settings = config_manager.load().context("load settings")?;

        let db_path = config_manager.data_dir().join("calsync.sqlite3");
        let storage = Storage::connect(&db_path)
            .await
            .context("initialize sqlite storage")?;

        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;

        Ok(Self {
            config_manager,
            settings: Mutex::new(settings),
            storage,
            http,
            cached_access_token: Mutex::new(None),
            last_refresh_token_write: Mutex::new(None),
        })
    }

    pub async fn settings(&self) -> Settings {
        self.settings.lock().await.clone()
    }

    pub async fn redirect_uri(&self, bound_port: u16) -> String {
        format!("http://127.0.0.1:{bound_port}/oauth2callback")
    }

    pub async fn oauth_profile(&self, bound_port: u16) -> OAuthProfile {
        let settings = self.settings().await;
        OAuthProfile {
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
            redirect_url: self.redirect_uri(bound_port).await,
            scopes: vec![CALENDAR_SCOPE.to_string()],
        }
    }

    pub fn oauth_workflow(&self, profile: OAuthProfile) -> OAuthWorkflow {
        OAuthWorkflow::new(profile)
    }

    /// Decrypts the persisted refresh token (if any) into an expired
    /// in-memory `Credentials` placeholder so `ensure_access_token` always
    /// takes the refresh path on first use (spec.md §4.6).
    pub async fn load_credentials(&self) -> Result<Option<Credentials>> {
        let settings = self.settings().await;
        let Some(encoded) = self.storage.load_encrypted_refresh_token().await? else {
            return Ok(None);
        };
        let salt = self.storage.obfuscation_salt().await?;
        let passphrase = passphrase_for(&settings);
        let (refresh_token, needs_reencode) = decode_token(&encoded, passphrase.as_deref(), &salt)
            .map_err(|err| anyhow::anyhow!("failed to decrypt refresh token: {err}"))?;

        if needs_reencode {
            let reencoded = encode_token(&refresh_token, passphrase.as_deref(), &salt);
            self.storage.save_encrypted_refresh_token(Some(&reencoded)).await?;
        }

        Ok(Some(Credentials {
            access_token: String::new(),
            refresh_token: Some(refresh_token),
            expiry: Utc::now() - chrono::Duration::minutes(1),
            scope: CALENDAR_SCOPE.to_string(),
        }))
    }

    pub async fn persist_credentials(&self, credentials: &Credentials) -> Result<()> {
        match &credentials.refresh_token {
            Some(token) => {
                let mut last_write = self.last_refresh_token_write.lock().await;
                let coalesced = match last_write.as_ref() {
                    Some((written_token, written_at)) => {
                        written_token == token && Utc::now() - *written_at < REFRESH_TOKEN_WRITE_COALESCE_WINDOW
                    }
                    None => false,
                };

                if !coalesced {
                    let settings = self.settings().await;
                    let salt = self.storage.obfuscation_salt().await?;
                    let passphrase = passphrase_for(&settings);
                    let encoded = encode_token(token, passphrase.as_deref(), &salt);
                    self.storage.save_encrypted_refresh_token(Some(&encoded)).await?;
                    *last_write = Some((token.clone(), Utc::now()));
                }
            }
            None => {
                self.storage.save_encrypted_refresh_token(None).await?;
                *self.last_refresh_token_write.lock().await = None;
            }
        }

        *self.cached_access_token.lock().await = Some(credentials.clone());
        Ok(())
    }

    pub async fn clear_credentials(&self) -> Result<()> {
        self.storage.save_encrypted_refresh_token(None).await?;
        *self.cached_access_token.lock().await = None;
        *self.last_refresh_token_write.lock().await = None;
        Ok(())
    }

    /// spec.md §4.6 `ensureAccessToken()`, wired to this process's storage:
    /// loads the persisted credentials, refreshes if stale, and persists
    /// any rotated refresh token before returning the bearer token.
    pub async fn ensure_access_token(self: &Arc<Self>) -> Result<String, SecurityError> {
        let current = {
            let cached = self.cached_access_token.lock().await;
            match cached.clone() {
                Some(creds) => Some(creds),
                None => self
                    .load_credentials()
                    .await
                    .map_err(|err| SecurityError::OAuth(err.to_string()))?,
            }
        };

        let Some(current) = current else {
            return Err(SecurityError::ReauthRequired);
        };

        let profile = self.oauth_profile(self.settings().await.redirect_port).await;
        let workflow = self.oauth_workflow(profile);
        let refreshed = workflow.ensure_access_token(&current).await?;

        self.persist_credentials(&refreshed)
            .await
            .map_err(|err| SecurityError::OAuth(err.to_string()))?;

        Ok(refreshed.access_token)
    }
}

fn passphrase_for(settings: &Settings) -> Option<String> {
    if settings.remember_passphrase {
        std::env::var("CALSYNC_PASSPHRASE").ok()
    } else {
        None
    }
}
