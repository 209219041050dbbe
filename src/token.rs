use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::ACCEPT;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::protocol::{self, TokenResponse};
use crate::types::Token;
use crate::{Error, Result};

pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Pluggable persistence for the token pair (keyring, config entry, ...).
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<Token>>;
    fn save(&self, token: &Token) -> Result<()>;
}

/// Keeps the token in memory only.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    pub fn current(&self) -> Option<Token> {
        self.token.lock().ok().and_then(|t| t.clone())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<Token>> {
        Ok(self.current())
    }

    fn save(&self, token: &Token) -> Result<()> {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
}

impl OAuthCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        write_access: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scope: protocol::scope(write_access),
        }
    }
}

enum TokenState {
    Missing,
    Valid(Token),
    Revoked,
}

struct Slot {
    state: TokenState,
    last_failure: Option<AuthError>,
}

pub struct TokenManagerBuilder {
    credentials: OAuthCredentials,
    token_url: String,
    store: Option<Arc<dyn TokenStore>>,
    safety_margin: Duration,
    http: Option<reqwest::Client>,
}

impl TokenManagerBuilder {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self {
            credentials,
            token_url: format!("{}{}", protocol::DEFAULT_BASE_URL, protocol::TOKEN_PATH),
            store: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            http: None,
        }
    }

    /// Base URL of the Uplink server; the token endpoint lives under it.
    pub fn base_url(mut self, base_url: &str) -> Self {
        self.token_url = format!("{}{}", base_url.trim_end_matches('/'), protocol::TOKEN_PATH);
        self
    }

    pub fn store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Loads any stored token. Fails only if the store itself fails.
    pub fn build(self) -> Result<TokenManager> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()));
        let state = match store.load()? {
            Some(token) => {
                debug!(expires_at = %token.expires_at, "loaded stored token");
                TokenState::Valid(token)
            }
            None => TokenState::Missing,
        };
        Ok(TokenManager {
            http: self.http.unwrap_or_default(),
            token_url: self.token_url,
            credentials: self.credentials,
            store,
            safety_margin: self.safety_margin,
            slot: AsyncMutex::new(Slot {
                state,
                last_failure: None,
            }),
            completed: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        })
    }
}

/// Refreshes are single-flighted: the slot lock is held across the token call.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    credentials: OAuthCredentials,
    store: Arc<dyn TokenStore>,
    safety_margin: Duration,
    slot: AsyncMutex<Slot>,
    /// Token endpoint calls that have returned, successfully or not.
    completed: AtomicU64,
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn builder(credentials: OAuthCredentials) -> TokenManagerBuilder {
        TokenManagerBuilder::new(credentials)
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Whether the requested scope includes parameter writes.
    pub fn write_access(&self) -> bool {
        self.credentials
            .scope
            .split_whitespace()
            .any(|s| s == protocol::SCOPE_WRITE)
    }

    /// Number of refresh-token grants sent so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub async fn is_revoked(&self) -> bool {
        matches!(self.slot.lock().await.state, TokenState::Revoked)
    }

    /// One-time exchange of a consent code. Also clears a revoked state.
    pub async fn exchange(&self, authorization_code: &str) -> Result<Token> {
        let mut slot = self.slot.lock().await;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", authorization_code),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
            ("scope", self.credentials.scope.as_str()),
        ];
        let result = self.request_token(&form, None).await;
        self.completed.fetch_add(1, Ordering::AcqRel);
        let token = result.inspect_err(|e| {
            warn!(error = %e, "authorization code exchange failed");
        })?;
        info!(expires_at = %token.expires_at, "authorization code exchanged");
        self.persist(&token);
        slot.state = TokenState::Valid(token.clone());
        slot.last_failure = None;
        Ok(token)
    }

    /// A token valid for at least the safety margin, refreshing if needed.
    pub async fn get_valid_token(&self) -> Result<Token> {
        let observed = self.completed.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;

        let refresh_token = match &slot.state {
            TokenState::Missing => return Err(AuthError::NotAuthorized.into()),
            TokenState::Revoked => return Err(AuthError::Revoked.into()),
            TokenState::Valid(token) if !token.expires_within(self.safety_margin, Utc::now()) => {
                return Ok(token.clone());
            }
            TokenState::Valid(token) => token.refresh_token.clone(),
        };

        // A refresh ran while we queued for the slot and still left us
        // without a usable token: share its failure instead of retrying.
        if self.completed.load(Ordering::Acquire) != observed
            && let Some(failure) = &slot.last_failure
        {
            return Err(failure.clone().into());
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!("refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ];
        let result = self.request_token(&form, Some(&refresh_token)).await;
        self.completed.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok(token) => {
                debug!(expires_at = %token.expires_at, "access token refreshed");
                self.persist(&token);
                slot.state = TokenState::Valid(token.clone());
                slot.last_failure = None;
                Ok(token)
            }
            Err(Error::Auth(AuthError::Rejected(reason))) => {
                warn!(%reason, "refresh token revoked, re-authorization required");
                slot.state = TokenState::Revoked;
                slot.last_failure = Some(AuthError::Revoked);
                Err(AuthError::Revoked.into())
            }
            Err(Error::Auth(failure)) => {
                warn!(error = %failure, "token refresh failed, keeping cached token");
                slot.last_failure = Some(failure.clone());
                Err(failure.into())
            }
            Err(other) => {
                let failure = AuthError::TransientNetwork(other.to_string());
                slot.last_failure = Some(failure.clone());
                Err(failure.into())
            }
        }
    }

    /// The resource API rejected the access token: refresh on next use.
    pub async fn invalidate_access(&self) {
        let mut slot = self.slot.lock().await;
        if let TokenState::Valid(token) = &mut slot.state {
            debug!("access token rejected, forcing refresh");
            token.expires_at = Utc::now();
        }
    }

    fn persist(&self, token: &Token) {
        if let Err(e) = self.store.save(token) {
            warn!(error = %e, "failed to persist token");
        }
    }

    async fn request_token(&self, form: &[(&str, &str)], previous_refresh: Option<&str>) -> Result<Token> {
        let resp = self
            .http
            .post(&self.token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let body: TokenResponse = resp
                .json()
                .await
                .map_err(|e| AuthError::TransientNetwork(e.to_string()))?;
            return body.into_token(previous_refresh, &self.credentials.scope);
        }

        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        let message = format!("http {}: {}", status.as_u16(), protocol::error_message(&body));
        match status.as_u16() {
            400 | 401 | 403 => Err(AuthError::Rejected(message).into()),
            _ => Err(AuthError::TransientNetwork(message).into()),
        }
    }
}
