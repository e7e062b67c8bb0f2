//! OAuth token handling for the accounting source
//!
//! Tokens live in a `TokenStore` shared with whatever process performed the
//! initial authorization. Access tokens are refreshed shortly before they
//! expire and once more when the API rejects one with 401.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{or_cancel, FetchError};
use crate::db::DbError;

/// Stored OAuth credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    /// True when the token expires within `margin` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - now <= margin
    }
}

/// Persistent token storage, one token per provider
pub trait TokenStore: Send + Sync {
    fn load(&self, provider: &str) -> Result<Option<OAuthToken>, DbError>;

    /// Replace the provider's token atomically
    fn save(&self, provider: &str, token: &OAuthToken) -> Result<(), DbError>;
}

/// Token store kept in memory
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, provider: &str) -> Result<Option<OAuthToken>, DbError> {
        let tokens = self.tokens.read().map_err(|_| DbError::LockPoisoned)?;
        Ok(tokens.get(provider).cloned())
    }

    fn save(&self, provider: &str, token: &OAuthToken) -> Result<(), DbError> {
        let mut tokens = self.tokens.write().map_err(|_| DbError::LockPoisoned)?;
        tokens.insert(provider.to_string(), token.clone());
        Ok(())
    }
}

/// Refresh grant response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Hands out valid access tokens, refreshing through the provider's token endpoint
pub struct TokenManager {
    client: reqwest::Client,
    provider: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_margin: Duration,
    store: Arc<dyn TokenStore>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        client: reqwest::Client,
        provider: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_margin: Duration,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            client,
            provider: provider.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_margin,
            store,
            refresh_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<OAuthToken, FetchError> {
        self.store
            .load(&self.provider)
            .map_err(|e| FetchError::NotConfigured(format!("token store unavailable: {}", e)))?
            .ok_or_else(|| {
                FetchError::NotConfigured(format!("no {} token has been authorized", self.provider))
            })
    }

    /// Current access token, refreshed first if it is about to expire
    pub async fn access_token(&self, cancel: &CancellationToken) -> Result<String, FetchError> {
        let token = self.load()?;
        if !token.expires_within(Utc::now(), self.refresh_margin) {
            return Ok(token.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another request may have refreshed while we waited
        let token = self.load()?;
        if !token.expires_within(Utc::now(), self.refresh_margin) {
            return Ok(token.access_token);
        }

        tracing::info!("Refreshing {} access token before expiry", self.provider);
        let refreshed = self.refresh(&token, cancel).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh after the API rejected `rejected`
    pub async fn force_refresh(
        &self,
        rejected: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let _guard = self.refresh_lock.lock().await;
        let token = self.load()?;
        if token.access_token != rejected {
            return Ok(token.access_token);
        }

        tracing::info!("Refreshing rejected {} access token", self.provider);
        let refreshed = self.refresh(&token, cancel).await?;
        Ok(refreshed.access_token)
    }

    async fn refresh(
        &self,
        token: &OAuthToken,
        cancel: &CancellationToken,
    ) -> Result<OAuthToken, FetchError> {
        let request = async {
            let response = self
                .client
                .post(&self.token_url)
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", token.refresh_token.as_str()),
                ])
                .send()
                .await
                .map_err(|e| FetchError::AuthExpired(format!("token refresh failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::AuthExpired(format!(
                    "token refresh rejected with HTTP {}: {}",
                    status.as_u16(),
                    body
                )));
            }

            response
                .json::<TokenResponse>()
                .await
                .map_err(|e| FetchError::AuthExpired(format!("invalid token response: {}", e)))
        };

        let body = or_cancel(request, cancel).await?;
        let expires_at = Duration::try_seconds(body.expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                FetchError::AuthExpired(format!(
                    "invalid token response: expires_in {} is out of range",
                    body.expires_in
                ))
            })?;
        let refreshed = OAuthToken {
            access_token: body.access_token,
            // Providers that do not rotate refresh tokens omit it
            refresh_token: body
                .refresh_token
                .unwrap_or_else(|| token.refresh_token.clone()),
            expires_at,
        };

        self.store.save(&self.provider, &refreshed).map_err(|e| {
            tracing::error!("Failed to persist refreshed {} token: {}", self.provider, e);
            FetchError::AuthExpired(format!("refreshed token could not be saved: {}", e))
        })?;

        Ok(refreshed)
    }
}
