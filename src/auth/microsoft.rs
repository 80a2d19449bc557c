//! Microsoft identity platform client
//!
//! Implements the identity collaborator on top of the v2.0 endpoints:
//! - Interactive: OAuth2 device authorization grant
//! - Silent: in-memory token cache per scope set, refreshed with the
//!   session's refresh token

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Account, IdentityProvider, TokenGrant};
use crate::config::IdentityConfig;
use crate::types::error::{NotesError, Result};

/// Scopes added to every request so a refresh token and id token come back
const SESSION_SCOPES: &str = "offline_access openid profile";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Errors that can occur during OAuth operations
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth request failed: {0}")]
    Request(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Sign-in was declined")]
    Declined,

    #[error("Sign-in code expired before it was used")]
    Expired,

    #[error("No signed-in session")]
    NoSession,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<OAuthError> for NotesError {
    fn from(err: OAuthError) -> Self {
        NotesError::AuthRequired(err.to_string())
    }
}

/// OAuth2 tokens for one scope set
#[derive(Debug, Clone)]
pub struct OAuthTokens {
    /// Access token for API requests
    pub access_token: String,
    /// Token expiration time (Unix timestamp)
    pub expires_at: Option<i64>,
}

impl OAuthTokens {
    /// Check if tokens need refresh (within 5 minutes of expiry)
    pub fn should_refresh(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            let now = chrono::Utc::now().timestamp();
            expires_at - now < 300
        } else {
            // No expiry info, assume we should refresh
            true
        }
    }
}

/// What the user must do to finish an interactive sign-in
#[derive(Debug, Clone)]
pub struct DevicePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub message: String,
}

/// Callback that shows the device prompt to the user
pub type PromptFn = Arc<dyn Fn(&DevicePrompt) + Send + Sync>;

struct Session {
    account: Account,
    refresh_token: Option<String>,
    tokens: HashMap<String, OAuthTokens>,
}

/// Identity provider backed by the Microsoft identity platform
pub struct MicrosoftIdentity {
    client: reqwest::Client,
    client_id: String,
    authority: String,
    prompt: PromptFn,
    session: RwLock<Option<Session>>,
}

impl MicrosoftIdentity {
    pub fn new(config: &IdentityConfig, prompt: PromptFn) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            authority: config.authority.trim_end_matches('/').to_string(),
            prompt,
            session: RwLock::new(None),
        }
    }

    fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority)
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    /// Run the device authorization grant to completion
    async fn device_flow(&self, scopes: &[String]) -> std::result::Result<TokenResponse, OAuthError> {
        let scope = request_scope(scopes);
        let params = [("client_id", self.client_id.as_str()), ("scope", scope.as_str())];

        debug!("Requesting device code");

        let response = self
            .client
            .post(self.device_code_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Device code request failed: {}", error_text);
            return Err(OAuthError::Request(error_text));
        }

        let device: DeviceCodeResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        (self.prompt)(&DevicePrompt {
            user_code: device.user_code.clone(),
            verification_uri: device.verification_uri.clone(),
            message: device.message.clone().unwrap_or_else(|| {
                format!(
                    "To sign in, open {} and enter the code {}",
                    device.verification_uri, device.user_code
                )
            }),
        });

        let mut interval = Duration::from_secs(device.interval.unwrap_or(5));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() > deadline {
                return Err(OAuthError::Expired);
            }

            let params = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.client_id.as_str()),
                ("device_code", device.device_code.as_str()),
            ];

            let response = self
                .client
                .post(self.token_url())
                .form(&params)
                .send()
                .await
                .map_err(|e| OAuthError::Request(e.to_string()))?;

            if response.status().is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| OAuthError::TokenExchange(e.to_string()));
            }

            let error: ErrorResponse = response.json().await.unwrap_or_default();
            match error.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval += Duration::from_secs(5);
                    debug!("Device flow asked to slow down, polling every {:?}", interval);
                }
                "authorization_declined" => return Err(OAuthError::Declined),
                "expired_token" | "bad_verification_code" => return Err(OAuthError::Expired),
                other => {
                    warn!("Device flow failed: {} {}", other, error.error_description);
                    return Err(OAuthError::TokenExchange(format!(
                        "{}: {}",
                        other, error.error_description
                    )));
                }
            }
        }
    }

    /// Refresh an access token for a scope set
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let scope = request_scope(scopes);
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("Refreshing access token");

        let response = self
            .client
            .post(self.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Token refresh failed: {}", error_text);
            return Err(OAuthError::RefreshFailed(error_text));
        }

        response
            .json()
            .await
            .map_err(|e| OAuthError::RefreshFailed(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for MicrosoftIdentity {
    async fn cached_account(&self) -> Option<Account> {
        self.session.read().await.as_ref().map(|s| s.account.clone())
    }

    async fn acquire_silent(&self, account: &Account, scopes: &[String]) -> Result<TokenGrant> {
        let key = scope_key(scopes);

        let refresh_token = {
            let session = self.session.read().await;
            let session = session
                .as_ref()
                .filter(|s| s.account == *account)
                .ok_or(OAuthError::NoSession)?;

            if let Some(tokens) = session.tokens.get(&key) {
                if !tokens.should_refresh() {
                    return Ok(grant_from(account.clone(), tokens));
                }
            }

            session.refresh_token.clone().ok_or(OAuthError::NoSession)?
        };

        let response = self.refresh_access_token(&refresh_token, scopes).await?;
        let tokens = response.to_tokens();

        let mut session = self.session.write().await;
        let session = session.as_mut().ok_or(OAuthError::NoSession)?;
        if let Some(new_refresh) = response.refresh_token {
            session.refresh_token = Some(new_refresh);
        }
        session.tokens.insert(key, tokens.clone());

        Ok(grant_from(account.clone(), &tokens))
    }

    async fn acquire_interactive(
        &self,
        scopes: &[String],
        login_hint: Option<&str>,
    ) -> Result<TokenGrant> {
        info!("Starting interactive sign-in for {}", scopes.join(" "));

        let response = self.device_flow(scopes).await?;
        let username = response
            .id_token
            .as_deref()
            .and_then(username_from_id_token)
            .or_else(|| login_hint.map(|h| h.to_string()))
            .ok_or_else(|| OAuthError::TokenExchange("No account in token response".into()))?;
        let account = Account { username };
        let tokens = response.to_tokens();

        let mut session = self.session.write().await;
        match session.as_mut() {
            Some(existing) if existing.account == account => {
                if let Some(new_refresh) = response.refresh_token {
                    existing.refresh_token = Some(new_refresh);
                }
                existing.tokens.insert(scope_key(scopes), tokens.clone());
            }
            _ => {
                let mut cache = HashMap::new();
                cache.insert(scope_key(scopes), tokens.clone());
                *session = Some(Session {
                    account: account.clone(),
                    refresh_token: response.refresh_token,
                    tokens: cache,
                });
            }
        }

        info!("Interactive sign-in completed for {}", account.username);
        Ok(grant_from(account, &tokens))
    }
}

// ============================================================================
// Token response parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: Option<u64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    id_token: Option<String>,
}

impl TokenResponse {
    fn to_tokens(&self) -> OAuthTokens {
        let expires_at = self
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs as i64);

        OAuthTokens {
            access_token: self.access_token.clone(),
            expires_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    preferred_username: Option<String>,
    upn: Option<String>,
    email: Option<String>,
}

// ============================================================================
// Helper functions
// ============================================================================

fn request_scope(scopes: &[String]) -> String {
    format!("{} {}", scopes.join(" "), SESSION_SCOPES)
}

fn scope_key(scopes: &[String]) -> String {
    let mut sorted: Vec<String> = scopes.iter().map(|s| s.to_lowercase()).collect();
    sorted.sort();
    sorted.join(" ")
}

fn grant_from(account: Account, tokens: &OAuthTokens) -> TokenGrant {
    TokenGrant {
        account,
        access_token: tokens.access_token.clone(),
        expires_at: tokens
            .expires_at
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
    }
}

/// Read the account name from an id token's claims
///
/// The signature is not checked; the token came straight from the token
/// endpoint over TLS.
fn username_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: IdTokenClaims = serde_json::from_slice(&bytes).ok()?;
    claims.preferred_username.or(claims.upn).or(claims.email)
}
