//! Access token broker
//!
//! Acquires short-lived tokens for the two audiences the engine talks to.
//! Silent acquisition is always tried first. Interactive sign-in happens at
//! most once per session and is shared by both audiences; if silent
//! acquisition then fails for one audience, only that audience is prompted.
//!
//! The broker is an explicit context object: every component that needs a
//! token holds an `Arc<TokenBroker>` and names the audience it wants.

pub mod microsoft;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::TransportProfile;
use crate::types::error::{NotesError, Result};
use crate::types::{AccessToken, Audience};

/// Delegated permissions for the collaboration-suite audience
pub const COLLABORATION_SCOPES: &[&str] = &[
    "User.Read",
    "User.ReadBasic.All",
    "Mail.ReadWrite",
    "Mail.Send",
    "Sites.ReadWrite.All",
];

/// Signed-in account known to the identity layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
}

/// Token returned by the identity layer
#[derive(Clone)]
pub struct TokenGrant {
    pub account: Account,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Identity collaborator
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Account from an earlier sign-in, if any
    async fn cached_account(&self) -> Option<Account>;

    /// Token without user interaction
    async fn acquire_silent(&self, account: &Account, scopes: &[String]) -> Result<TokenGrant>;

    /// Token via a user-facing prompt
    ///
    /// Must fail with `AuthRequired` when the user cancels or the prompt fails.
    async fn acquire_interactive(
        &self,
        scopes: &[String],
        login_hint: Option<&str>,
    ) -> Result<TokenGrant>;
}

/// Per-audience token acquisition with silent-then-interactive escalation
pub struct TokenBroker {
    identity: Arc<dyn IdentityProvider>,
    collaboration_scopes: Vec<String>,
    document_scopes: Vec<String>,
    sign_in: Mutex<()>,
}

impl TokenBroker {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        profile: &TransportProfile,
        tenant_host: &str,
    ) -> Self {
        Self {
            identity,
            collaboration_scopes: COLLABORATION_SCOPES.iter().map(|s| s.to_string()).collect(),
            document_scopes: vec![profile.document_scope(tenant_host)],
            sign_in: Mutex::new(()),
        }
    }

    /// Scope list requested for an audience
    pub fn scopes_for(&self, audience: Audience) -> &[String] {
        match audience {
            Audience::Collaboration => &self.collaboration_scopes,
            Audience::DocumentStore => &self.document_scopes,
        }
    }

    /// Acquire a token for one audience
    ///
    /// Tokens are not cached here; callers reacquire per logical operation
    /// and rely on the identity layer's own cache.
    pub async fn acquire(&self, audience: Audience) -> Result<AccessToken> {
        let scopes = self.scopes_for(audience);
        let account = self.signed_in_account().await?;

        match self.identity.acquire_silent(&account, scopes).await {
            Ok(grant) => {
                debug!("Acquired {} token silently", audience);
                return Ok(to_access_token(audience, grant));
            }
            Err(e) => {
                info!(
                    "Silent acquisition for {} failed ({}), prompting for that audience",
                    audience, e
                );
            }
        }

        let grant = self
            .identity
            .acquire_interactive(scopes, Some(&account.username))
            .await
            .map_err(into_auth_required)?;

        Ok(to_access_token(audience, grant))
    }

    /// Account to acquire silently with, signing in once if there is none
    async fn signed_in_account(&self) -> Result<Account> {
        if let Some(account) = self.identity.cached_account().await {
            return Ok(account);
        }

        // Serialize so concurrent first requests share one sign-in
        let _guard = self.sign_in.lock().await;
        if let Some(account) = self.identity.cached_account().await {
            return Ok(account);
        }

        info!("No signed-in account, starting interactive sign-in");
        let grant = self
            .identity
            .acquire_interactive(&self.collaboration_scopes, None)
            .await
            .map_err(into_auth_required)?;

        info!("Signed in as {}", grant.account.username);
        Ok(grant.account)
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("account", &self.account)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn to_access_token(audience: Audience, grant: TokenGrant) -> AccessToken {
    AccessToken {
        audience,
        value: grant.access_token,
        expires_at: grant.expires_at,
    }
}

fn into_auth_required(err: NotesError) -> NotesError {
    match err {
        NotesError::AuthRequired(_) => err,
        other => {
            warn!("Interactive sign-in failed: {}", other);
            NotesError::AuthRequired(other.to_string())
        }
    }
}
