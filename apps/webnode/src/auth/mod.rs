//! Login and token handling.
//!
//! [`exchange`] trades the account principal/secret for a long-lived refresh
//! token exactly once. [`TokenManager`] then turns that refresh token into
//! short-lived access tokens on demand; every successful refresh supersedes the
//! previous access token, which must not be used again.

pub mod error;

use std::fmt;

use tracing::{debug, info, warn};

use crate::gate::TaskGateClient;
use crate::identity::Identity;

pub use error::AuthError;

/// Long-lived token obtained from the login endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshCredential(String);

impl RefreshCredential {
    /// Returns `None` for empty tokens.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        (!token.trim().is_empty()).then_some(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshCredential(<redacted>)")
    }
}

/// Short-lived bearer token. `generation` increases with every refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential {
    token: String,
    generation: u64,
}

impl AccessCredential {
    pub fn expose(&self) -> &str {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wraps a token the service issued. [`TokenManager::refresh`] is the
    /// usual source; `generation` orders tokens from the same refresh chain.
    pub fn issued(token: impl Into<String>, generation: u64) -> Self {
        Self {
            token: token.into(),
            generation,
        }
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("token", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Exchanges the account credentials for a refresh token. Never retries.
pub async fn exchange(
    gate: &TaskGateClient,
    identity: &Identity,
) -> Result<RefreshCredential, AuthError> {
    info!(
        target: "webnode::auth",
        principal = %identity.principal(),
        "exchanging account credentials"
    );
    let envelope = gate.login(identity.principal(), identity.secret()).await?;
    if !envelope.is_success() {
        let err = AuthError::Rejected {
            code: envelope.code,
            message: envelope.msg.unwrap_or_else(|| "login rejected".into()),
        };
        warn!(target: "webnode::auth", error = %err, "login failed");
        return Err(err);
    }
    envelope
        .into_data()
        .and_then(|data| RefreshCredential::new(data.refresh_token))
        .ok_or(AuthError::MissingCredential("refresh token"))
}

/// Owns the refresh token and the single currently-valid access token.
#[derive(Debug)]
pub struct TokenManager {
    gate: TaskGateClient,
    refresh: RefreshCredential,
    current: Option<AccessCredential>,
    generation: u64,
}

impl TokenManager {
    pub fn new(gate: TaskGateClient, refresh: RefreshCredential) -> Self {
        Self {
            gate,
            refresh,
            current: None,
            generation: 0,
        }
    }

    /// Obtains a new access token, replacing the current one. On failure the
    /// previous token is discarded as well.
    pub async fn refresh(&mut self) -> Result<AccessCredential, AuthError> {
        self.current = None;
        let envelope = self.gate.refresh_token(self.refresh.expose()).await?;
        if !envelope.is_success() {
            return Err(AuthError::Rejected {
                code: envelope.code,
                message: envelope.msg.unwrap_or_else(|| "refresh rejected".into()),
            });
        }
        let token = envelope
            .into_data()
            .map(|data| data.access_token)
            .filter(|token| !token.trim().is_empty())
            .ok_or(AuthError::MissingCredential("access token"))?;

        self.generation += 1;
        let credential = AccessCredential::issued(token, self.generation);
        debug!(
            target: "webnode::auth",
            generation = credential.generation,
            "access token refreshed"
        );
        self.current = Some(credential.clone());
        Ok(credential)
    }

    pub fn current(&self) -> Option<&AccessCredential> {
        self.current.as_ref()
    }

    pub fn is_current(&self, credential: &AccessCredential) -> bool {
        self.current.as_ref() == Some(credential)
    }

    /// Drops the current access token so it cannot be handed out again.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    /// Installs a refresh token from a new login; the access token goes with the old one.
    pub fn replace_refresh(&mut self, refresh: RefreshCredential) {
        self.refresh = refresh;
        self.current = None;
    }
}
