// Authentication types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AuthError, Result};

/// Identity claims returned at login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub role: String,
    pub email: String,
}

/// Access/refresh credential pair with the identity it belongs to
///
/// Both tokens are always present together; use [`CredentialPair::new`] or
/// [`CredentialPair::validate`] before installing a pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    pub identity: Identity,
}

impl CredentialPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        identity: Identity,
    ) -> Result<Self> {
        let pair = Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            identity,
        };
        pair.validate()?;
        Ok(pair)
    }

    /// Reject partial (one token empty) and empty pairs
    pub fn validate(&self) -> Result<()> {
        match (self.access_token.is_empty(), self.refresh_token.is_empty()) {
            (false, false) => Ok(()),
            (true, false) => Err(AuthError::InvalidCredential(
                "access token is empty while refresh token is set".to_string(),
            )),
            (false, true) => Err(AuthError::InvalidCredential(
                "refresh token is empty while access token is set".to_string(),
            )),
            (true, true) => Err(AuthError::InvalidCredential(
                "credential pair is empty".to_string(),
            )),
        }
    }

    /// Pair after a successful refresh: new access token, refresh token kept
    /// unless the backend rotated it
    pub fn refreshed(&self, grant: TokenGrant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.refresh_token.clone()),
            identity: self.identity.clone(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("identity", &self.identity)
            .finish()
    }
}

/// Short prefix of a token, safe for logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Token data from refresh response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Result of a password login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub identity: Identity,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh response body
#[derive(Deserialize)]
pub struct RefreshResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    pub access: String,
    #[serde(default, alias = "refreshToken", alias = "refresh_token")]
    pub refresh: Option<String>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login response body
#[derive(Deserialize)]
pub struct LoginResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    pub access: String,
    #[serde(alias = "refreshToken", alias = "refresh_token")]
    pub refresh: String,
    #[serde(alias = "identity")]
    pub user: Identity,
}
