// Error handling module
// Defines the error taxonomy shared by the store, coordinator and dispatcher

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the authenticated client layer
///
/// `Clone` so a single refresh outcome can be handed to every caller
/// attached to the same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Partial or empty credential pair
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Durable write failed; in-memory state was left unchanged
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Refresh attempted with no session
    #[error("No refresh credential available")]
    NoRefreshCredential,

    /// Refresh call did not complete in time
    #[error("Token refresh timed out after {}ms", .0.as_millis())]
    RefreshTimeout(Duration),

    /// Backend declined the refresh token
    #[error("Token refresh rejected: {0}")]
    RefreshRejected(String),

    /// Refresh call failed before the backend could answer
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Dispatch attempted without an access credential
    #[error("Not authenticated")]
    Unauthenticated,

    /// Server still rejected the credential after the single retry
    #[error("Authorization expired")]
    AuthorizationExpired,

    /// Login attempted while a session is active
    #[error("Already authenticated")]
    AlreadyAuthenticated,

    /// Backend declined the login request
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Non-authorization transport failure, passed through untouched
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    /// Whether this error ends the session when raised by a refresh
    ///
    /// `Unauthenticated` means the session already ended on its own.
    pub fn terminates_session(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshCredential
                | AuthError::InvalidCredential(_)
                | AuthError::RefreshTimeout(_)
                | AuthError::RefreshRejected(_)
                | AuthError::RefreshFailed(_)
                | AuthError::PersistenceError(_)
        )
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, AuthError>;
