use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use super::coordinator::SessionTerminator;
use super::credentials::CredentialPersistence;
use super::refresh::AuthBackend;
use super::store::CredentialStore;
use super::types::{CredentialPair, Identity};
use crate::error::{AuthError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

/// Session transition, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(Identity),
    LoggedOut,
    /// Session ended because the credential could not be refreshed
    Terminated(AuthError),
}

/// Session lifecycle
/// Owns the credential store and drives it through login, logout and termination
pub struct SessionLifecycle {
    store: Arc<CredentialStore>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionLifecycle {
    /// Restore the persisted session, if any
    pub async fn init(persistence: Arc<dyn CredentialPersistence>) -> Result<Self> {
        let store = CredentialStore::init(persistence).await?;
        Ok(Self::with_store(Arc::new(store)))
    }

    pub fn with_store(store: Arc<CredentialStore>) -> Self {
        let state = if store.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            store,
            state: Mutex::new(state),
            events,
        }
    }

    /// Shared handle to the store for the dispatcher and coordinator
    pub fn store(&self) -> Arc<CredentialStore> {
        self.store.clone()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session with an already issued credential pair
    pub async fn login(
        &self,
        identity: Identity,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Arc<CredentialPair>> {
        let pair = CredentialPair::new(access_token, refresh_token, identity)?;

        let mut state = self.state.lock().await;
        if self.holds_session(*state) {
            return Err(AuthError::AlreadyAuthenticated);
        }

        let pair = self.store.replace(pair).await?;
        *state = SessionState::Authenticated;

        tracing::info!(email = %pair.identity.email, role = %pair.identity.role, "Session started");
        let _ = self.events.send(SessionEvent::LoggedIn(pair.identity.clone()));

        Ok(pair)
    }

    /// Log in against the authentication backend with user credentials
    pub async fn sign_in(
        &self,
        backend: &dyn AuthBackend,
        email: &str,
        password: &str,
    ) -> Result<Arc<CredentialPair>> {
        if self.holds_session(self.state().await) {
            return Err(AuthError::AlreadyAuthenticated);
        }

        let grant = backend.login(email, password).await?;
        self.login(grant.identity, grant.access_token, grant.refresh_token)
            .await
    }

    /// End the session; a no-op when already anonymous
    pub async fn logout(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let removed = self.store.clear().await?;
        let was_authenticated = *state == SessionState::Authenticated;
        *state = SessionState::Anonymous;

        if was_authenticated || removed {
            tracing::info!("Session ended by logout");
            let _ = self.events.send(SessionEvent::LoggedOut);
        }

        Ok(())
    }

    // A failed refresh empties the store before `terminate` updates the
    // state, so an empty store counts as anonymous
    fn holds_session(&self, state: SessionState) -> bool {
        state == SessionState::Authenticated && self.store.is_authenticated()
    }

    /// Flush the store before process exit
    pub async fn teardown(&self) -> Result<()> {
        self.store.teardown().await
    }
}

#[async_trait]
impl SessionTerminator for SessionLifecycle {
    async fn terminate(&self, reason: AuthError) {
        let mut state = self.state.lock().await;

        // A login that raced the failed refresh owns the store now
        if self.store.is_authenticated() {
            tracing::debug!("Newer credentials present, not terminating session");
            return;
        }

        if *state == SessionState::Authenticated {
            tracing::warn!(reason = %reason, "Session terminated");
            let _ = self.events.send(SessionEvent::Terminated(reason));
        }
        *state = SessionState::Anonymous;
    }
}
