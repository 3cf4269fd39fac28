// Session client
// Wires the session lifecycle, refresh coordinator and request dispatcher together

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    AuthBackend, CredentialPair, CredentialPersistence, CredentialStore, HttpAuthBackend,
    RefreshCoordinator, SessionLifecycle, SqlitePersistence,
};
use crate::config::Config;
use crate::error::Result;
use crate::http_client::{PendingRequest, RequestDispatcher};
use crate::transport::{ReqwestTransport, Transport, TransportResponse};

/// Authenticated HTTP client with a single shared session
pub struct SessionClient {
    session: Arc<SessionLifecycle>,
    coordinator: Arc<RefreshCoordinator>,
    dispatcher: RequestDispatcher,
    backend: Arc<dyn AuthBackend>,
}

impl SessionClient {
    /// Restore the persisted session and build the request pipeline around it
    pub async fn init(
        persistence: Arc<dyn CredentialPersistence>,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
        refresh_timeout: Duration,
    ) -> Result<Self> {
        let session = Arc::new(SessionLifecycle::init(persistence).await?);
        let store = session.store();

        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            backend.clone(),
            session.clone(),
            refresh_timeout,
        ));
        let dispatcher = RequestDispatcher::new(store, coordinator.clone(), transport);

        Ok(Self {
            session,
            coordinator,
            dispatcher,
            backend,
        })
    }

    /// Build the client from configuration: SQLite-backed session, reqwest transport
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let persistence = SqlitePersistence::open(&config.session_db_file)?;
        let backend = HttpAuthBackend::new(
            config.refresh_url.clone(),
            config.login_url.clone(),
            config.http_request_timeout,
        )?;
        let transport = ReqwestTransport::new(
            Some(config.base_url.clone()),
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;

        Self::init(
            Arc::new(persistence),
            Arc::new(backend),
            Arc::new(transport),
            config.refresh_timeout,
        )
        .await
        .context("Failed to restore session")
    }

    pub fn session(&self) -> &Arc<SessionLifecycle> {
        &self.session
    }

    pub fn store(&self) -> Arc<CredentialStore> {
        self.session.store()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Log in with user credentials through the authentication backend
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Arc<CredentialPair>> {
        self.session
            .sign_in(self.backend.as_ref(), email, password)
            .await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    pub async fn send(&self, request: PendingRequest) -> Result<TransportResponse> {
        self.dispatcher.send(request).await
    }

    pub async fn teardown(&self) -> Result<()> {
        self.session.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryPersistence, SessionState};
    use crate::error::AuthError;
    use crate::test_support::{pair, FakeBackend, FakeTransport};

    #[tokio::test]
    async fn test_restored_session_refreshes_and_retries() {
        let persistence = Arc::new(MemoryPersistence::with_pair(pair("A1", "R1")));
        let backend = Arc::new(FakeBackend::granting("A2"));
        let transport = Arc::new(FakeTransport::accepting("A2"));

        let client = SessionClient::init(
            persistence.clone(),
            backend.clone(),
            transport.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(client.session().state().await, SessionState::Authenticated);

        let response = client
            .send(PendingRequest::get("api/products/"))
            .await
            .unwrap();
        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(backend.calls(), 1);
        assert_eq!(transport.bearer_tokens(), vec!["Bearer A1", "Bearer A2"]);

        // Refreshed pair reached persistence
        let saved = persistence.load().await.unwrap().unwrap();
        assert_eq!(saved.access_token, "A2");
        assert_eq!(saved.refresh_token, "R1");
    }

    #[tokio::test]
    async fn test_sign_in_then_logout() {
        let client = SessionClient::init(
            Arc::new(MemoryPersistence::new()),
            Arc::new(FakeBackend::granting("A2")),
            Arc::new(FakeTransport::accepting("A1")),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = client
            .send(PendingRequest::get("api/products/"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);

        client.sign_in("admin@example.com", "secret").await.unwrap();
        let response = client
            .send(PendingRequest::get("api/products/"))
            .await
            .unwrap();
        assert_eq!(response.status, reqwest::StatusCode::OK);

        client.logout().await.unwrap();
        assert!(client.store().get().is_none());
        client.teardown().await.unwrap();
    }
}
