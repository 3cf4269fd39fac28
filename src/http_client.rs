use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{redact, CredentialStore, RefreshCoordinator};
use crate::error::{AuthError, Result};
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// An outbound request waiting to be sent, and possibly retried once
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub target: String,
    pub payload: Option<Bytes>,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    retry_attempted: bool,
}

impl PendingRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            payload: None,
            headers: HeaderMap::new(),
            timeout: None,
            retry_attempted: false,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> serde_json::Result<Self> {
        self.payload = Some(Bytes::from(serde_json::to_vec(value)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_attempted(&self) -> bool {
        self.retry_attempted
    }

    /// Flip the retry flag; false if it was already spent
    fn mark_retry_attempted(&mut self) -> bool {
        !std::mem::replace(&mut self.retry_attempted, true)
    }

    fn to_transport(&self, access_token: &str) -> Result<TransportRequest> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
            AuthError::InvalidCredential("access token is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);

        let mut headers = self.headers.clone();
        headers.insert(AUTHORIZATION, value);

        Ok(TransportRequest {
            method: self.method.clone(),
            url: self.target.clone(),
            headers,
            body: self.payload.clone(),
            timeout: self.timeout,
        })
    }
}

/// Request dispatcher
/// Attaches the bearer credential and retries once through the refresh
/// coordinator when the server answers 401
pub struct RequestDispatcher {
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    transport: Arc<dyn Transport>,
}

impl RequestDispatcher {
    pub fn new(
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            coordinator,
            transport,
        }
    }

    /// Send a request with the current access credential
    ///
    /// Only 401 is interpreted; every other status is returned as is.
    pub async fn send(&self, mut request: PendingRequest) -> Result<TransportResponse> {
        let snapshot = self.store.snapshot();
        let pair = snapshot.pair.ok_or(AuthError::Unauthenticated)?;

        let response = self.dispatch(&request, &pair.access_token).await?;
        if !response.is_authorization_expired() {
            return Ok(response);
        }

        if !request.mark_retry_attempted() {
            tracing::warn!(target = %request.target, "Received 401 after retry");
            return Err(AuthError::AuthorizationExpired);
        }

        tracing::warn!(
            method = %request.method,
            target = %request.target,
            access_token = %redact(&pair.access_token),
            "Received 401, refreshing token and retrying..."
        );

        let refreshed = match self
            .coordinator
            .refresh_stale(snapshot.session, &pair.access_token)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(AuthError::NoRefreshCredential) => return Err(AuthError::Unauthenticated),
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                return Err(e);
            }
        };

        let retried = self.dispatch(&request, &refreshed.access_token).await?;
        if retried.is_authorization_expired() {
            tracing::warn!(target = %request.target, "Received 401 after retry");
            return Err(AuthError::AuthorizationExpired);
        }

        Ok(retried)
    }

    async fn dispatch(
        &self,
        request: &PendingRequest,
        access_token: &str,
    ) -> Result<TransportResponse> {
        let transport_request = request.to_transport(access_token)?;

        tracing::debug!(
            method = %request.method,
            target = %request.target,
            retry = request.retry_attempted,
            "Dispatching request"
        );

        let response = self.transport.execute(transport_request).await?;

        tracing::debug!(status = %response.status, target = %request.target, "Request completed");
        Ok(response)
    }
}
