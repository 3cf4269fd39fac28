// Fakes shared by unit tests

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::auth::{
    AuthBackend, CredentialPair, CredentialPersistence, Identity, LoginGrant, MemoryPersistence,
    SessionTerminator, TokenGrant,
};
use crate::error::{AuthError, Result};
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

pub fn identity() -> Identity {
    Identity {
        role: "admin".to_string(),
        email: "admin@example.com".to_string(),
    }
}

pub fn pair(access: &str, refresh: &str) -> CredentialPair {
    CredentialPair {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        identity: identity(),
    }
}

enum BackendMode {
    Grant {
        access: String,
        refresh: Option<String>,
    },
    Reject,
}

/// Authentication backend that counts calls
pub struct FakeBackend {
    mode: BackendMode,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn with_mode(mode: BackendMode) -> Self {
        Self {
            mode,
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn granting(access: &str) -> Self {
        Self::with_mode(BackendMode::Grant {
            access: access.to_string(),
            refresh: None,
        })
    }

    pub fn rotating(access: &str, refresh: &str) -> Self {
        Self::with_mode(BackendMode::Grant {
            access: access.to_string(),
            refresh: Some(refresh.to_string()),
        })
    }

    pub fn rejecting() -> Self {
        Self::with_mode(BackendMode::Reject)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(refresh_token.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.mode {
            BackendMode::Grant { access, refresh } => Ok(TokenGrant {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
            }),
            BackendMode::Reject => Err(AuthError::RefreshRejected(
                "401 Unauthorized - token_not_valid".to_string(),
            )),
        }
    }

    async fn login(&self, email: &str, _password: &str) -> Result<LoginGrant> {
        Ok(LoginGrant {
            access_token: "A1".to_string(),
            refresh_token: "R1".to_string(),
            identity: Identity {
                role: "admin".to_string(),
                email: email.to_string(),
            },
        })
    }
}

/// Terminator that records every reason it was given
#[derive(Default)]
pub struct RecordingTerminator {
    reasons: Mutex<Vec<AuthError>>,
}

impl RecordingTerminator {
    pub fn reasons(&self) -> Vec<AuthError> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionTerminator for RecordingTerminator {
    async fn terminate(&self, reason: AuthError) {
        self.reasons.lock().unwrap().push(reason);
    }
}

/// In-memory persistence whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyPersistence {
    inner: MemoryPersistence,
    fail: AtomicBool,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialPersistence for FlakyPersistence {
    async fn save(&self, pair: &CredentialPair) -> anyhow::Result<()> {
        self.check()?;
        self.inner.save(pair).await
    }

    async fn load(&self) -> anyhow::Result<Option<CredentialPair>> {
        self.inner.load().await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.check()?;
        self.inner.clear().await
    }
}

type Handler = Box<
    dyn Fn(&TransportRequest) -> std::result::Result<TransportResponse, TransportError>
        + Send
        + Sync,
>;

/// Transport answering from a closure and recording every request
pub struct FakeTransport {
    handler: Handler,
    delay: Option<Duration>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&TransportRequest) -> std::result::Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Accept only `Bearer <token>`, answer 401 otherwise
    pub fn accepting(token: &str) -> Self {
        let expected = format!("Bearer {}", token);
        Self::new(move |request| {
            let authorized = request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some(expected.as_str());
            if authorized {
                Ok(TransportResponse::new(reqwest::StatusCode::OK, "ok"))
            } else {
                Ok(TransportResponse::new(
                    reqwest::StatusCode::UNAUTHORIZED,
                    "token_not_valid",
                ))
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Authorization header of every request, in dispatch order
    pub fn bearer_tokens(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.headers.get(AUTHORIZATION))
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }
}
