use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use super::refresh::AuthBackend;
use super::store::{CredentialStore, SessionId};
use super::types::{CredentialPair, TokenGrant};
use crate::error::{AuthError, Result};

/// Outcome slot of a ticket; `None` until the refresh finishes
type Outcome = Option<Result<Arc<CredentialPair>>>;

type TicketSlot = Arc<Mutex<Option<RefreshTicket>>>;

/// Receives the signal that a refresh failure ended the session
///
/// By the time `terminate` runs the coordinator has already cleared the
/// credentials it was refreshing.
#[async_trait]
pub trait SessionTerminator: Send + Sync {
    async fn terminate(&self, reason: AuthError);
}

/// One in-flight refresh attempt
#[derive(Clone)]
struct RefreshTicket {
    id: Uuid,
    session: SessionId,
    started_at: DateTime<Utc>,
    outcome: watch::Receiver<Outcome>,
}

/// Public view of the in-flight ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

enum Acquired {
    /// Wait on this ticket's outcome
    Attached(watch::Receiver<Outcome>),
    /// A refresh for an older session is still finishing; wait, then try again
    Superseded(watch::Receiver<Outcome>),
    /// The stale token was already replaced within the same session
    Current(Arc<CredentialPair>),
    /// The session the caller acted for is gone
    SessionEnded,
    NoCredential,
}

/// Refresh coordinator
/// Guarantees at most one backend refresh call at a time; every caller that
/// needs a refresh while one is running shares its result
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    terminator: Arc<dyn SessionTerminator>,
    timeout: Duration,
    ticket: TicketSlot,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        terminator: Arc<dyn SessionTerminator>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            terminator,
            timeout,
            ticket: Arc::new(Mutex::new(None)),
        }
    }

    /// Refresh the access token, joining an in-flight refresh if there is one
    pub async fn refresh(&self) -> Result<Arc<CredentialPair>> {
        self.refresh_inner(None).await
    }

    /// Refresh because `stale_access_token`, issued to `session`, was rejected
    ///
    /// Returns the current pair without a backend call when the same session
    /// already holds a different access token. Fails with `Unauthenticated`
    /// when `session` has ended, so a request is never replayed with another
    /// session's credentials.
    pub async fn refresh_stale(
        &self,
        session: SessionId,
        stale_access_token: &str,
    ) -> Result<Arc<CredentialPair>> {
        self.refresh_inner(Some((session, stale_access_token))).await
    }

    /// The in-flight ticket, if any
    pub fn in_flight(&self) -> Option<TicketInfo> {
        lock_slot(&self.ticket).as_ref().map(|ticket| TicketInfo {
            id: ticket.id,
            started_at: ticket.started_at,
        })
    }

    async fn refresh_inner(
        &self,
        stale: Option<(SessionId, &str)>,
    ) -> Result<Arc<CredentialPair>> {
        loop {
            let outcome = match self.acquire(stale) {
                Acquired::Attached(outcome) => outcome,
                Acquired::Superseded(outcome) => {
                    let _ = wait_outcome(outcome).await;
                    continue;
                }
                Acquired::Current(pair) => return Ok(pair),
                Acquired::SessionEnded => {
                    tracing::debug!("Session ended before its token could be refreshed");
                    return Err(AuthError::Unauthenticated);
                }
                Acquired::NoCredential => {
                    tracing::warn!("Token refresh requested without a refresh token, ending session");
                    self.terminator
                        .terminate(AuthError::NoRefreshCredential)
                        .await;
                    return Err(AuthError::NoRefreshCredential);
                }
            };

            return wait_outcome(outcome).await;
        }
    }

    /// Check-then-create under one lock so two callers can never both start a refresh
    fn acquire(&self, stale: Option<(SessionId, &str)>) -> Acquired {
        let mut slot = lock_slot(&self.ticket);

        let snapshot = self.store.snapshot();
        let session = match stale {
            Some((session, _)) if session != snapshot.session => return Acquired::SessionEnded,
            Some((session, _)) => session,
            None => snapshot.session,
        };

        if let Some(ticket) = slot.as_ref() {
            if ticket.session != session {
                tracing::debug!(ticket = %ticket.id, "Waiting for refresh of a previous session");
                return Acquired::Superseded(ticket.outcome.clone());
            }
            tracing::debug!(ticket = %ticket.id, "Attaching to in-flight token refresh");
            return Acquired::Attached(ticket.outcome.clone());
        }

        let Some(current) = snapshot.pair else {
            return Acquired::NoCredential;
        };

        if let Some((_, stale_access_token)) = stale {
            if current.access_token != stale_access_token {
                tracing::debug!("Access token already refreshed, reusing it");
                return Acquired::Current(current);
            }
        }

        let (tx, rx) = watch::channel(None);
        let ticket = RefreshTicket {
            id: Uuid::new_v4(),
            session,
            started_at: Utc::now(),
            outcome: rx.clone(),
        };

        tracing::debug!(ticket = %ticket.id, "Starting token refresh");

        let task = RefreshTask {
            id: ticket.id,
            session,
            refresh_token: current.refresh_token.clone(),
            store: self.store.clone(),
            backend: self.backend.clone(),
            terminator: self.terminator.clone(),
            timeout: self.timeout,
            slot: self.ticket.clone(),
        };
        *slot = Some(ticket);

        // Runs detached so a caller giving up does not cancel it for the others
        tokio::spawn(task.run(tx));

        Acquired::Attached(rx)
    }
}

async fn wait_outcome(mut outcome: watch::Receiver<Outcome>) -> Result<Arc<CredentialPair>> {
    let result: Outcome = match outcome.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone(),
        Err(_) => None,
    };

    result.unwrap_or_else(|| {
        Err(AuthError::RefreshFailed(
            "refresh task ended without an outcome".to_string(),
        ))
    })
}

fn lock_slot(slot: &TicketSlot) -> std::sync::MutexGuard<'_, Option<RefreshTicket>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the ticket when dropped, including when the refresh task panics
struct TicketGuard {
    slot: TicketSlot,
    id: Uuid,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().is_some_and(|ticket| ticket.id == self.id) {
            *slot = None;
        }
    }
}

struct RefreshTask {
    id: Uuid,
    session: SessionId,
    refresh_token: String,
    store: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    terminator: Arc<dyn SessionTerminator>,
    timeout: Duration,
    slot: TicketSlot,
}

impl RefreshTask {
    async fn run(self, tx: watch::Sender<Outcome>) {
        let guard = TicketGuard {
            slot: self.slot.clone(),
            id: self.id,
        };

        let result = self.execute().await;

        // Ticket goes away before waiters wake, so a follow-up refresh starts fresh
        drop(guard);
        tx.send_replace(Some(result));
    }

    async fn execute(&self) -> Result<Arc<CredentialPair>> {
        let started = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.backend.refresh(&self.refresh_token)).await {
            Ok(Ok(grant)) => self.install(grant).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AuthError::RefreshTimeout(self.timeout)),
        };

        match result {
            Ok(pair) => {
                tracing::info!(
                    ticket = %self.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Token refresh completed"
                );
                Ok(pair)
            }
            Err(e) if e.terminates_session() => {
                self.fail(&e).await;
                Err(e)
            }
            Err(e) => {
                tracing::debug!(ticket = %self.id, error = %e, "Token refresh abandoned");
                Err(e)
            }
        }
    }

    async fn install(&self, grant: TokenGrant) -> Result<Arc<CredentialPair>> {
        let snapshot = self.store.snapshot();
        let current = match snapshot.pair {
            Some(current) if snapshot.session == self.session => current,
            _ => {
                tracing::debug!(ticket = %self.id, "Session changed during refresh, discarding new token");
                return Err(AuthError::Unauthenticated);
            }
        };

        match self
            .store
            .compare_and_replace(self.session, current.refreshed(grant))
            .await?
        {
            Some(pair) => Ok(pair),
            None => {
                tracing::debug!(ticket = %self.id, "Session changed during refresh, discarding new token");
                Err(AuthError::Unauthenticated)
            }
        }
    }

    /// Fail closed: drop the credentials that could not be refreshed and end the session
    async fn fail(&self, reason: &AuthError) {
        tracing::warn!(ticket = %self.id, error = %reason, "Token refresh failed");

        match self.store.evict(self.session).await {
            Ok(true) => {}
            Ok(false) => {
                // Logged out, or a different session took over while we waited
                tracing::debug!(ticket = %self.id, "Credentials already replaced, leaving session alone");
                return;
            }
            Err(e) => {
                // Memory is cleared; only the persisted copy survived
                tracing::error!(ticket = %self.id, "Failed to clear persisted credentials after refresh failure: {}", e);
            }
        }

        self.terminator.terminate(reason.clone()).await;
    }
}
