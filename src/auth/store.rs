use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Mutex as AsyncMutex};

use super::credentials::CredentialPersistence;
use super::types::{redact, CredentialPair};
use crate::error::{AuthError, Result};

/// Mutation observed by `on_change` listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialChange {
    Replaced {
        revision: u64,
        pair: Arc<CredentialPair>,
    },
    Cleared {
        revision: u64,
    },
}

impl CredentialChange {
    pub fn revision(&self) -> u64 {
        match self {
            CredentialChange::Replaced { revision, .. } | CredentialChange::Cleared { revision } => {
                *revision
            }
        }
    }
}

pub type ChangeListener = Arc<dyn Fn(&CredentialChange) + Send + Sync>;

/// Handle returned by [`CredentialStore::on_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Identifies one login session across token refreshes
///
/// A new id is issued by every `replace` and every removal; refreshing
/// through `compare_and_replace` keeps it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Pair and session id read together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub session: SessionId,
    pub pair: Option<Arc<CredentialPair>>,
}

/// Credential store
/// Holds the current pair; every mutation is persisted before it is applied
pub struct CredentialStore {
    /// Latest snapshot, readable without waiting on writers
    current: watch::Sender<CredentialSnapshot>,

    /// Serializes mutations across the persistence write; holds the revision
    write_lock: AsyncMutex<u64>,

    persistence: Arc<dyn CredentialPersistence>,

    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,

    next_listener_id: AtomicU64,
}

impl CredentialStore {
    /// Create a store from whatever the persistence collaborator holds
    pub async fn init(persistence: Arc<dyn CredentialPersistence>) -> Result<Self> {
        let loaded = persistence.load().await.map_err(|e| {
            tracing::error!("Failed to load persisted credentials: {:#}", e);
            AuthError::PersistenceError(format!("{:#}", e))
        })?;

        let initial = match loaded {
            Some(pair) => match pair.validate() {
                Ok(()) => {
                    tracing::info!(email = %pair.identity.email, "Restored persisted credentials");
                    Some(Arc::new(pair))
                }
                Err(e) => {
                    tracing::warn!("Discarding persisted credentials: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self::with_snapshot(persistence, initial))
    }

    /// Create an empty store without loading
    pub fn empty(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self::with_snapshot(persistence, None)
    }

    fn with_snapshot(
        persistence: Arc<dyn CredentialPersistence>,
        initial: Option<Arc<CredentialPair>>,
    ) -> Self {
        let (current, _) = watch::channel(CredentialSnapshot {
            session: SessionId::default(),
            pair: initial,
        });
        Self {
            current,
            write_lock: AsyncMutex::new(0),
            persistence,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Current pair
    pub fn get(&self) -> Option<Arc<CredentialPair>> {
        self.current.borrow().pair.clone()
    }

    /// Current pair together with the session it belongs to
    pub fn snapshot(&self) -> CredentialSnapshot {
        self.current.borrow().clone()
    }

    pub fn session(&self) -> SessionId {
        self.current.borrow().session
    }

    /// Current access token, if any
    pub fn access_token(&self) -> Option<String> {
        self.current
            .borrow()
            .pair
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.borrow().pair.is_some()
    }

    /// Install a new pair, starting a new session
    pub async fn replace(&self, pair: CredentialPair) -> Result<Arc<CredentialPair>> {
        pair.validate()?;

        let mut revision = self.write_lock.lock().await;
        self.install(&mut revision, pair, None).await
    }

    /// Install `pair` into `expected` only if that session is still current
    ///
    /// Returns `None` (and changes nothing) when the session was cleared or
    /// replaced by a different one in the meantime.
    pub async fn compare_and_replace(
        &self,
        expected: SessionId,
        pair: CredentialPair,
    ) -> Result<Option<Arc<CredentialPair>>> {
        pair.validate()?;

        let mut revision = self.write_lock.lock().await;
        if !self.holds_session(expected) {
            return Ok(None);
        }
        self.install(&mut revision, pair, Some(expected))
            .await
            .map(Some)
    }

    /// Remove the pair; returns whether one was present
    pub async fn clear(&self) -> Result<bool> {
        let mut revision = self.write_lock.lock().await;
        if self.current.borrow().pair.is_none() {
            return Ok(false);
        }
        self.remove(&mut revision).await?;
        Ok(true)
    }

    /// Drop session `expected` from memory even if the persisted copy cannot be removed
    ///
    /// Returns `Ok(false)` when `expected` is no longer current. On a
    /// persistence failure the in-memory pair is gone all the same and
    /// `PersistenceError` is returned.
    pub async fn evict(&self, expected: SessionId) -> Result<bool> {
        let mut revision = self.write_lock.lock().await;
        if !self.holds_session(expected) {
            return Ok(false);
        }

        let persisted = self.persistence.clear().await.map_err(|e| {
            tracing::error!("Failed to clear persisted credentials, evicting from memory only: {:#}", e);
            AuthError::PersistenceError(format!("{:#}", e))
        });
        self.apply_removal(&mut revision);

        persisted.map(|()| true)
    }

    fn holds_session(&self, expected: SessionId) -> bool {
        let current = self.current.borrow();
        current.pair.is_some() && current.session == expected
    }

    // Callers hold `write_lock`; `revision` is its guarded value.
    // `session` keeps an existing session id, `None` starts a new one.
    async fn install(
        &self,
        revision: &mut u64,
        pair: CredentialPair,
        session: Option<SessionId>,
    ) -> Result<Arc<CredentialPair>> {
        self.persistence.save(&pair).await.map_err(|e| {
            tracing::error!("Failed to persist credentials, keeping previous state: {:#}", e);
            AuthError::PersistenceError(format!("{:#}", e))
        })?;

        *revision += 1;
        let pair = Arc::new(pair);
        self.current.send_replace(CredentialSnapshot {
            session: session.unwrap_or(SessionId(*revision)),
            pair: Some(pair.clone()),
        });

        tracing::debug!(
            revision = *revision,
            access_token = %redact(&pair.access_token),
            "Credentials replaced"
        );

        self.notify(&CredentialChange::Replaced {
            revision: *revision,
            pair: pair.clone(),
        });

        Ok(pair)
    }

    async fn remove(&self, revision: &mut u64) -> Result<()> {
        self.persistence.clear().await.map_err(|e| {
            tracing::error!("Failed to clear persisted credentials, keeping previous state: {:#}", e);
            AuthError::PersistenceError(format!("{:#}", e))
        })?;

        self.apply_removal(revision);
        Ok(())
    }

    fn apply_removal(&self, revision: &mut u64) {
        *revision += 1;
        self.current.send_replace(CredentialSnapshot {
            session: SessionId(*revision),
            pair: None,
        });

        tracing::debug!(revision = *revision, "Credentials cleared");

        self.notify(&CredentialChange::Cleared {
            revision: *revision,
        });
    }

    /// Register a listener, invoked after every mutation in mutation order
    ///
    /// Listeners run while the mutation is still serialized, so they must not
    /// block and must not mutate the store; hand work off to a task if needed.
    /// Registering or removing listeners from inside a listener is fine and
    /// takes effect from the next mutation.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CredentialChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Latest-value receiver, for callers that only care about the current state
    pub fn watch(&self) -> watch::Receiver<CredentialSnapshot> {
        self.current.subscribe()
    }

    /// Wait for in-progress mutations, then flush the persistence collaborator
    pub async fn teardown(&self) -> Result<()> {
        let _revision = self.write_lock.lock().await;
        self.persistence.flush().await.map_err(|e| {
            tracing::error!("Failed to flush persisted credentials: {:#}", e);
            AuthError::PersistenceError(format!("{:#}", e))
        })
    }

    fn notify(&self, change: &CredentialChange) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(change);
        }
    }
}
