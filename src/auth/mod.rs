// Authentication module
// Credential storage, single-flight refresh and session lifecycle

mod coordinator;
mod credentials;
mod refresh;
mod session;
mod store;
mod types;

pub use coordinator::{RefreshCoordinator, SessionTerminator, TicketInfo};
pub use credentials::{CredentialPersistence, MemoryPersistence, SqlitePersistence};
pub use refresh::{AuthBackend, HttpAuthBackend};
pub use session::{SessionEvent, SessionLifecycle, SessionState};
pub use store::{
    ChangeListener, CredentialChange, CredentialSnapshot, CredentialStore, ListenerId, SessionId,
};
pub use types::{redact, CredentialPair, Identity, LoginGrant, TokenGrant};
