// Credential persistence collaborators
// The store hands them plain values; at-rest protection is their concern

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use super::types::CredentialPair;

/// Key under which the credential pair is stored
const CREDENTIALS_KEY: &str = "session:credentials";

/// Durable storage for the current credential pair
#[async_trait]
pub trait CredentialPersistence: Send + Sync {
    async fn save(&self, pair: &CredentialPair) -> Result<()>;

    async fn load(&self) -> Result<Option<CredentialPair>>;

    async fn clear(&self) -> Result<()>;

    /// Flush buffered writes; called once at teardown
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-local persistence, lost on exit
#[derive(Default)]
pub struct MemoryPersistence {
    saved: AsyncMutex<Option<CredentialPair>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an already persisted pair
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            saved: AsyncMutex::new(Some(pair)),
        }
    }
}

#[async_trait]
impl CredentialPersistence for MemoryPersistence {
    async fn save(&self, pair: &CredentialPair) -> Result<()> {
        *self.saved.lock().await = Some(pair.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<CredentialPair>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        *self.saved.lock().await = None;
        Ok(())
    }
}

/// SQLite key/value persistence (`auth_kv` table, JSON values)
///
/// Writes run in autocommit mode, so there is nothing to flush at teardown.
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("SQLite connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .context("SQLite task panicked")?
    }
}

#[async_trait]
impl CredentialPersistence for SqlitePersistence {
    async fn save(&self, pair: &CredentialPair) -> Result<()> {
        let value = serde_json::to_string(pair).context("Failed to serialize credentials")?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [CREDENTIALS_KEY, value.as_str()],
            )
            .context("Failed to write credentials to SQLite")?;
            Ok(())
        })
        .await
    }

    async fn load(&self) -> Result<Option<CredentialPair>> {
        let value: Option<String> = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM auth_kv WHERE key = ?",
                    [CREDENTIALS_KEY],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to load credentials from SQLite")
            })
            .await?;

        value
            .map(|json| {
                serde_json::from_str(&json).context("Failed to parse credentials from SQLite")
            })
            .transpose()
    }

    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM auth_kv WHERE key = ?", [CREDENTIALS_KEY])
                .context("Failed to delete credentials from SQLite")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::Identity;

    fn pair(access: &str) -> CredentialPair {
        CredentialPair::new(
            access,
            "R1",
            Identity {
                role: "admin".to_string(),
                email: "admin@example.com".to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_persistence() {
        let persistence = MemoryPersistence::new();
        assert!(persistence.load().await.unwrap().is_none());

        persistence.save(&pair("A1")).await.unwrap();
        assert_eq!(persistence.load().await.unwrap(), Some(pair("A1")));

        persistence.clear().await.unwrap();
        assert!(persistence.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_overwrites_and_clears() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        assert!(persistence.load().await.unwrap().is_none());

        persistence.save(&pair("A1")).await.unwrap();
        persistence.save(&pair("A2")).await.unwrap();
        assert_eq!(persistence.load().await.unwrap(), Some(pair("A2")));

        persistence.clear().await.unwrap();
        assert!(persistence.load().await.unwrap().is_none());

        // Clearing twice is fine
        persistence.clear().await.unwrap();
        persistence.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("bearer-session-{}", uuid::Uuid::new_v4()));
        let path = dir.join("session.sqlite3");

        {
            let persistence = SqlitePersistence::open(&path).unwrap();
            persistence.save(&pair("A1")).await.unwrap();
        }

        let reopened = SqlitePersistence::open(&path).unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(pair("A1")));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_sqlite_corrupt_value_is_an_error() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        persistence
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)",
                    [CREDENTIALS_KEY, "not json"],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(persistence.load().await.is_err());
    }
}
