//! IdentityStore — redb-backed singleton slot for the framework identity.

use std::path::Path;
use std::sync::Arc;

use redb::Database;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{FRAMEWORK_ID_KEY, IDENTITY};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe identity store backed by redb.
#[derive(Clone)]
pub struct IdentityStore {
    db: Arc<Database>,
}

impl IdentityStore {
    /// Open (or create) a persistent identity store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "identity store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory identity store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory identity store opened");
        Ok(store)
    }

    /// Create the table if it doesn't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(IDENTITY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The stored framework identity, if any.
    pub fn read(&self) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IDENTITY).map_err(map_err!(Table))?;
        match table.get(FRAMEWORK_ID_KEY).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(guard.value().to_string())),
            None => Ok(None),
        }
    }

    /// The stored identity, or an empty string when none is stored.
    ///
    /// The subscribe path treats an empty identity as "register fresh",
    /// so a read failure is indistinguishable from a first start on
    /// purpose: losing the identity costs a re-registration, not a crash.
    pub fn read_or_empty(&self) -> String {
        self.read().ok().flatten().unwrap_or_default()
    }

    /// Persist the framework identity. Idempotent, last-write-wins.
    pub fn remember(&self, framework_id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IDENTITY).map_err(map_err!(Table))?;
            table
                .insert(FRAMEWORK_ID_KEY, framework_id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%framework_id, "framework identity stored");
        Ok(())
    }
}
