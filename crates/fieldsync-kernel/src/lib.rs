//! Local durable store for the field sync engine.
//!
//! `LocalStore` is the single authoritative handle on the on-device SQLite
//! database. Callers never touch SQL directly; they open a [`Session`] and go
//! through one of its narrow accessors: the asset queue, the mutation log,
//! generic rows, the progress tree, or the provisional checklist.

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

mod assets;
mod mutations;
mod progress;
mod provisional;
mod rows;
mod schema;
mod values;

pub use assets::{AssetQueue, AssetStatus, ConfirmedAsset, PendingAsset};
pub use mutations::{MutationLog, MutationOp, MutationRecord};
pub use progress::{AreaTally, LeafStatus, Level, ProgressTree};
pub use provisional::{
    is_provisional_id, new_provisional_id, ProvisionalChecklist, ProvisionalItem,
    PROVISIONAL_PREFIX,
};
pub use rows::Rows;
pub use schema::Table;

/// Field map used for row payloads.
pub type Record = serde_json::Map<String, serde_json::Value>;

const DB_FILE: &str = "fieldsync.sqlite";

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Clone, Debug)]
pub struct LocalStore {
    db_path: PathBuf,
}

impl LocalStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let store = Self { db_path };
        let conn = store.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        schema::migrate(&conn)?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Busy timeout (default 5000ms; override with FIELDSYNC_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("FIELDSYNC_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn session(&self) -> Result<Session> {
        Ok(Session { conn: self.conn()? })
    }

    /// Run `f` against a fresh session on the calling thread.
    pub fn with<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let session = self.session()?;
        f(&session)
    }

    /// Run `f` against a fresh session on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with(f))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

/// One open connection plus typed accessors over it.
pub struct Session {
    conn: Connection,
}

impl Session {
    pub fn assets(&self) -> AssetQueue<'_> {
        AssetQueue::new(&self.conn)
    }

    pub fn mutations(&self) -> MutationLog<'_> {
        MutationLog::new(&self.conn)
    }

    pub fn rows(&self) -> Rows<'_> {
        Rows::new(&self.conn)
    }

    pub fn progress(&self) -> ProgressTree<'_> {
        ProgressTree::new(&self.conn)
    }

    pub fn provisional(&self) -> ProvisionalChecklist<'_> {
        ProvisionalChecklist::new(&self.conn)
    }
}
