//! Interfaces to the remote data service and blob storage.
//!
//! Every call is keyed by a caller-supplied identifier so that retries are
//! idempotent; the service never assigns ids.

use fieldsync_kernel::Record;
use thiserror::Error;

pub mod memory;

pub use memory::{MemoryRemote, RemoteCall};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or availability problem; retried by the next sweep.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// A row with the same unique key already exists.
    #[error("uniqueness conflict on {table}")]
    Conflict { table: String },
    /// The service refused a well-formed request.
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }
}

/// Remote system of record for mirrored tables.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or merge `record` by its `id`.
    async fn upsert(&self, table: &str, record: &Record) -> Result<(), RemoteError>;
    /// Plain insert; an existing `id` yields [`RemoteError::Conflict`].
    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError>;
    async fn update(&self, table: &str, id: &str, patch: &Record) -> Result<(), RemoteError>;
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
    /// Rows of `table` whose `parent_column` equals `parent_id`, ordered by `order_by`.
    async fn select_children(
        &self,
        table: &str,
        parent_column: &str,
        parent_id: &str,
        order_by: &str,
    ) -> Result<Vec<Record>, RemoteError>;
}

/// Remote blob storage for captured asset bytes.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`, overwriting, and return a retrievable URL.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, RemoteError>;
}
