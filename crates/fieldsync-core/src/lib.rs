//! Offline-first sync engine: asset uploads, mutation draining, provisional
//! checklist reconciliation, and progress rollup over the local store.

pub mod assets;
pub mod config;
pub mod connector;
pub mod engine;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod tables;

pub use assets::{AssetUploadWorker, SweepReport};
pub use config::{load_config, parse_config, Config};
pub use connector::{DrainError, DrainReport, MutationUploadConnector};
pub use engine::SyncEngine;
pub use progress::{ProgressAggregator, Rollup};
pub use reconcile::{
    ChecklistView, OptimisticReconciler, ReconcileReport, StatusChange, TemplateItem,
};
pub use remote::{BlobStore, MemoryRemote, RemoteError, RemoteStore};
pub use scheduler::{Scheduler, SweepJob, WakeHandle};
