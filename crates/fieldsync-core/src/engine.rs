use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use fieldsync_events::Bus;
use fieldsync_kernel::{LeafStatus, LocalStore};
use tracing::info;
use uuid::Uuid;

use crate::assets::AssetUploadWorker;
use crate::config::Config;
use crate::connector::MutationUploadConnector;
use crate::progress::{ProgressAggregator, Rollup};
use crate::reconcile::{OptimisticReconciler, StatusChange};
use crate::remote::{BlobStore, RemoteStore};
use crate::scheduler::Scheduler;

/// Running sync engine: both background sweeps plus the foreground entry
/// points that feed them.
pub struct SyncEngine {
    store: LocalStore,
    bus: Bus,
    assets: Arc<AssetUploadWorker>,
    connector: Arc<MutationUploadConnector>,
    progress: ProgressAggregator,
    reconciler: OptimisticReconciler,
    asset_sweep: Scheduler,
    drain: Scheduler,
}

impl SyncEngine {
    /// Build the components and spawn their schedulers on the current runtime.
    pub fn start(
        config: &Config,
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        blob: Arc<dyn BlobStore>,
        bus: Bus,
    ) -> Result<Self> {
        let assets_dir = config.assets_dir();
        std::fs::create_dir_all(&assets_dir)?;

        let assets = Arc::new(AssetUploadWorker::new(
            store.clone(),
            blob,
            remote.clone(),
            bus.clone(),
            assets_dir,
        ));
        let connector = Arc::new(MutationUploadConnector::new(
            store.clone(),
            remote.clone(),
            bus.clone(),
            &config.sync,
        ));
        let progress = ProgressAggregator::new(store.clone(), bus.clone());
        let reconciler =
            OptimisticReconciler::new(store.clone(), remote, progress.clone(), bus.clone());

        let asset_sweep = Scheduler::spawn(assets.clone(), config.sync.sweep_interval());
        let drain = Scheduler::spawn(connector.clone(), config.sync.drain_interval());
        info!(
            sweep_secs = config.sync.sweep_interval_secs,
            drain_secs = config.sync.drain_interval_secs,
            db = %store.db_path().display(),
            "sync engine started"
        );
        Ok(Self {
            store,
            bus,
            assets,
            connector,
            progress,
            reconciler,
            asset_sweep,
            drain,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn assets(&self) -> &AssetUploadWorker {
        &self.assets
    }

    pub fn connector(&self) -> &MutationUploadConnector {
        &self.connector
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn reconciler(&self) -> &OptimisticReconciler {
        &self.reconciler
    }

    /// Queue a file already on disk and start uploading it right away.
    pub fn capture_asset(&self, parent_entity_id: &str, local_path: &Path) -> Result<String> {
        let id = self.assets.enqueue(parent_entity_id, local_path)?;
        self.asset_sweep.wake();
        Ok(id)
    }

    /// Persist captured bytes under the assets directory, then queue them.
    pub async fn capture_bytes(
        &self,
        parent_entity_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid asset file name {:?}", filename))?;
        let path = self
            .assets
            .assets_dir()
            .join(format!("{}-{}", Uuid::new_v4().simple(), name));
        tokio::fs::write(&path, bytes).await?;
        self.capture_asset(parent_entity_id, &path)
    }

    /// Status edit from a checklist screen; confirmed edits are drained promptly.
    pub async fn set_checklist_status(
        &self,
        item_id: &str,
        status: LeafStatus,
    ) -> Result<StatusChange> {
        let change = self.reconciler.set_status(item_id, status).await?;
        if matches!(change, StatusChange::Confirmed(_)) {
            self.drain.wake();
        }
        Ok(change)
    }

    /// Roll up after a checklist item was written directly through the
    /// store's row accessors, then drain the edit promptly.
    pub async fn checklist_item_changed(&self, item_id: &str) -> Result<Rollup> {
        let rollup = self.progress.on_leaf_changed(item_id).await?;
        self.drain.wake();
        Ok(rollup)
    }

    pub fn wake_assets(&self) {
        self.asset_sweep.wake();
    }

    pub fn wake_drain(&self) {
        self.drain.wake();
    }

    pub async fn shutdown(self) {
        self.asset_sweep.shutdown().await;
        self.drain.shutdown().await;
        info!("sync engine stopped");
    }
}
