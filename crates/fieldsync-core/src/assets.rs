//! Background upload of captured assets.
//!
//! Per entry: `queued → uploading → {removed | failed → uploading}`. An entry
//! leaves the queue only after its bytes are in blob storage and the confirmed
//! metadata row has been written locally and read back.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use fieldsync_events::Bus;
use fieldsync_kernel::{AssetStatus, ConfirmedAsset, LocalStore, PendingAsset, Table};
use fieldsync_topics as topics;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::remote::{BlobStore, RemoteStore};
use crate::scheduler::SweepJob;

const PHOTOS_TABLE: &str = "photos";

/// Counts from one pass over the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub uploaded: usize,
    pub failed: usize,
    pub purged: usize,
    /// Entries that disappeared between listing and processing.
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Uploaded,
    Failed,
    Purged,
    Skipped,
}

/// Where an entry's bytes were found, if anywhere.
enum Located {
    At(PathBuf),
    Missing,
    /// The file system could not say; the entry is retried rather than purged.
    Unreadable(std::io::Error),
}

/// Content type sent with an upload, by file extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "heic" => "image/heic",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Remote object path for an asset.
pub fn storage_path_for(asset: &PendingAsset) -> String {
    format!("photos/{}/{}", asset.parent_entity_id, asset.filename)
}

pub struct AssetUploadWorker {
    store: LocalStore,
    blob: Arc<dyn BlobStore>,
    remote: Arc<dyn RemoteStore>,
    bus: Bus,
    assets_dir: PathBuf,
    in_flight: Mutex<()>,
}

impl AssetUploadWorker {
    pub fn new(
        store: LocalStore,
        blob: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteStore>,
        bus: Bus,
        assets_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            blob,
            remote,
            bus,
            assets_dir,
            in_flight: Mutex::new(()),
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    /// Stage an asset whose bytes are already on disk. Returns once the entry
    /// is durable; uploading happens on the next sweep.
    pub fn enqueue(&self, parent_entity_id: &str, local_path: &Path) -> Result<String> {
        let id = self
            .store
            .with(|s| s.assets().enqueue(parent_entity_id, local_path))?;
        self.bus.publish(
            topics::TOPIC_ASSET_ENQUEUED,
            &json!({"asset_id": id, "parent_entity_id": parent_entity_id}),
        );
        Ok(id)
    }

    /// Process every queued, failed, or abandoned `uploading` entry once.
    ///
    /// Returns `None` when another sweep is already running.
    pub async fn sweep(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(target: "fieldsync::assets", "sweep already in flight");
            return None;
        };
        let mut report = SweepReport::default();
        let pending = match self
            .store
            .call(|s| {
                s.assets().list_pending(&[
                    AssetStatus::Queued,
                    AssetStatus::Uploading,
                    AssetStatus::Failed,
                ])
            })
            .await
        {
            Ok(p) => p,
            Err(err) => {
                warn!(target: "fieldsync::assets", %err, "could not list pending assets");
                return Some(report);
            }
        };

        for asset in pending {
            let id = asset.id.clone();
            match self.process(asset).await {
                Ok(Outcome::Uploaded) => report.uploaded += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Purged) => report.purged += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    // the entry keeps its status and is picked up again next sweep
                    warn!(target: "fieldsync::assets", asset_id = %id, %err, "asset step failed locally");
                    report.failed += 1;
                }
            }
        }
        if !report.is_empty() {
            info!(
                target: "fieldsync::assets",
                uploaded = report.uploaded,
                failed = report.failed,
                purged = report.purged,
                "asset sweep finished"
            );
            self.bus
                .publish(topics::TOPIC_ASSET_SWEEP_COMPLETED, &report);
        }
        Some(report)
    }

    async fn process(&self, asset: PendingAsset) -> Result<Outcome> {
        let id = asset.id.clone();
        let marked = self
            .store
            .call(move |s| s.assets().update_status(&id, AssetStatus::Uploading))
            .await?;
        if !marked {
            return Ok(Outcome::Skipped);
        }

        let path = match self.resolve_bytes(&asset).await? {
            Located::At(path) => path,
            Located::Missing => return self.purge(&asset).await,
            Located::Unreadable(e) => {
                warn!(target: "fieldsync::assets", asset_id = %asset.id, path = %asset.local_path.display(), %e, "could not check asset bytes");
                return self.fail(&asset, format!("stat {}: {}", asset.local_path.display(), e)).await;
            }
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return self.purge(&asset).await,
            Err(e) => return self.fail(&asset, format!("read {}: {}", path.display(), e)).await,
        };

        let storage_path = storage_path_for(&asset);
        let url = match self
            .blob
            .put(&storage_path, bytes, content_type_for(&asset.filename))
            .await
        {
            Ok(url) => url,
            Err(err) => {
                debug!(target: "fieldsync::assets", asset_id = %asset.id, %err, "upload failed; will retry");
                return self.fail(&asset, err.to_string()).await;
            }
        };

        let confirmed = ConfirmedAsset {
            id: asset.id.clone(),
            parent_entity_id: asset.parent_entity_id.clone(),
            storage_path,
            url,
            filename: asset.filename.clone(),
            created_at: asset.created_at.clone(),
        };
        let record = confirmed.to_record();
        let local = record.clone();
        if let Err(err) = self
            .store
            .call(move |s| s.rows().upsert(Table::Photos, &local))
            .await
        {
            warn!(target: "fieldsync::assets", asset_id = %asset.id, %err, "could not write confirmed asset");
            return self.fail(&asset, format!("local write: {}", err)).await;
        }

        match self.remote.insert(PHOTOS_TABLE, &record).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                debug!(target: "fieldsync::assets", asset_id = %asset.id, "remote asset row already present");
            }
            Err(err) => {
                debug!(target: "fieldsync::assets", asset_id = %asset.id, %err, "remote asset insert deferred to connector");
            }
        }

        let check_id = asset.id.clone();
        let stored = self
            .store
            .call(move |s| s.rows().get(Table::Photos, &check_id))
            .await?;
        let verified = stored
            .as_ref()
            .and_then(ConfirmedAsset::from_record)
            .map(|row| {
                row.id == confirmed.id
                    && row.url == confirmed.url
                    && row.parent_entity_id == confirmed.parent_entity_id
            })
            .unwrap_or(false);
        if !verified {
            warn!(target: "fieldsync::assets", asset_id = %asset.id, "confirmed asset did not read back");
            return self
                .fail(&asset, "local record verification failed".to_string())
                .await;
        }

        let remove_id = asset.id.clone();
        self.store
            .call(move |s| s.assets().remove(&remove_id))
            .await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                debug!(target: "fieldsync::assets", asset_id = %asset.id, path = %path.display(), %e, "could not delete uploaded bytes");
            }
        }
        self.bus.publish(
            topics::TOPIC_ASSET_UPLOADED,
            &json!({
                "asset_id": confirmed.id,
                "parent_entity_id": confirmed.parent_entity_id,
                "url": confirmed.url,
            }),
        );
        Ok(Outcome::Uploaded)
    }

    /// Canonical path first, then the same file name under the assets directory.
    async fn resolve_bytes(&self, asset: &PendingAsset) -> Result<Located> {
        match tokio::fs::try_exists(&asset.local_path).await {
            Ok(true) => return Ok(Located::At(asset.local_path.clone())),
            Ok(false) => {}
            Err(e) => return Ok(Located::Unreadable(e)),
        }
        let fallback = self.assets_dir.join(&asset.filename);
        if fallback == asset.local_path {
            return Ok(Located::Missing);
        }
        match tokio::fs::try_exists(&fallback).await {
            Ok(true) => {}
            Ok(false) => return Ok(Located::Missing),
            Err(e) => return Ok(Located::Unreadable(e)),
        }
        let id = asset.id.clone();
        let new_path = fallback.clone();
        self.store
            .call(move |s| s.assets().relocate(&id, &new_path))
            .await?;
        debug!(
            target: "fieldsync::assets",
            asset_id = %asset.id,
            from = %asset.local_path.display(),
            to = %fallback.display(),
            "asset relocated"
        );
        Ok(Located::At(fallback))
    }

    async fn purge(&self, asset: &PendingAsset) -> Result<Outcome> {
        let id = asset.id.clone();
        self.store.call(move |s| s.assets().remove(&id)).await?;
        warn!(
            target: "fieldsync::assets",
            asset_id = %asset.id,
            path = %asset.local_path.display(),
            "asset bytes missing; dropping queue entry"
        );
        self.bus.publish(
            topics::TOPIC_ASSET_PURGED,
            &json!({"asset_id": asset.id, "parent_entity_id": asset.parent_entity_id}),
        );
        Ok(Outcome::Purged)
    }

    async fn fail(&self, asset: &PendingAsset, reason: String) -> Result<Outcome> {
        let id = asset.id.clone();
        let stored_reason = reason.clone();
        self.store
            .call(move |s| s.assets().record_failure(&id, &stored_reason))
            .await?;
        self.bus.publish(
            topics::TOPIC_ASSET_FAILED,
            &json!({"asset_id": asset.id, "reason": reason}),
        );
        Ok(Outcome::Failed)
    }
}

#[async_trait::async_trait]
impl SweepJob for AssetUploadWorker {
    fn name(&self) -> &'static str {
        "assets.sweep"
    }

    async fn run_once(&self) {
        let _ = self.sweep().await;
    }
}
