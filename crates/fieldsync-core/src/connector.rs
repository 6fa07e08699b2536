//! Drains the local mutation log to the remote data service in `seq` order.

use std::collections::HashSet;
use std::sync::Arc;

use fieldsync_events::Bus;
use fieldsync_kernel::{LocalStore, MutationOp, MutationRecord, Record};
use fieldsync_topics as topics;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::remote::{RemoteError, RemoteStore};
use crate::scheduler::SweepJob;
use crate::tables::{remote_shape, shape_payload, MutationTarget, UNKNOWN_TABLE_SHAPE};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries delivered to the remote service.
    pub applied: usize,
    /// Entries acknowledged without a remote call.
    pub skipped: usize,
    /// Log length after the drain.
    pub remaining: i64,
}

#[derive(Debug, Error)]
pub enum DrainError {
    /// The batch stopped at `seq`; nothing from it was acknowledged.
    #[error("mutation {seq} on {table} was not delivered: {source}")]
    Remote {
        seq: i64,
        table: String,
        source: RemoteError,
    },
    #[error("drain already in flight")]
    InFlight,
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

impl DrainError {
    pub fn is_transient(&self) -> bool {
        match self {
            DrainError::Remote { source, .. } => source.is_transient(),
            DrainError::InFlight => true,
            DrainError::Local(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Applied,
    Skipped,
}

pub struct MutationUploadConnector {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    bus: Bus,
    skip: HashSet<String>,
    batch_limit: i64,
    in_flight: Mutex<()>,
}

impl MutationUploadConnector {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, bus: Bus, sync: &SyncConfig) -> Self {
        Self {
            store,
            remote,
            bus,
            skip: sync.local_only_tables.iter().cloned().collect(),
            batch_limit: sync.batch_limit.max(1),
            in_flight: Mutex::new(()),
        }
    }

    fn is_skipped(&self, target: &MutationTarget) -> bool {
        if self.skip.contains(target.name()) {
            return true;
        }
        matches!(target, MutationTarget::Known(t) if t.is_local_only())
    }

    /// Deliver batches until the log is empty or a remote call fails.
    ///
    /// A failing batch is left in the log untouched and retried whole by the
    /// next drain; remote writes are keyed by id, so replays are harmless.
    pub async fn drain(&self) -> Result<DrainReport, DrainError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(target: "fieldsync::connector", "drain already in flight");
            return Err(DrainError::InFlight);
        };
        let mut report = DrainReport::default();
        loop {
            let limit = self.batch_limit;
            let batch = self.store.call(move |s| s.mutations().peek(limit)).await?;
            let Some(last_seq) = batch.last().map(|m| m.seq) else {
                break;
            };
            for m in &batch {
                match self.deliver(m).await {
                    Ok(Delivery::Applied) => report.applied += 1,
                    Ok(Delivery::Skipped) => report.skipped += 1,
                    Err(err) => {
                        self.bus.publish(
                            topics::TOPIC_MUTATIONS_FAILED,
                            &json!({"seq": m.seq, "table": m.table, "error": err.to_string()}),
                        );
                        return Err(err);
                    }
                }
            }
            self.store
                .call(move |s| s.mutations().acknowledge_through(last_seq))
                .await?;
            if (batch.len() as i64) < limit {
                break;
            }
        }
        report.remaining = self.store.call(|s| s.mutations().len()).await?;
        if report.applied + report.skipped > 0 {
            info!(
                target: "fieldsync::connector",
                applied = report.applied,
                skipped = report.skipped,
                remaining = report.remaining,
                "mutation log drained"
            );
            self.bus.publish(topics::TOPIC_MUTATIONS_DRAINED, &report);
        }
        Ok(report)
    }

    async fn deliver(&self, m: &MutationRecord) -> Result<Delivery, DrainError> {
        let target = MutationTarget::resolve(&m.table);
        if self.is_skipped(&target) {
            debug!(target: "fieldsync::connector", seq = m.seq, table = %m.table, "local-only mutation skipped");
            return Ok(Delivery::Skipped);
        }
        let table = target.name();
        let failed = |source: RemoteError| {
            if source.is_transient() {
                debug!(target: "fieldsync::connector", seq = m.seq, table, %source, "remote unavailable; batch left pending");
            } else {
                warn!(
                    target: "fieldsync::connector",
                    seq = m.seq,
                    table,
                    op = m.op.as_str(),
                    entity_id = %m.entity_id,
                    %source,
                    "remote rejected mutation; batch left pending"
                );
            }
            DrainError::Remote {
                seq: m.seq,
                table: table.to_string(),
                source,
            }
        };

        if m.op == MutationOp::Delete {
            self.remote
                .delete(table, &m.entity_id)
                .await
                .map_err(failed)?;
            return Ok(Delivery::Applied);
        }

        let Some(payload) = self.complete_payload(m, &target).await? else {
            return Ok(Delivery::Skipped);
        };
        let mut body = match &target {
            MutationTarget::Known(t) => match remote_shape(*t) {
                Some(shape) => shape_payload(&shape, &payload),
                None => return Ok(Delivery::Skipped),
            },
            MutationTarget::Unknown(_) => shape_payload(&UNKNOWN_TABLE_SHAPE, &payload),
        };

        match m.op {
            MutationOp::Upsert => {
                body.entry("id")
                    .or_insert_with(|| Value::String(m.entity_id.clone()));
                self.remote.upsert(table, &body).await.map_err(failed)?;
            }
            MutationOp::Update => {
                body.remove("id");
                self.remote
                    .update(table, &m.entity_id, &body)
                    .await
                    .map_err(failed)?;
            }
            MutationOp::Delete => {}
        }
        Ok(Delivery::Applied)
    }

    /// The logged payload, or the full local row when the producer logged an
    /// empty one. `None` means there is nothing to send.
    async fn complete_payload(
        &self,
        m: &MutationRecord,
        target: &MutationTarget,
    ) -> Result<Option<Record>, DrainError> {
        if !m.payload.is_empty() {
            return Ok(Some(m.payload.clone()));
        }
        match target {
            MutationTarget::Known(t) => {
                let t = *t;
                let id = m.entity_id.clone();
                let row = self.store.call(move |s| s.rows().get(t, &id)).await?;
                if row.is_none() {
                    debug!(target: "fieldsync::connector", seq = m.seq, table = %t, entity_id = %m.entity_id, "row gone before upload; skipped");
                }
                Ok(row)
            }
            MutationTarget::Unknown(name) => {
                warn!(target: "fieldsync::connector", seq = m.seq, table = %name, "empty payload for unknown table; skipped");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl SweepJob for MutationUploadConnector {
    fn name(&self) -> &'static str {
        "mutations.drain"
    }

    async fn run_once(&self) {
        // remote failures are logged where they happen
        if let Err(err @ DrainError::Local(_)) = self.drain().await {
            warn!(target: "fieldsync::connector", %err, "drain failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteCall};
    use fieldsync_kernel::Table;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (tempfile::TempDir, LocalStore, MemoryRemote, MutationUploadConnector) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let remote = MemoryRemote::new();
        let conn = MutationUploadConnector::new(
            store.clone(),
            Arc::new(remote.clone()),
            Bus::default(),
            &SyncConfig::default(),
        );
        (dir, store, remote, conn)
    }

    #[tokio::test]
    async fn upsert_is_coerced_and_acknowledged() {
        let (_d, store, remote, conn) = setup();
        store
            .with(|s| {
                s.rows().upsert(
                    Table::Issues,
                    &rec(json!({"id": "i1", "area_id": "a1", "title": "Leak", "is_blocking": true, "local_sort": 3})),
                )
            })
            .unwrap();

        let report = conn.drain().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 0);
        let row = remote.row("issues", "i1").unwrap();
        assert_eq!(row["is_blocking"], json!(1));
        assert!(!row.contains_key("local_sort"));
    }

    #[tokio::test]
    async fn failure_leaves_whole_batch_pending() {
        let (_d, store, remote, conn) = setup();
        store
            .with(|s| {
                s.rows()
                    .upsert(Table::Jobs, &rec(json!({"id": "j1", "name": "Tower"})))?;
                s.rows()
                    .upsert(Table::Jobs, &rec(json!({"id": "j2", "name": "Annex"})))
            })
            .unwrap();
        remote.reject_table("jobs");

        let err = conn.drain().await.unwrap_err();
        match &err {
            DrainError::Remote { seq, table, .. } => {
                assert_eq!(*seq, 1);
                assert_eq!(table, "jobs");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_transient());
        assert_eq!(store.with(|s| s.mutations().len()).unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_update_sends_full_row() {
        let (_d, store, remote, conn) = setup();
        store
            .with(|s| {
                s.rows().apply_remote(
                    Table::ChecklistItems,
                    &[rec(json!({"id": "c1", "area_id": "a1", "label": "Paint", "status": "COMPLETED", "requires_photo": true}))],
                )?;
                s.rows().touch(Table::ChecklistItems, "c1")
            })
            .unwrap();

        conn.drain().await.unwrap();
        let calls = remote.calls();
        let RemoteCall::Update { patch, id, .. } = &calls[0] else {
            panic!("expected update, got {calls:?}");
        };
        assert_eq!(id, "c1");
        assert_eq!(patch["label"], "Paint");
        assert_eq!(patch["requires_photo"], json!(1));
        assert!(!patch.contains_key("id"));
    }

    #[tokio::test]
    async fn empty_payload_without_row_is_skipped() {
        let (_d, store, remote, conn) = setup();
        store
            .with(|s| {
                s.rows().touch(Table::Issues, "deleted-already")?;
                s.mutations()
                    .append("signatures", MutationOp::Update, "sig-1", &Record::new())
            })
            .unwrap();

        let report = conn.drain().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.remaining, 0);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_tables_are_forwarded_without_local_fields() {
        let (_d, store, remote, conn) = setup();
        store
            .with(|s| {
                s.mutations().append(
                    "signatures",
                    MutationOp::Upsert,
                    "sig-1",
                    &rec(json!({"signed": true, "local_sort": 1})),
                )
            })
            .unwrap();

        conn.drain().await.unwrap();
        let row = remote.row("signatures", "sig-1").unwrap();
        assert_eq!(row["signed"], json!(true));
        assert!(!row.contains_key("local_sort"));
    }

    #[tokio::test]
    async fn batches_continue_until_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let remote = MemoryRemote::new();
        let sync = SyncConfig {
            batch_limit: 2,
            ..SyncConfig::default()
        };
        let conn = MutationUploadConnector::new(
            store.clone(),
            Arc::new(remote.clone()),
            Bus::default(),
            &sync,
        );
        store
            .with(|s| {
                for i in 0..5 {
                    s.rows()
                        .upsert(Table::TimeLogs, &rec(json!({"id": format!("t{i}"), "job_id": "j1", "minutes": i})))?;
                }
                Ok(())
            })
            .unwrap();

        let report = conn.drain().await.unwrap();
        assert_eq!(report.applied, 5);
        assert_eq!(remote.rows("time_logs").len(), 5);
    }

    #[tokio::test]
    async fn delete_maps_to_remote_delete() {
        let (_d, store, remote, conn) = setup();
        remote.seed("issues", rec(json!({"id": "i9"})));
        store
            .with(|s| {
                s.rows()
                    .apply_remote(Table::Issues, &[rec(json!({"id": "i9", "area_id": "a1"}))])?;
                s.rows().delete(Table::Issues, "i9")
            })
            .unwrap();

        conn.drain().await.unwrap();
        assert!(remote.row("issues", "i9").is_none());
    }
}
