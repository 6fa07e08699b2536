//! Checklist rendering before the remote service confirms an area's items, and
//! the merge of edits made in the meantime.
//!
//! Provisional items are paired with authoritative ones by position. This
//! holds as long as the template order the device used matches the order the
//! remote items were created in. Template items get ids derived from the area
//! and position, so an interrupted creation is finished by the next reconcile
//! instead of duplicated.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use fieldsync_events::Bus;
use fieldsync_kernel::{
    is_provisional_id, new_provisional_id, LeafStatus, LocalStore, ProvisionalItem, Record, Table,
};
use fieldsync_topics as topics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::progress::{ProgressAggregator, Rollup};
use crate::remote::RemoteStore;
use crate::tables::{remote_shape, shape_payload};

const CHECKLIST_TABLE: &str = "checklist_items";

/// Remote id of the template item at `position` in `area_id`.
pub fn template_item_id(area_id: &str, position: usize) -> String {
    let name = format!("fieldsync:checklist:{}:{}", area_id, position);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn position_of(row: &Record) -> Option<i64> {
    row.get("position").and_then(Value::as_i64)
}

/// One entry of the checklist an area starts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateItem {
    pub label: String,
    #[serde(default)]
    pub requires_photo: bool,
}

impl TemplateItem {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            requires_photo: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewItem {
    pub id: String,
    pub label: String,
    pub position: i64,
    pub status: LeafStatus,
}

impl ViewItem {
    pub fn is_provisional(&self) -> bool {
        is_provisional_id(&self.id)
    }

    fn from_record(row: &Record) -> Option<Self> {
        Some(Self {
            id: row.get("id")?.as_str()?.to_string(),
            label: row
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            position: row.get("position").and_then(Value::as_i64).unwrap_or(0),
            status: row
                .get("status")
                .and_then(Value::as_str)
                .and_then(LeafStatus::parse)
                .unwrap_or_default(),
        })
    }
}

impl From<ProvisionalItem> for ViewItem {
    fn from(p: ProvisionalItem) -> Self {
        Self {
            id: p.id,
            label: p.label,
            position: p.position,
            status: p.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistView {
    pub area_id: String,
    /// True while the items are local placeholders.
    pub provisional: bool,
    pub items: Vec<ViewItem>,
}

/// Result of a status edit made from a rendered view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Stored on the placeholder; merged later by [`OptimisticReconciler::reconcile`].
    Provisional,
    Confirmed(Rollup),
    NotFound,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Items created remotely from the template.
    pub created: usize,
    /// Authoritative items now held locally for the area.
    pub confirmed: usize,
    /// Provisional edits carried over to their authoritative item.
    pub merged: usize,
    /// Merged edits whose immediate remote update failed; the mutation log
    /// still carries them.
    pub update_failures: usize,
}

#[derive(Clone)]
pub struct OptimisticReconciler {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    progress: ProgressAggregator,
    bus: Bus,
}

impl OptimisticReconciler {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        progress: ProgressAggregator,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            remote,
            progress,
            bus,
        }
    }

    /// Confirmed items when present, else the area's placeholders, creating
    /// them from `template` on first render.
    pub async fn render(&self, area_id: &str, template: &[TemplateItem]) -> Result<ChecklistView> {
        let area = area_id.to_string();
        let template = template.to_vec();
        self.store
            .call(move |s| {
                let confirmed = s.rows().list_by(Table::ChecklistItems, "area_id", &area)?;
                if !confirmed.is_empty() {
                    return Ok(ChecklistView {
                        area_id: area,
                        provisional: false,
                        items: confirmed.iter().filter_map(ViewItem::from_record).collect(),
                    });
                }
                let mut placeholders = s.provisional().list(&area)?;
                if placeholders.is_empty() && !template.is_empty() {
                    placeholders = template
                        .iter()
                        .enumerate()
                        .map(|(i, t)| ProvisionalItem {
                            id: new_provisional_id(),
                            area_id: area.clone(),
                            label: t.label.clone(),
                            position: i as i64,
                            status: LeafStatus::NotStarted,
                        })
                        .collect();
                    s.provisional().insert_all(&placeholders)?;
                }
                Ok(ChecklistView {
                    area_id: area,
                    provisional: true,
                    items: placeholders.into_iter().map(ViewItem::from).collect(),
                })
            })
            .await
    }

    /// Apply a status edit to whichever kind of item `item_id` names.
    pub async fn set_status(&self, item_id: &str, status: LeafStatus) -> Result<StatusChange> {
        let id = item_id.to_string();
        if is_provisional_id(item_id) {
            let found = self
                .store
                .call(move |s| s.provisional().set_status(&id, status))
                .await?;
            return Ok(if found {
                StatusChange::Provisional
            } else {
                StatusChange::NotFound
            });
        }
        let found = self
            .store
            .call(move |s| s.rows().update(Table::ChecklistItems, &id, &status_patch(status)))
            .await?;
        if !found {
            return Ok(StatusChange::NotFound);
        }
        let rollup = self.progress.on_leaf_changed(item_id).await?;
        Ok(StatusChange::Confirmed(rollup))
    }

    /// Replace an area's placeholders with authoritative items, carrying over
    /// any status set on a placeholder.
    ///
    /// Template positions missing remotely are created first. Local items
    /// with edits still waiting in the mutation log keep their local state.
    pub async fn reconcile(&self, area_id: &str, template: &[TemplateItem]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut remote_items = self.fetch(area_id).await?;
        let present: HashSet<i64> = remote_items.iter().filter_map(position_of).collect();
        let missing: Vec<usize> = (0..template.len())
            .filter(|i| !present.contains(&(*i as i64)))
            .collect();
        if !missing.is_empty() {
            report.created = self.create_from_template(area_id, template, &missing).await?;
            remote_items = self.fetch(area_id).await?;
        }

        let area = area_id.to_string();
        let placeholders = self.store.call(move |s| s.provisional().list(&area)).await?;

        let mut paired = Vec::new();
        let mut merges = Vec::new();
        for placeholder in &placeholders {
            let Some(real) = remote_items
                .iter_mut()
                .find(|r| position_of(r) == Some(placeholder.position))
            else {
                continue;
            };
            let Some(real_id) = real.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            paired.push(placeholder.id.clone());
            if placeholder.status == LeafStatus::NotStarted {
                continue;
            }
            real.insert("status".into(), json!(placeholder.status.as_str()));
            merges.push((real_id, placeholder.status));
        }
        report.confirmed = remote_items.len();
        report.merged = merges.len();
        if paired.len() < placeholders.len() {
            warn!(
                target: "fieldsync::reconcile",
                area_id,
                unpaired = placeholders.len() - paired.len(),
                "placeholders without a remote item kept"
            );
        }

        let authoritative = remote_items;
        let local_merges = merges.clone();
        self.store
            .call(move |s| {
                let pending = s.mutations().pending_ids(CHECKLIST_TABLE)?;
                let incoming: Vec<Record> = authoritative
                    .into_iter()
                    .filter(|r| {
                        r.get("id")
                            .and_then(Value::as_str)
                            .map_or(true, |id| !pending.contains(id))
                    })
                    .collect();
                s.rows().apply_remote(Table::ChecklistItems, &incoming)?;
                for (id, status) in &local_merges {
                    s.rows()
                        .update(Table::ChecklistItems, id, &status_patch(*status))?;
                }
                for id in &paired {
                    s.provisional().remove(id)?;
                }
                Ok(())
            })
            .await?;

        for (real_id, status) in &merges {
            if let Err(err) = self
                .remote
                .update(CHECKLIST_TABLE, real_id, &status_patch(*status))
                .await
            {
                debug!(target: "fieldsync::reconcile", item_id = %real_id, %err, "merged status update deferred to connector");
                report.update_failures += 1;
            }
        }

        self.progress.recompute_area(area_id).await?;
        info!(
            target: "fieldsync::reconcile",
            area_id,
            created = report.created,
            merged = report.merged,
            "checklist reconciled"
        );
        self.bus.publish(
            topics::TOPIC_CHECKLIST_RECONCILED,
            &json!({"area_id": area_id, "report": report}),
        );
        Ok(report)
    }

    async fn fetch(&self, area_id: &str) -> Result<Vec<Record>> {
        self.remote
            .select_children(CHECKLIST_TABLE, "area_id", area_id, "position")
            .await
            .with_context(|| format!("fetch checklist for area {}", area_id))
    }

    /// Create the template entries at `positions`, in order.
    async fn create_from_template(
        &self,
        area_id: &str,
        template: &[TemplateItem],
        positions: &[usize],
    ) -> Result<usize> {
        let mut created = 0;
        for &i in positions {
            let Some(entry) = template.get(i) else {
                continue;
            };
            let mut item = Record::new();
            item.insert("id".into(), json!(template_item_id(area_id, i)));
            item.insert("area_id".into(), json!(area_id));
            item.insert("label".into(), json!(entry.label));
            item.insert("position".into(), json!(i));
            item.insert("status".into(), json!(LeafStatus::NotStarted.as_str()));
            item.insert("requires_photo".into(), json!(entry.requires_photo));
            let body = match remote_shape(Table::ChecklistItems) {
                Some(shape) => shape_payload(&shape, &item),
                None => item,
            };
            if let Err(err) = self.remote.upsert(CHECKLIST_TABLE, &body).await {
                warn!(target: "fieldsync::reconcile", area_id, position = i, %err, "could not create checklist item");
                return Err(err).context("create checklist items from template");
            }
            created += 1;
        }
        Ok(created)
    }
}

fn status_patch(status: LeafStatus) -> Record {
    let mut patch = Record::new();
    patch.insert("status".into(), json!(status.as_str()));
    patch
}
