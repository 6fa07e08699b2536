use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fieldsync_kernel::Record;
use serde_json::Value;

use super::{BlobStore, RemoteError, RemoteStore};

/// One observed call against [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Upsert { table: String, id: String },
    Insert { table: String, id: String },
    Update { table: String, id: String, patch: Record },
    Delete { table: String, id: String },
    Select { table: String, parent_id: String },
    Put { path: String },
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, Record>>,
    blobs: HashMap<String, (Vec<u8>, String)>,
    calls: Vec<RemoteCall>,
    offline: bool,
    fail_next: VecDeque<RemoteError>,
    rejected_tables: HashSet<String>,
}

/// In-process remote used when no service is configured, and by tests.
///
/// Supports failure injection (offline mode, one-shot errors, per-table
/// rejection) and records every call in order.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next call (of any kind) with `err`.
    pub fn fail_next(&self, err: RemoteError) {
        self.state().fail_next.push_back(err);
    }

    /// Reject every write to `table` as a permission error.
    pub fn reject_table(&self, table: &str) {
        self.state().rejected_tables.insert(table.to_string());
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.state()
            .tables
            .get(table)
            .and_then(|t| t.get(id))
            .cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(path).map(|(b, _)| b.clone())
    }

    pub fn seed(&self, table: &str, record: Record) {
        if let Some(id) = record.get("id").and_then(Value::as_str) {
            let id = id.to_string();
            self.state()
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(id, record);
        }
    }

    fn admit(state: &mut MemoryState, table: Option<&str>) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        if let Some(err) = state.fail_next.pop_front() {
            return Err(err);
        }
        if let Some(t) = table {
            if state.rejected_tables.contains(t) {
                return Err(RemoteError::Rejected {
                    status: 403,
                    message: format!("permission denied for table {}", t),
                });
            }
        }
        Ok(())
    }
}

fn record_id(record: &Record) -> Result<String, RemoteError> {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Rejected {
            status: 400,
            message: "record is missing id".into(),
        })
}

fn order_key(v: Option<&Value>) -> (f64, String) {
    match v {
        Some(Value::Number(n)) => (n.as_f64().unwrap_or_default(), String::new()),
        Some(Value::String(s)) => (0.0, s.clone()),
        _ => (0.0, String::new()),
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(&self, table: &str, record: &Record) -> Result<(), RemoteError> {
        let mut st = self.state();
        let id = record_id(record)?;
        st.calls.push(RemoteCall::Upsert {
            table: table.into(),
            id: id.clone(),
        });
        Self::admit(&mut st, Some(table))?;
        let rows = st.tables.entry(table.to_string()).or_default();
        let row = rows.entry(id).or_default();
        for (k, v) in record {
            row.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError> {
        let mut st = self.state();
        let id = record_id(record)?;
        st.calls.push(RemoteCall::Insert {
            table: table.into(),
            id: id.clone(),
        });
        Self::admit(&mut st, Some(table))?;
        let rows = st.tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(RemoteError::Conflict {
                table: table.to_string(),
            });
        }
        rows.insert(id, record.clone());
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: &Record) -> Result<(), RemoteError> {
        let mut st = self.state();
        st.calls.push(RemoteCall::Update {
            table: table.into(),
            id: id.into(),
            patch: patch.clone(),
        });
        Self::admit(&mut st, Some(table))?;
        // a filter matching nothing is not an error
        if let Some(row) = st.tables.get_mut(table).and_then(|t| t.get_mut(id)) {
            for (k, v) in patch {
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let mut st = self.state();
        st.calls.push(RemoteCall::Delete {
            table: table.into(),
            id: id.into(),
        });
        Self::admit(&mut st, Some(table))?;
        if let Some(t) = st.tables.get_mut(table) {
            t.remove(id);
        }
        Ok(())
    }

    async fn select_children(
        &self,
        table: &str,
        parent_column: &str,
        parent_id: &str,
        order_by: &str,
    ) -> Result<Vec<Record>, RemoteError> {
        let mut st = self.state();
        st.calls.push(RemoteCall::Select {
            table: table.into(),
            parent_id: parent_id.into(),
        });
        Self::admit(&mut st, None)?;
        let mut out: Vec<Record> = st
            .tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| r.get(parent_column).and_then(Value::as_str) == Some(parent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| {
            let (an, as_) = order_key(a.get(order_by));
            let (bn, bs) = order_key(b.get(order_by));
            an.total_cmp(&bn).then(as_.cmp(&bs))
        });
        Ok(out)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryRemote {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let mut st = self.state();
        st.calls.push(RemoteCall::Put { path: path.into() });
        Self::admit(&mut st, None)?;
        st.blobs
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_reports_conflicts() {
        let remote = MemoryRemote::new();
        let row = rec(json!({"id": "p1", "url": "u"}));
        remote.insert("photos", &row).await.unwrap();
        let err = remote.insert("photos", &row).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(remote.rows("photos").len(), 1);
    }

    #[tokio::test]
    async fn offline_calls_are_recorded_but_fail() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        let err = remote
            .put("photos/a/b.jpg", b"x".to_vec(), "image/jpeg")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(remote.calls().len(), 1);
        assert!(remote.blob("photos/a/b.jpg").is_none());
    }

    #[tokio::test]
    async fn select_children_orders_by_column() {
        let remote = MemoryRemote::new();
        remote.seed("checklist_items", rec(json!({"id": "b", "area_id": "a1", "position": 1})));
        remote.seed("checklist_items", rec(json!({"id": "a", "area_id": "a1", "position": 0})));
        remote.seed("checklist_items", rec(json!({"id": "c", "area_id": "a2", "position": 0})));
        let rows = remote
            .select_children("checklist_items", "area_id", "a1", "position")
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
