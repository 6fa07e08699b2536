use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::{now_rfc3339, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Queued,
    Uploading,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Queued => "queued",
            AssetStatus::Uploading => "uploading",
            AssetStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(AssetStatus::Queued),
            "uploading" => Some(AssetStatus::Uploading),
            "failed" => Some(AssetStatus::Failed),
            _ => None,
        }
    }
}

/// A captured asset waiting for upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAsset {
    pub id: String,
    pub parent_entity_id: String,
    pub local_path: PathBuf,
    pub filename: String,
    pub status: AssetStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// Metadata of an asset whose bytes are confirmed in remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedAsset {
    pub id: String,
    pub parent_entity_id: String,
    pub storage_path: String,
    pub url: String,
    pub filename: String,
    pub created_at: String,
}

impl ConfirmedAsset {
    pub fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }

    pub fn from_record(row: &Record) -> Option<Self> {
        serde_json::from_value(Value::Object(row.clone())).ok()
    }
}

const SELECT_PENDING: &str =
    "SELECT id,parent_entity_id,local_path,filename,status,attempts,last_error,created_at FROM pending_assets";

/// Durable staging area for captured assets.
pub struct AssetQueue<'c> {
    conn: &'c Connection,
}

impl<'c> AssetQueue<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Stage an asset already written at `local_path`. The entry is committed
    /// before this returns.
    pub fn enqueue(&self, parent_entity_id: &str, local_path: &Path) -> Result<String> {
        let filename = local_path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("asset path {} has no file name", local_path.display()))?
            .to_string();
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO pending_assets(id,parent_entity_id,local_path,filename,status,attempts,created_at,updated_at) VALUES(?,?,?,?,?,0,?,?)",
            params![
                id,
                parent_entity_id,
                local_path.to_string_lossy(),
                filename,
                AssetStatus::Queued.as_str(),
                now,
                now
            ],
        )?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingAsset>> {
        let sql = format!("{} WHERE id=? LIMIT 1", SELECT_PENDING);
        let mut stmt = self.conn.prepare(&sql)?;
        let asset = stmt.query_row([id], read_pending).optional()?;
        Ok(asset)
    }

    /// Entries in any of `statuses`, oldest first.
    pub fn list_pending(&self, statuses: &[AssetStatus]) -> Result<Vec<PendingAsset>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; statuses.len()].join(",");
        let sql = format!(
            "{} WHERE status IN ({}) ORDER BY created_at ASC, rowid ASC",
            SELECT_PENDING, marks
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
            read_pending,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Move an entry to `status`; entering `uploading` counts as an attempt.
    pub fn update_status(&self, id: &str, status: AssetStatus) -> Result<bool> {
        let bump = i64::from(status == AssetStatus::Uploading);
        let n = self.conn.execute(
            "UPDATE pending_assets SET status=?, attempts=attempts+?, updated_at=? WHERE id=?",
            params![status.as_str(), bump, now_rfc3339(), id],
        )?;
        Ok(n > 0)
    }

    pub fn record_failure(&self, id: &str, reason: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE pending_assets SET status=?, last_error=?, updated_at=? WHERE id=?",
            params![AssetStatus::Failed.as_str(), reason, now_rfc3339(), id],
        )?;
        Ok(n > 0)
    }

    pub fn relocate(&self, id: &str, local_path: &Path) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE pending_assets SET local_path=?, updated_at=? WHERE id=?",
            params![local_path.to_string_lossy(), now_rfc3339(), id],
        )?;
        Ok(n > 0)
    }

    /// Retire an entry. Callers must have verified remote and local persistence.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM pending_assets WHERE id=?", [id])?;
        Ok(n > 0)
    }

    pub fn count_by_status(&self, status: AssetStatus) -> Result<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM pending_assets WHERE status=?",
            [status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn read_pending(r: &Row<'_>) -> rusqlite::Result<PendingAsset> {
    let status_s: String = r.get(4)?;
    let path_s: String = r.get(2)?;
    Ok(PendingAsset {
        id: r.get(0)?,
        parent_entity_id: r.get(1)?,
        local_path: PathBuf::from(path_s),
        filename: r.get(3)?,
        // unknown states are retried like failures
        status: AssetStatus::parse(&status_s).unwrap_or(AssetStatus::Failed),
        attempts: r.get(5)?,
        last_error: r.get(6)?,
        created_at: r.get(7)?,
    })
}
