use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_rfc3339;
use crate::progress::LeafStatus;

/// Prefix marking client-generated placeholder ids.
pub const PROVISIONAL_PREFIX: &str = "tmp-";

pub fn new_provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4())
}

pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// A checklist item rendered before the remote service has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionalItem {
    pub id: String,
    pub area_id: String,
    pub label: String,
    pub position: i64,
    pub status: LeafStatus,
}

/// Local-only holding area for provisional checklist items and the edits made
/// against them. Nothing here is ever logged for upload.
pub struct ProvisionalChecklist<'c> {
    conn: &'c Connection,
}

impl<'c> ProvisionalChecklist<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn list(&self, area_id: &str) -> Result<Vec<ProvisionalItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id,area_id,label,position,status FROM provisional_checklist_items WHERE area_id=? ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([area_id], |r| {
            let status_s: String = r.get(4)?;
            Ok(ProvisionalItem {
                id: r.get(0)?,
                area_id: r.get(1)?,
                label: r.get(2)?,
                position: r.get(3)?,
                status: LeafStatus::parse(&status_s).unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn insert_all(&self, items: &[ProvisionalItem]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_rfc3339();
        for item in items {
            tx.execute(
                "INSERT OR REPLACE INTO provisional_checklist_items(id,area_id,label,position,status,created_at) VALUES(?,?,?,?,?,?)",
                params![
                    item.id,
                    item.area_id,
                    item.label,
                    item.position,
                    item.status.as_str(),
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: LeafStatus) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE provisional_checklist_items SET status=? WHERE id=?",
            params![status.as_str(), id],
        )?;
        Ok(n > 0)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM provisional_checklist_items WHERE id=?", [id])?;
        Ok(n > 0)
    }
}
