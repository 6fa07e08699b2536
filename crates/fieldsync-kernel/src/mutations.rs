use std::collections::HashSet;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{now_rfc3339, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Upsert,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Upsert => "upsert",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(MutationOp::Upsert),
            "update" => Some(MutationOp::Update),
            "delete" => Some(MutationOp::Delete),
            _ => None,
        }
    }
}

/// One entry of the local edit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub seq: i64,
    /// Table name as written by the producer; may be unknown to this store.
    pub table: String,
    pub op: MutationOp,
    pub entity_id: String,
    /// Empty when the producer only recorded that the row changed.
    pub payload: Record,
    pub created_at: String,
}

/// Append-only edit log drained by the upload connector in `seq` order.
pub struct MutationLog<'c> {
    conn: &'c Connection,
}

impl<'c> MutationLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn append(
        &self,
        table: &str,
        op: MutationOp,
        entity_id: &str,
        payload: &Record,
    ) -> Result<i64> {
        let payload_s = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO mutation_log(table_name,op,entity_id,payload,created_at) VALUES(?,?,?,?,?)",
            params![table, op.as_str(), entity_id, payload_s, now_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest `limit` entries, in production order.
    pub fn peek(&self, limit: i64) -> Result<Vec<MutationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq,table_name,op,entity_id,payload,created_at FROM mutation_log ORDER BY seq ASC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit.max(1)])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let seq: i64 = r.get(0)?;
            let op_s: String = r.get(2)?;
            let op = MutationOp::parse(&op_s)
                .ok_or_else(|| anyhow!("mutation {} has unknown op {:?}", seq, op_s))?;
            let payload_s: String = r.get(4)?;
            let payload = match serde_json::from_str::<serde_json::Value>(&payload_s) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => Record::new(),
            };
            out.push(MutationRecord {
                seq,
                table: r.get(1)?,
                op,
                entity_id: r.get(3)?,
                payload,
                created_at: r.get(5)?,
            });
        }
        Ok(out)
    }

    /// Drop every entry up to and including `seq`.
    pub fn acknowledge_through(&self, seq: i64) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM mutation_log WHERE seq <= ?", [seq])?;
        Ok(n)
    }

    /// Ids of `table` rows with edits still waiting in the log.
    pub fn pending_ids(&self, table: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT entity_id FROM mutation_log WHERE table_name=?")?;
        let rows = stmt.query_map([table], |r| r.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(1) FROM mutation_log", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
