use anyhow::{anyhow, bail, Result};
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::Value;

use crate::mutations::{MutationLog, MutationOp};
use crate::schema::Table;
use crate::values::{is_ident, json_to_sql, sql_to_json};
use crate::{now_rfc3339, Record};

/// Generic row access for mirrored entity tables.
///
/// Every write made through `upsert`, `update` and `delete` appends the matching
/// entry to the mutation log inside the same transaction, so an edit is never
/// visible locally without also being queued for upload.
///
/// Writes here never touch ancestor progress. A `checklist_items` status
/// written directly must be followed by a rollup, which the sync engine's
/// `checklist_item_changed` performs.
pub struct Rows<'c> {
    conn: &'c Connection,
}

impl<'c> Rows<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        let sql = format!("SELECT * FROM {} WHERE id=? LIMIT 1", table.as_str());
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(r) => Ok(Some(row_to_record(r, &names)?)),
            None => Ok(None),
        }
    }

    /// Rows whose `column` equals `value`, ordered by `position` when the table has one.
    pub fn list_by(&self, table: Table, column: &str, value: &str) -> Result<Vec<Record>> {
        check_column(table, column)?;
        let order = if table.has_column("position") {
            "position ASC, id ASC"
        } else {
            "rowid ASC"
        };
        let sql = format!(
            "SELECT * FROM {} WHERE {}=? ORDER BY {}",
            table.as_str(),
            column,
            order
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([value])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(row_to_record(r, &names)?);
        }
        Ok(out)
    }

    /// Insert-or-replace a full row and log it as an upsert.
    pub fn upsert(&self, table: Table, row: &Record) -> Result<()> {
        let id = record_id(row)?;
        let mut row = row.clone();
        stamp_updated(table, &mut row);
        let tx = self.conn.unchecked_transaction()?;
        write_row(&tx, table, &row)?;
        MutationLog::new(&tx).append(table.as_str(), MutationOp::Upsert, &id, &row)?;
        tx.commit()?;
        Ok(())
    }

    /// Update the given fields and log the patch. Returns false when no row matched.
    pub fn update(&self, table: Table, id: &str, patch: &Record) -> Result<bool> {
        if patch.is_empty() {
            bail!("empty patch for {} {}", table, id);
        }
        let mut patch = patch.clone();
        patch.remove("id");
        stamp_updated(table, &mut patch);
        for key in patch.keys() {
            check_column(table, key)?;
        }
        let sets: Vec<String> = patch.keys().map(|k| format!("{}=?", k)).collect();
        let sql = format!("UPDATE {} SET {} WHERE id=?", table.as_str(), sets.join(","));
        let mut args: Vec<rusqlite::types::Value> = patch.values().map(json_to_sql).collect();
        args.push(rusqlite::types::Value::Text(id.to_string()));

        let tx = self.conn.unchecked_transaction()?;
        let n = tx.execute(&sql, params_from_iter(args))?;
        if n == 0 {
            return Ok(false);
        }
        MutationLog::new(&tx).append(table.as_str(), MutationOp::Update, id, &patch)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn delete(&self, table: Table, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id=?", table.as_str());
        let tx = self.conn.unchecked_transaction()?;
        let n = tx.execute(&sql, [id])?;
        if n == 0 {
            return Ok(false);
        }
        MutationLog::new(&tx).append(table.as_str(), MutationOp::Delete, id, &Record::new())?;
        tx.commit()?;
        Ok(true)
    }

    /// Record that a row changed without capturing its data.
    pub fn touch(&self, table: Table, id: &str) -> Result<i64> {
        MutationLog::new(self.conn).append(table.as_str(), MutationOp::Update, id, &Record::new())
    }

    /// Apply rows received from the remote service without queueing them back up.
    pub fn apply_remote(&self, table: Table, rows: &[Record]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut n = 0;
        for row in rows {
            let local: Record = row
                .iter()
                .filter(|(k, _)| table.has_column(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            record_id(&local)?;
            write_row(&tx, table, &local)?;
            n += 1;
        }
        tx.commit()?;
        Ok(n)
    }
}

fn check_column(table: Table, column: &str) -> Result<()> {
    if !is_ident(column) || !table.has_column(column) {
        bail!("unknown column {:?} for table {}", column, table);
    }
    Ok(())
}

fn record_id(row: &Record) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("row is missing a string id"))
}

fn stamp_updated(table: Table, row: &mut Record) {
    if table.has_column("updated_at") && !row.contains_key("updated_at") {
        row.insert("updated_at".into(), Value::String(now_rfc3339()));
    }
}

fn write_row(conn: &Connection, table: Table, row: &Record) -> Result<()> {
    if table == Table::MutationLog {
        bail!("mutation_log cannot be written as a row");
    }
    for key in row.keys() {
        check_column(table, key)?;
    }
    let cols: Vec<&str> = row.keys().map(String::as_str).collect();
    let marks = vec!["?"; cols.len()].join(",");
    let sql = format!(
        "INSERT OR REPLACE INTO {}({}) VALUES({})",
        table.as_str(),
        cols.join(","),
        marks
    );
    conn.execute(&sql, params_from_iter(row.values().map(json_to_sql)))?;
    Ok(())
}

fn row_to_record(r: &Row<'_>, names: &[String]) -> Result<Record> {
    let mut out = Record::new();
    for (i, name) in names.iter().enumerate() {
        out.insert(name.clone(), sql_to_json(r.get_ref(i)?));
    }
    Ok(out)
}
