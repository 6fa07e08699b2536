use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::schema::Table;

/// State of a leaf task (checklist item).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeafStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Na,
}

impl LeafStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafStatus::NotStarted => "NOT_STARTED",
            LeafStatus::InProgress => "IN_PROGRESS",
            LeafStatus::Completed => "COMPLETED",
            LeafStatus::Na => "NA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOT_STARTED" => Some(LeafStatus::NotStarted),
            "IN_PROGRESS" => Some(LeafStatus::InProgress),
            "COMPLETED" => Some(LeafStatus::Completed),
            "NA" => Some(LeafStatus::Na),
            _ => None,
        }
    }
}

/// Non-leaf levels of the job hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Area,
    Unit,
    Floor,
    Job,
}

impl Level {
    pub fn table(&self) -> Table {
        match self {
            Level::Area => Table::Areas,
            Level::Unit => Table::Units,
            Level::Floor => Table::Floors,
            Level::Job => Table::Jobs,
        }
    }
}

/// Completed vs. eligible (non-NA) leaf counts of one area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaTally {
    pub area_id: String,
    pub completed: i64,
    pub eligible: i64,
}

const TALLY_COLUMNS: &str = "a.id,
     COALESCE(SUM(CASE WHEN c.status='COMPLETED' THEN 1 ELSE 0 END),0),
     COALESCE(SUM(CASE WHEN c.id IS NOT NULL AND c.status<>'NA' THEN 1 ELSE 0 END),0)";

/// Read-side view of the Job → Floor → Unit → Area → ChecklistItem tree.
pub struct ProgressTree<'c> {
    conn: &'c Connection,
}

impl<'c> ProgressTree<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn parent_of(&self, sql: &str, id: &str) -> Result<Option<String>> {
        let parent = self
            .conn
            .query_row(sql, [id], |r| r.get::<_, String>(0))
            .optional()?;
        Ok(parent)
    }

    pub fn area_of_item(&self, item_id: &str) -> Result<Option<String>> {
        self.parent_of("SELECT area_id FROM checklist_items WHERE id=?", item_id)
    }

    pub fn unit_of_area(&self, area_id: &str) -> Result<Option<String>> {
        self.parent_of("SELECT unit_id FROM areas WHERE id=?", area_id)
    }

    pub fn floor_of_unit(&self, unit_id: &str) -> Result<Option<String>> {
        self.parent_of("SELECT floor_id FROM units WHERE id=?", unit_id)
    }

    pub fn job_of_floor(&self, floor_id: &str) -> Result<Option<String>> {
        self.parent_of("SELECT job_id FROM floors WHERE id=?", floor_id)
    }

    pub fn tally_area(&self, area_id: &str) -> Result<AreaTally> {
        let sql = format!(
            "SELECT {TALLY_COLUMNS} FROM areas a LEFT JOIN checklist_items c ON c.area_id=a.id WHERE a.id=? GROUP BY a.id"
        );
        let tally = self
            .conn
            .query_row(&sql, [area_id], read_tally)
            .optional()?;
        // an area with no row yet still owns whatever items reference it
        match tally {
            Some(t) => Ok(t),
            None => {
                let (completed, eligible) = self.conn.query_row(
                    "SELECT COALESCE(SUM(CASE WHEN status='COMPLETED' THEN 1 ELSE 0 END),0),
                            COALESCE(SUM(CASE WHEN status<>'NA' THEN 1 ELSE 0 END),0)
                     FROM checklist_items WHERE area_id=?",
                    [area_id],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )?;
                Ok(AreaTally {
                    area_id: area_id.to_string(),
                    completed,
                    eligible,
                })
            }
        }
    }

    pub fn tallies_in_unit(&self, unit_id: &str) -> Result<Vec<AreaTally>> {
        let sql = format!(
            "SELECT {TALLY_COLUMNS} FROM areas a LEFT JOIN checklist_items c ON c.area_id=a.id WHERE a.unit_id=? GROUP BY a.id ORDER BY a.id"
        );
        self.collect_tallies(&sql, unit_id)
    }

    /// Every area under the floor, across all of its units.
    pub fn tallies_in_floor(&self, floor_id: &str) -> Result<Vec<AreaTally>> {
        let sql = format!(
            "SELECT {TALLY_COLUMNS} FROM areas a JOIN units u ON u.id=a.unit_id LEFT JOIN checklist_items c ON c.area_id=a.id WHERE u.floor_id=? GROUP BY a.id ORDER BY a.id"
        );
        self.collect_tallies(&sql, floor_id)
    }

    fn collect_tallies(&self, sql: &str, id: &str) -> Result<Vec<AreaTally>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([id], read_tally)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn child_ids(&self, sql: &str, id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn floors_of_job(&self, job_id: &str) -> Result<Vec<String>> {
        self.child_ids("SELECT id FROM floors WHERE job_id=? ORDER BY id", job_id)
    }

    pub fn units_of_floor(&self, floor_id: &str) -> Result<Vec<String>> {
        self.child_ids("SELECT id FROM units WHERE floor_id=? ORDER BY id", floor_id)
    }

    pub fn areas_of_unit(&self, unit_id: &str) -> Result<Vec<String>> {
        self.child_ids("SELECT id FROM areas WHERE unit_id=? ORDER BY id", unit_id)
    }

    pub fn stored_progress(&self, level: Level, id: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT progress FROM {} WHERE id=?", level.table().as_str());
        let v = self
            .conn
            .query_row(&sql, [id], |r| r.get::<_, i64>(0))
            .optional()?;
        Ok(v)
    }
}

fn read_tally(r: &rusqlite::Row<'_>) -> rusqlite::Result<AreaTally> {
    Ok(AreaTally {
        area_id: r.get(0)?,
        completed: r.get(1)?,
        eligible: r.get(2)?,
    })
}
