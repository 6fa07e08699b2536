use anyhow::Result;
use rusqlite::Connection;

/// Every table the local store knows about.
///
/// Mirrored tables have a remote counterpart keyed by the same `id`; local-only
/// tables exist purely to stage work on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Jobs,
    Floors,
    Units,
    Areas,
    ChecklistItems,
    Photos,
    Issues,
    TimeLogs,
    PendingAssets,
    ProvisionalChecklistItems,
    MutationLog,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Jobs,
        Table::Floors,
        Table::Units,
        Table::Areas,
        Table::ChecklistItems,
        Table::Photos,
        Table::Issues,
        Table::TimeLogs,
        Table::PendingAssets,
        Table::ProvisionalChecklistItems,
        Table::MutationLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Floors => "floors",
            Table::Units => "units",
            Table::Areas => "areas",
            Table::ChecklistItems => "checklist_items",
            Table::Photos => "photos",
            Table::Issues => "issues",
            Table::TimeLogs => "time_logs",
            Table::PendingAssets => "pending_assets",
            Table::ProvisionalChecklistItems => "provisional_checklist_items",
            Table::MutationLog => "mutation_log",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn is_local_only(&self) -> bool {
        matches!(
            self,
            Table::PendingAssets | Table::ProvisionalChecklistItems | Table::MutationLog
        )
    }

    /// Column whitelist used to validate dynamic row access.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Jobs => &[
                "id",
                "name",
                "address",
                "archived",
                "progress",
                "local_sort",
                "updated_at",
            ],
            Table::Floors => &["id", "job_id", "name", "progress", "local_sort", "updated_at"],
            Table::Units => &["id", "floor_id", "name", "progress", "local_sort", "updated_at"],
            Table::Areas => &["id", "unit_id", "name", "progress", "local_sort", "updated_at"],
            Table::ChecklistItems => &[
                "id",
                "area_id",
                "label",
                "position",
                "status",
                "requires_photo",
                "local_sort",
                "updated_at",
            ],
            Table::Photos => &[
                "id",
                "parent_entity_id",
                "storage_path",
                "url",
                "filename",
                "created_at",
            ],
            Table::Issues => &[
                "id",
                "area_id",
                "title",
                "description",
                "is_blocking",
                "resolved",
                "local_sort",
                "created_at",
                "updated_at",
            ],
            Table::TimeLogs => &["id", "job_id", "worker", "minutes", "billable", "logged_at"],
            Table::PendingAssets => &[
                "id",
                "parent_entity_id",
                "local_path",
                "filename",
                "status",
                "attempts",
                "last_error",
                "created_at",
                "updated_at",
            ],
            Table::ProvisionalChecklistItems => {
                &["id", "area_id", "label", "position", "status", "created_at"]
            }
            Table::MutationLog => &[
                "seq",
                "table_name",
                "op",
                "entity_id",
                "payload",
                "created_at",
            ],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL DEFAULT '',
          address TEXT,
          archived INTEGER NOT NULL DEFAULT 0,
          progress INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS floors (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          name TEXT NOT NULL DEFAULT '',
          progress INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_floors_job ON floors(job_id);

        CREATE TABLE IF NOT EXISTS units (
          id TEXT PRIMARY KEY,
          floor_id TEXT NOT NULL,
          name TEXT NOT NULL DEFAULT '',
          progress INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_units_floor ON units(floor_id);

        CREATE TABLE IF NOT EXISTS areas (
          id TEXT PRIMARY KEY,
          unit_id TEXT NOT NULL,
          name TEXT NOT NULL DEFAULT '',
          progress INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_areas_unit ON areas(unit_id);

        -- Leaf tasks: status is one of NOT_STARTED | IN_PROGRESS | COMPLETED | NA
        CREATE TABLE IF NOT EXISTS checklist_items (
          id TEXT PRIMARY KEY,
          area_id TEXT NOT NULL,
          label TEXT NOT NULL DEFAULT '',
          position INTEGER NOT NULL DEFAULT 0,
          status TEXT NOT NULL DEFAULT 'NOT_STARTED',
          requires_photo INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_checklist_area ON checklist_items(area_id);

        -- Confirmed asset metadata; id matches the pending asset that produced it
        CREATE TABLE IF NOT EXISTS photos (
          id TEXT PRIMARY KEY,
          parent_entity_id TEXT NOT NULL,
          storage_path TEXT NOT NULL,
          url TEXT NOT NULL,
          filename TEXT NOT NULL,
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_photos_parent ON photos(parent_entity_id);

        CREATE TABLE IF NOT EXISTS issues (
          id TEXT PRIMARY KEY,
          area_id TEXT NOT NULL,
          title TEXT NOT NULL DEFAULT '',
          description TEXT,
          is_blocking INTEGER NOT NULL DEFAULT 0,
          resolved INTEGER NOT NULL DEFAULT 0,
          local_sort INTEGER,
          created_at TEXT,
          updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS time_logs (
          id TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          worker TEXT,
          minutes INTEGER NOT NULL DEFAULT 0,
          billable INTEGER NOT NULL DEFAULT 1,
          logged_at TEXT
        );

        -- Local-only staging tables
        CREATE TABLE IF NOT EXISTS pending_assets (
          id TEXT PRIMARY KEY,
          parent_entity_id TEXT NOT NULL,
          local_path TEXT NOT NULL,
          filename TEXT NOT NULL,
          status TEXT NOT NULL,        -- queued | uploading | failed
          attempts INTEGER NOT NULL DEFAULT 0,
          last_error TEXT,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_assets(status);

        CREATE TABLE IF NOT EXISTS provisional_checklist_items (
          id TEXT PRIMARY KEY,
          area_id TEXT NOT NULL,
          label TEXT NOT NULL,
          position INTEGER NOT NULL,
          status TEXT NOT NULL DEFAULT 'NOT_STARTED',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_provisional_area ON provisional_checklist_items(area_id);

        CREATE TABLE IF NOT EXISTS mutation_log (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          table_name TEXT NOT NULL,
          op TEXT NOT NULL,            -- upsert | update | delete
          entity_id TEXT NOT NULL,
          payload TEXT NOT NULL,       -- JSON object, may be empty
          created_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for t in Table::ALL {
            assert_eq!(Table::parse(t.as_str()), Some(t));
        }
        assert_eq!(Table::parse("nope"), None);
    }

    #[test]
    fn every_table_has_an_identifier_column() {
        for t in Table::ALL {
            assert!(t.has_column("id") || t == Table::MutationLog, "{t}");
        }
    }

    #[test]
    fn migrate_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n as usize, Table::ALL.len());
    }
}
