//! Database migrations for marketing-sync
//!
//! One table per entity kind, all sharing the same column layout, plus the
//! per-entity sync status table.

use crate::models::EntityType;

/// Columns shared by every entity table, in insert order
pub const ENTITY_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("name", "TEXT NOT NULL"),
    ("status", "TEXT"),
    ("created_at", "TEXT"),
    ("updated_at", "TEXT"),
    ("recipients", "INTEGER"),
    ("delivered", "INTEGER"),
    ("opens", "INTEGER"),
    ("clicks", "INTEGER"),
    ("views", "INTEGER"),
    ("submits", "INTEGER"),
    ("conversions", "INTEGER"),
    ("profile_count", "INTEGER"),
    ("open_rate", "REAL"),
    ("click_rate", "REAL"),
    ("conversion_rate", "REAL"),
    ("revenue", "REAL"),
    ("metadata", "TEXT NOT NULL DEFAULT '{}'"),
    ("synced_at", "TEXT NOT NULL"),
];

/// Written by every upsert but left out of change detection
pub const BOOKKEEPING_COLUMN: &str = "synced_at";

const SYNC_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_status (
    entity_type TEXT PRIMARY KEY,
    last_sync_at TEXT,
    status TEXT NOT NULL DEFAULT 'not_synced',
    record_count INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Value stored in `PRAGMA user_version` once the schema is applied
pub const SCHEMA_VERSION: i32 = 1;

/// Column names of the entity tables, comma separated
pub fn column_list() -> String {
    ENTITY_COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQL creating one table per entity type plus the sync status table
pub fn create_schema() -> String {
    let columns = ENTITY_COLUMNS
        .iter()
        .map(|(name, decl)| format!("    {} {}", name, decl))
        .collect::<Vec<_>>()
        .join(",\n");

    let mut sql = String::new();
    for entity in EntityType::ALL {
        let table = entity.table_name();
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n{columns}\n);\n\
             CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at);\n"
        ));
    }
    sql.push_str(SYNC_STATUS_TABLE);
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_every_entity() {
        let sql = create_schema();
        for entity in EntityType::ALL {
            assert!(sql.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", entity.table_name())));
        }
        assert!(sql.contains("synced_at TEXT NOT NULL\n);"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS sync_status"));
        assert!(column_list().starts_with("id, name, status"));
    }
}
