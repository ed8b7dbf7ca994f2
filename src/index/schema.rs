use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{debug, info, warn};

/// SQLite schema version. Any other stored version is rebuilt from scratch.
pub const SCHEMA_VERSION: i32 = 2;

/// Outcome of opening an index database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Fresh database, tables just created.
    Created,
    /// Existing tables at the current version.
    Current,
    /// Stored version did not match; all index data was dropped.
    Rebuilt { from_version: i32 },
}

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<SchemaStatus> {
    let stored = stored_version(conn)?;
    debug!("Stored schema version: {:?}", stored);

    match stored {
        Some(version) if version == SCHEMA_VERSION => Ok(SchemaStatus::Current),
        Some(version) => {
            warn!(
                "Index schema v{} does not match v{}, rebuilding",
                version, SCHEMA_VERSION
            );
            drop_schema(conn)?;
            create_schema(conn)?;
            Ok(SchemaStatus::Rebuilt {
                from_version: version,
            })
        }
        None => {
            info!("Initializing codeatlas schema v{}", SCHEMA_VERSION);
            create_schema(conn)?;
            Ok(SchemaStatus::Created)
        }
    }
}

fn stored_version(conn: &Connection) -> Result<Option<i32>> {
    let has_meta: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'index_meta'",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        // Tables from an unversioned layout count as a mismatch.
        let has_symbols: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'symbols'",
            [],
            |row| row.get(0),
        )?;
        return Ok(if has_symbols { Some(0) } else { None });
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(Some(value.and_then(|v| v.parse().ok()).unwrap_or(0)))
}

fn create_schema(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    // Symbols. `seq` is the FTS content rowid; it is explicit so VACUUM keeps it.
    tx.execute(
        "CREATE TABLE IF NOT EXISTS symbols (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            qualified_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            language TEXT NOT NULL,
            signature TEXT NOT NULL,
            modifiers TEXT NOT NULL,
            decorators TEXT NOT NULL,
            parent_id TEXT,
            doc_summary TEXT,
            method_count INTEGER NOT NULL DEFAULT 0,
            exported INTEGER NOT NULL DEFAULT 0,
            is_test INTEGER NOT NULL DEFAULT 0,
            tier_compact TEXT NOT NULL,
            tier_summary TEXT NOT NULL,
            tier_full TEXT NOT NULL,
            compact_tokens INTEGER NOT NULL,
            summary_tokens INTEGER NOT NULL,
            full_tokens INTEGER NOT NULL
        )",
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_symbols_name_nocase ON symbols(name COLLATE NOCASE)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_path, start_line)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_symbols_kind ON symbols(kind)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_symbols_exported ON symbols(exported)",
        [],
    )?;

    // Relationships. `to_id` is only set for targets resolved in the same file.
    tx.execute(
        "CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_id TEXT NOT NULL,
            to_id TEXT,
            to_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line INTEGER NOT NULL,
            FOREIGN KEY (from_id) REFERENCES symbols(id) ON DELETE CASCADE
        )",
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_id, kind)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_id, kind)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_to_name ON relationships(to_name, kind)",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_relationships_file ON relationships(file_path, kind)",
        [],
    )?;

    // Full-text search over name, doc summary and qualified name
    tx.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS symbols_fts USING fts5(
            name,
            doc_summary,
            qualified_name,
            content='symbols',
            content_rowid='seq'
        )",
        [],
    )?;

    tx.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_insert AFTER INSERT ON symbols
         BEGIN
             INSERT INTO symbols_fts(rowid, name, doc_summary, qualified_name)
             VALUES (new.seq, new.name, new.doc_summary, new.qualified_name);
         END",
        [],
    )?;

    tx.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_delete AFTER DELETE ON symbols
         BEGIN
             INSERT INTO symbols_fts(symbols_fts, rowid, name, doc_summary, qualified_name)
             VALUES ('delete', old.seq, old.name, old.doc_summary, old.qualified_name);
         END",
        [],
    )?;

    tx.execute(
        "CREATE TRIGGER IF NOT EXISTS symbols_fts_update AFTER UPDATE ON symbols
         BEGIN
             INSERT INTO symbols_fts(symbols_fts, rowid, name, doc_summary, qualified_name)
             VALUES ('delete', old.seq, old.name, old.doc_summary, old.qualified_name);
             INSERT INTO symbols_fts(rowid, name, doc_summary, qualified_name)
             VALUES (new.seq, new.name, new.doc_summary, new.qualified_name);
         END",
        [],
    )?;

    // Files table - one row per successfully indexed file
    tx.execute(
        "CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            language TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            last_indexed_at INTEGER NOT NULL
        )",
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_files_language ON files(language)",
        [],
    )?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    tx.execute(
        "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('generation', '0')",
        [],
    )?;

    tx.commit()?;
    info!("Schema v{} created", SCHEMA_VERSION);
    Ok(())
}

/// Drop all tables (for rebuilding)
pub fn drop_schema(conn: &Connection) -> Result<()> {
    info!("Dropping all schema tables");

    conn.execute_batch(
        "DROP TRIGGER IF EXISTS symbols_fts_update;
         DROP TRIGGER IF EXISTS symbols_fts_delete;
         DROP TRIGGER IF EXISTS symbols_fts_insert;
         DROP TABLE IF EXISTS symbols_fts;
         DROP TABLE IF EXISTS relationships;
         DROP TABLE IF EXISTS symbols;
         DROP TABLE IF EXISTS files;
         DROP TABLE IF EXISTS index_meta;
         DROP TABLE IF EXISTS index_stats;
         DROP TABLE IF EXISTS schema_version;",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(init_schema(&conn).unwrap(), SchemaStatus::Created);

        let tables = table_names(&conn);
        assert!(tables.contains(&"symbols".to_string()));
        assert!(tables.contains(&"relationships".to_string()));
        assert!(tables.contains(&"files".to_string()));
        assert!(tables.contains(&"index_meta".to_string()));
    }

    #[test]
    fn test_idempotent_init() {
        let conn = Connection::open_in_memory().unwrap();

        assert_eq!(init_schema(&conn).unwrap(), SchemaStatus::Created);
        assert_eq!(init_schema(&conn).unwrap(), SchemaStatus::Current);
    }

    #[test]
    fn test_version_mismatch_rebuilds() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO files (path, content_hash, language, size, mtime, line_count, last_indexed_at)
             VALUES ('a.py', 'h', 'python', 1, 0, 1, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE index_meta SET value = '1' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();

        assert_eq!(
            init_schema(&conn).unwrap(),
            SchemaStatus::Rebuilt { from_version: 1 }
        );
        let files: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(files, 0);
    }

    #[test]
    fn test_legacy_layout_is_rebuilt() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE symbols (id TEXT PRIMARY KEY)", [])
            .unwrap();

        assert_eq!(
            init_schema(&conn).unwrap(),
            SchemaStatus::Rebuilt { from_version: 0 }
        );
        assert!(table_names(&conn).contains(&"index_meta".to_string()));
    }

    #[test]
    fn test_drop_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        drop_schema(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 0);
    }
}
