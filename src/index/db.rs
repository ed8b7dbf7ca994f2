use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::schema::{init_schema, SchemaStatus, SCHEMA_VERSION};
use super::{
    Direction, FileRecord, Modifier, Relationship, RelationshipKind, Signature, Symbol,
    SymbolKind, Tiers,
};
use crate::error::{StoreError, StoreResult};

/// Type alias for connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const SYMBOL_COLUMNS: &str = "s.id, s.kind, s.name, s.qualified_name, s.file_path, \
     s.start_line, s.end_line, s.language, s.signature, s.modifiers, s.decorators, \
     s.parent_id, s.doc_summary, s.method_count, s.tier_compact, s.tier_summary, \
     s.tier_full, s.compact_tokens, s.summary_tokens, s.full_tokens";

/// Deterministic tie-break applied after every relevance ordering.
const TIE_BREAK: &str = "length(s.qualified_name), s.file_path, s.start_line, s.id";

/// One page of a ranked listing plus the size of the full result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// A caller together with the edge that points at the target.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub caller: Symbol,
    pub edge: Relationship,
}

/// Persistent symbol index backed by SQLite.
#[derive(Clone)]
pub struct IndexStore {
    pool: ConnectionPool,
    db_path: PathBuf,
    schema_status: SchemaStatus,
}

impl IndexStore {
    /// Create or open a database
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        info!("Opening index at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn: &mut Connection| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let schema_status = {
            let conn = pool.get()?;
            init_schema(&conn)?
        };

        Ok(Self {
            pool,
            db_path,
            schema_status,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn schema_status(&self) -> SchemaStatus {
        self.schema_status
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Replace everything known about one file in a single transaction.
    ///
    /// Readers see either the previous symbol set or the new one.
    pub fn upsert_file(
        &self,
        record: &FileRecord,
        symbols: &[Symbol],
        relationships: &[Relationship],
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        debug!(
            "Upserting {} ({} symbols, {} relationships)",
            record.path,
            symbols.len(),
            relationships.len()
        );

        tx.execute(
            "DELETE FROM relationships WHERE file_path = ?1",
            [&record.path],
        )?;
        tx.execute("DELETE FROM symbols WHERE file_path = ?1", [&record.path])?;

        tx.execute(
            "INSERT INTO files (path, content_hash, language, size, mtime, line_count, last_indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                language = excluded.language,
                size = excluded.size,
                mtime = excluded.mtime,
                line_count = excluded.line_count,
                last_indexed_at = excluded.last_indexed_at",
            params![
                record.path,
                record.content_hash,
                record.language,
                record.size as i64,
                record.mtime,
                record.line_count,
                record.last_indexed_at,
            ],
        )?;

        {
            let mut insert_symbol = tx.prepare_cached(
                "INSERT INTO symbols (
                    id, kind, name, qualified_name, file_path, start_line, end_line, language,
                    signature, modifiers, decorators, parent_id, doc_summary, method_count,
                    exported, is_test, tier_compact, tier_summary, tier_full,
                    compact_tokens, summary_tokens, full_tokens
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            )?;

            for symbol in symbols {
                insert_symbol.execute(params![
                    symbol.id,
                    symbol.kind.as_str(),
                    symbol.name,
                    symbol.qualified_name,
                    symbol.file_path,
                    symbol.start_line,
                    symbol.end_line,
                    symbol.language,
                    serde_json::to_string(&symbol.signature)?,
                    serde_json::to_string(&symbol.modifiers)?,
                    serde_json::to_string(&symbol.decorators)?,
                    symbol.parent_id,
                    symbol.doc_summary,
                    symbol.method_count,
                    symbol.is_exported() || symbol.kind == SymbolKind::Export,
                    symbol.modifiers.contains(&Modifier::Test),
                    symbol.tiers.compact,
                    symbol.tiers.summary,
                    symbol.tiers.full,
                    symbol.tiers.compact_tokens as i64,
                    symbol.tiers.summary_tokens as i64,
                    symbol.tiers.full_tokens as i64,
                ])?;
            }

            let mut insert_rel = tx.prepare_cached(
                "INSERT INTO relationships (from_id, to_id, to_name, kind, file_path, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for rel in relationships {
                insert_rel.execute(params![
                    rel.from_id,
                    rel.to_id,
                    rel.to_name,
                    rel.kind.as_str(),
                    rel.file_path,
                    rel.line,
                ])?;
            }
        }

        bump_generation(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a file, its symbols and every edge they own. Returns false if
    /// the file was not indexed.
    pub fn delete_file(&self, path: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM relationships WHERE file_path = ?1", [path])?;
        tx.execute("DELETE FROM symbols WHERE file_path = ?1", [path])?;
        let removed = tx.execute("DELETE FROM files WHERE path = ?1", [path])?;

        if removed > 0 {
            bump_generation(&tx)?;
        }
        tx.commit()?;

        debug!("Deleted {} from index (present: {})", path, removed > 0);
        Ok(removed > 0)
    }

    /// Refresh size and mtime of a file whose content hash did not change,
    /// so the next scan's pre-filter skips it. Symbols are left untouched.
    pub fn touch_file(&self, path: &str, size: u64, mtime: i64) -> StoreResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE files SET size = ?2, mtime = ?3 WHERE path = ?1",
            params![path, size as i64, mtime],
        )?;
        Ok(updated > 0)
    }

    #[cfg(test)]
    pub fn get_symbol(&self, id: &str) -> StoreResult<Option<Symbol>> {
        let conn = self.conn()?;
        let symbol = conn
            .query_row(
                &format!("SELECT {} FROM symbols s WHERE s.id = ?1", SYMBOL_COLUMNS),
                [id],
                row_to_symbol,
            )
            .optional()?;
        Ok(symbol)
    }

    /// Ranked name lookup: exact, case-insensitive exact, prefix, substring,
    /// then full-text relevance.
    pub fn find_by_name(&self, text: &str, limit: usize, offset: usize) -> StoreResult<Page<Symbol>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Page::empty());
        }

        let escaped = escape_like(text);
        let prefix = format!("{}%", escaped);
        let substring = format!("%{}%", escaped);
        let fts = fts_query(text, " ");

        let name_branch = "SELECT s.seq AS seq,
                    CASE
                        WHEN s.name = ?1 THEN 0
                        WHEN s.name = ?1 COLLATE NOCASE THEN 1
                        WHEN s.name LIKE ?2 ESCAPE '\\' THEN 2
                        ELSE 3
                    END AS tier,
                    0.0 AS score
                FROM symbols s
                WHERE s.name LIKE ?3 ESCAPE '\\'";

        let matches = if fts.is_some() {
            format!(
                "{name_branch}
                 UNION ALL
                 SELECT symbols_fts.rowid AS seq, 4 AS tier, bm25(symbols_fts) AS score
                 FROM symbols_fts
                 WHERE symbols_fts MATCH ?4
                   AND symbols_fts.rowid NOT IN (SELECT seq FROM symbols WHERE name LIKE ?3 ESCAPE '\\')"
            )
        } else {
            name_branch.to_string()
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let fts_param = fts.unwrap_or_default();
        let count_sql = format!("SELECT COUNT(*) FROM ({})", matches);
        let total: i64 = if fts_param.is_empty() {
            tx.query_row(&count_sql, params![text, prefix, substring], |row| row.get(0))?
        } else {
            tx.query_row(
                &count_sql,
                params![text, prefix, substring, fts_param],
                |row| row.get(0),
            )?
        };

        let page_sql = format!(
            "SELECT {cols} FROM ({matches}) m JOIN symbols s ON s.seq = m.seq
             ORDER BY m.tier, m.score, {tie}
             LIMIT ?5 OFFSET ?6",
            cols = SYMBOL_COLUMNS,
            matches = matches,
            tie = TIE_BREAK,
        );
        let items = {
            let mut stmt = tx.prepare(&page_sql)?;
            // ?4 is bound even when unused so the parameter positions stay fixed.
            let rows = stmt.query_map(
                params![text, prefix, substring, fts_param, limit as i64, offset as i64],
                row_to_symbol,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        Ok(Page {
            items,
            total: total as usize,
        })
    }

    /// Full-text search over simple name, doc summary and qualified name.
    pub fn full_text_search(
        &self,
        text: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Page<Symbol>> {
        let Some(query) = fts_query(text, " OR ") else {
            return Ok(Page::empty());
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM symbols_fts WHERE symbols_fts MATCH ?1",
            [&query],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {cols}
             FROM symbols_fts JOIN symbols s ON s.seq = symbols_fts.rowid
             WHERE symbols_fts MATCH ?1
             ORDER BY bm25(symbols_fts), {tie}
             LIMIT ?2 OFFSET ?3",
            cols = SYMBOL_COLUMNS,
            tie = TIE_BREAK,
        );
        let items = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![query, limit as i64, offset as i64], row_to_symbol)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        Ok(Page {
            items,
            total: total as usize,
        })
    }

    /// Symbols of one file ordered by start line, then declaration order.
    pub fn symbols_in_file(&self, path: &str) -> StoreResult<Vec<Symbol>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM symbols s WHERE s.file_path = ?1 ORDER BY s.start_line, s.seq",
            SYMBOL_COLUMNS
        ))?;
        let symbols = stmt
            .query_map([path], row_to_symbol)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(symbols)
    }

    /// Edges leaving or entering a symbol. Incoming edges include unresolved
    /// edges whose target name equals the symbol's simple name.
    pub fn relationships_of(
        &self,
        symbol_id: &str,
        direction: Direction,
        kind: Option<RelationshipKind>,
    ) -> StoreResult<Vec<Relationship>> {
        let conn = self.conn()?;
        let kind = kind.map(|k| k.as_str());

        let sql = match direction {
            Direction::Outgoing => {
                "SELECT r.from_id, r.to_id, r.to_name, r.kind, r.file_path, r.line
                 FROM relationships r
                 WHERE r.from_id = ?1 AND (?2 IS NULL OR r.kind = ?2)
                 ORDER BY r.line, r.to_name"
            }
            Direction::Incoming => {
                "SELECT r.from_id, r.to_id, r.to_name, r.kind, r.file_path, r.line
                 FROM relationships r
                 WHERE (?2 IS NULL OR r.kind = ?2)
                   AND (r.to_id = ?1
                        OR (r.to_id IS NULL
                            AND r.to_name = (SELECT name FROM symbols WHERE id = ?1)))
                 ORDER BY r.file_path, r.line, r.from_id"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let rels = stmt
            .query_map(params![symbol_id, kind], row_to_relationship)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rels)
    }

    /// Every symbol with a `calls` edge to a symbol named `name` that still
    /// exists in the index.
    pub fn callers_of(&self, name: &str) -> StoreResult<Vec<CallSite>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols}, r.from_id, r.to_id, r.to_name, r.kind, r.file_path, r.line
             FROM relationships r JOIN symbols s ON s.id = r.from_id
             WHERE r.kind = 'calls'
               AND (
                    (r.to_id IS NOT NULL
                     AND r.to_id IN (SELECT id FROM symbols WHERE name = ?1))
                 OR (r.to_id IS NULL AND r.to_name = ?1
                     AND EXISTS (SELECT 1 FROM symbols t WHERE t.name = ?1))
               )
             ORDER BY s.file_path, s.start_line, s.id, r.line",
            cols = SYMBOL_COLUMNS
        ))?;

        let rows = stmt.query_map([name], |row| {
            let caller = row_to_symbol(row)?;
            let edge = relationship_at(row, 20)?;
            Ok(CallSite { caller, edge })
        })?;

        // One entry per caller, first call site wins.
        let mut seen = BTreeSet::new();
        let mut sites = Vec::new();
        for site in rows {
            let site = site?;
            if seen.insert(site.caller.id.clone()) {
                sites.push(site);
            }
        }
        Ok(sites)
    }

    /// Distinct import targets of one file, in name order.
    pub fn file_dependencies(&self, path: &str) -> StoreResult<Vec<Relationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.from_id, r.to_id, r.to_name, r.kind, r.file_path, MIN(r.line)
             FROM relationships r
             WHERE r.file_path = ?1 AND r.kind = 'imports'
             GROUP BY r.to_name
             ORDER BY r.to_name",
        )?;
        let rels = stmt
            .query_map([path], row_to_relationship)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rels)
    }

    /// Exported symbols ordered by location.
    pub fn list_exports(&self, limit: usize, offset: usize) -> StoreResult<Page<Symbol>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM symbols WHERE exported = 1",
            [],
            |row| row.get(0),
        )?;

        let items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM symbols s WHERE s.exported = 1
                 ORDER BY s.file_path, s.start_line, s.id
                 LIMIT ?1 OFFSET ?2",
                SYMBOL_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_symbol)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        Ok(Page {
            items,
            total: total as usize,
        })
    }

    /// Top-level symbols (no parent) across the index, ordered by location.
    pub fn top_level_symbols(&self, limit: usize) -> StoreResult<Vec<Symbol>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM symbols s
             WHERE s.parent_id IS NULL AND s.kind NOT IN ('import', 'export')
             ORDER BY s.exported DESC, s.file_path, s.start_line, s.id
             LIMIT ?1",
            SYMBOL_COLUMNS
        ))?;
        let symbols = stmt
            .query_map([limit as i64], row_to_symbol)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(symbols)
    }

    /// Resolve a path fragment to an indexed file: exact match first, then
    /// the shortest path ending in `/<fragment>`.
    pub fn resolve_file(&self, fragment: &str) -> StoreResult<Option<String>> {
        let fragment = fragment.trim().trim_start_matches("./");
        if fragment.is_empty() {
            return Ok(None);
        }

        let conn = self.conn()?;
        let exact: Option<String> = conn
            .query_row("SELECT path FROM files WHERE path = ?1", [fragment], |row| {
                row.get(0)
            })
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        let suffix = format!("%/{}", escape_like(fragment));
        let found = conn
            .query_row(
                "SELECT path FROM files WHERE path LIKE ?1 ESCAPE '\\'
                 ORDER BY length(path), path LIMIT 1",
                [suffix],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn get_file(&self, path: &str) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT path, content_hash, language, size, mtime, line_count, last_indexed_at
                 FROM files WHERE path = ?1",
                [path],
                row_to_file,
            )
            .optional()?;

        let Some(mut record) = record else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT id FROM symbols WHERE file_path = ?1 ORDER BY start_line, seq",
        )?;
        record.symbol_ids = stmt
            .query_map([path], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(Some(record))
    }

    /// Every file record, keyed by path.
    pub fn file_records(&self) -> StoreResult<HashMap<String, FileRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut records: HashMap<String, FileRecord> = {
            let mut stmt = tx.prepare(
                "SELECT path, content_hash, language, size, mtime, line_count, last_indexed_at
                 FROM files",
            )?;
            let rows = stmt.query_map([], row_to_file)?;
            rows.map(|r| r.map(|rec| (rec.path.clone(), rec)))
                .collect::<Result<_, _>>()?
        };

        {
            let mut stmt =
                tx.prepare("SELECT file_path, id FROM symbols ORDER BY file_path, start_line, seq")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                if let Some(record) = records.get_mut(&path) {
                    record.symbol_ids.push(row.get(1)?);
                }
            }
        }
        tx.commit()?;

        Ok(records)
    }

    /// Get index statistics
    pub fn stats(&self) -> StoreResult<IndexStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let count = |sql: &str| -> rusqlite::Result<usize> {
            tx.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        };

        let files = count("SELECT COUNT(*) FROM files")?;
        let symbols = count("SELECT COUNT(*) FROM symbols")?;
        let relationships = count("SELECT COUNT(*) FROM relationships")?;
        let exported = count("SELECT COUNT(*) FROM symbols WHERE exported = 1")?;
        let tests = count("SELECT COUNT(*) FROM symbols WHERE is_test = 1")?;
        let total_lines = count("SELECT COALESCE(SUM(line_count), 0) FROM files")?;

        let by_kind = group_counts(&tx, "SELECT kind, COUNT(*) FROM symbols GROUP BY kind ORDER BY COUNT(*) DESC, kind")?;
        let by_language = group_counts(
            &tx,
            "SELECT language, COUNT(*) FROM files GROUP BY language ORDER BY COUNT(*) DESC, language",
        )?;
        let by_relationship = group_counts(
            &tx,
            "SELECT kind, COUNT(*) FROM relationships GROUP BY kind ORDER BY COUNT(*) DESC, kind",
        )?;

        let last_full_index = get_meta(&tx, "last_full_index")?
            .and_then(|v| v.parse::<i64>().ok());
        let generation = read_generation(&tx)?;
        tx.commit()?;

        let db_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(IndexStats {
            files,
            symbols,
            relationships,
            exported,
            tests,
            total_lines,
            by_kind,
            by_language,
            by_relationship,
            db_size_bytes,
            schema_version: SCHEMA_VERSION,
            last_full_index,
            generation,
        })
    }

    /// Write generation, bumped by every committed upsert or delete.
    pub fn generation(&self) -> StoreResult<u64> {
        let conn = self.conn()?;
        read_generation(&conn)
    }

    pub fn last_full_index(&self) -> StoreResult<Option<i64>> {
        let conn = self.conn()?;
        Ok(get_meta(&conn, "last_full_index")?.and_then(|v| v.parse().ok()))
    }

    pub fn set_last_full_index(&self, timestamp: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('last_full_index', ?1)",
            [timestamp.to_string()],
        )?;
        Ok(())
    }

    /// Merge FTS segments, refresh planner statistics and reclaim space.
    ///
    /// Each step is atomic on its own; an interruption leaves the previous
    /// file contents in place.
    pub fn compact(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        info!("Compacting index at {}", self.db_path.display());

        conn.execute("INSERT INTO symbols_fts(symbols_fts) VALUES ('optimize')", [])?;
        conn.execute_batch("ANALYZE;")?;
        conn.execute_batch("VACUUM;")?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub files: usize,
    pub symbols: usize,
    pub relationships: usize,
    pub exported: usize,
    pub tests: usize,
    pub total_lines: usize,
    pub by_kind: Vec<(String, usize)>,
    pub by_language: Vec<(String, usize)>,
    pub by_relationship: Vec<(String, usize)>,
    pub db_size_bytes: u64,
    pub schema_version: i32,
    pub last_full_index: Option<i64>,
    pub generation: u64,
}

fn group_counts(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<(String, usize)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
    })?;
    rows.collect()
}

fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM index_meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

fn read_generation(conn: &Connection) -> StoreResult<u64> {
    match get_meta(conn, "generation")? {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("generation '{}'", value))),
    }
}

fn bump_generation(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE index_meta SET value = CAST(value AS INTEGER) + 1 WHERE key = 'generation'",
        [],
    )?;
    Ok(())
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `\` as escape character.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build an FTS5 query of quoted prefix terms. Returns None when the text
/// has no searchable characters.
pub fn fts_query(text: &str, joiner: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(joiner))
    }
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// Convert database row to Symbol
fn row_to_symbol(row: &Row) -> rusqlite::Result<Symbol> {
    let kind: String = row.get(1)?;
    let kind = kind.parse::<SymbolKind>().map_err(|e| conversion_error(1, e))?;
    let signature: Signature = json_column(row, 8)?;
    let modifiers: BTreeSet<Modifier> = json_column(row, 9)?;
    let decorators: Vec<String> = json_column(row, 10)?;

    Ok(Symbol {
        id: row.get(0)?,
        kind,
        name: row.get(2)?,
        qualified_name: row.get(3)?,
        file_path: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        language: row.get(7)?,
        signature,
        modifiers,
        decorators,
        parent_id: row.get(11)?,
        doc_summary: row.get(12)?,
        method_count: row.get(13)?,
        tiers: Tiers {
            compact: row.get(14)?,
            summary: row.get(15)?,
            full: row.get(16)?,
            compact_tokens: row.get::<_, i64>(17)? as usize,
            summary_tokens: row.get::<_, i64>(18)? as usize,
            full_tokens: row.get::<_, i64>(19)? as usize,
        },
    })
}

fn relationship_at(row: &Row, base: usize) -> rusqlite::Result<Relationship> {
    let kind: String = row.get(base + 3)?;
    Ok(Relationship {
        from_id: row.get(base)?,
        to_id: row.get(base + 1)?,
        to_name: row.get(base + 2)?,
        kind: kind
            .parse::<RelationshipKind>()
            .map_err(|e| conversion_error(base + 3, e))?,
        file_path: row.get(base + 4)?,
        line: row.get(base + 5)?,
    })
}

/// Convert database row to Relationship
fn row_to_relationship(row: &Row) -> rusqlite::Result<Relationship> {
    relationship_at(row, 0)
}

fn row_to_file(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        language: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        mtime: row.get(4)?,
        line_count: row.get(5)?,
        last_indexed_at: row.get(6)?,
        symbol_ids: Vec::new(),
    })
}

/// Get current timestamp in seconds
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{estimate_tokens, Modifier};
    use tempfile::tempdir;

    fn symbol(path: &str, name: &str, kind: SymbolKind, line: u32) -> Symbol {
        let compact = format!("{} {} - {}:{}", kind, name, path, line);
        Symbol {
            id: format!("{}#{}", path, name),
            kind,
            name: name.to_string(),
            qualified_name: name.to_string(),
            file_path: path.to_string(),
            start_line: line,
            end_line: line + 2,
            language: "python".to_string(),
            signature: Signature::default(),
            modifiers: BTreeSet::from([Modifier::Exported]),
            decorators: Vec::new(),
            parent_id: None,
            doc_summary: None,
            method_count: 0,
            tiers: Tiers {
                compact_tokens: estimate_tokens(&compact),
                summary_tokens: estimate_tokens(&compact),
                full_tokens: estimate_tokens(&compact),
                summary: compact.clone(),
                full: compact.clone(),
                compact,
            },
        }
    }

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            content_hash: hash.to_string(),
            language: "python".to_string(),
            size: 10,
            mtime: 0,
            line_count: 10,
            last_indexed_at: now(),
            symbol_ids: Vec::new(),
        }
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("index.db");

        let store = IndexStore::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(store.schema_status(), SchemaStatus::Created);

        let reopened = IndexStore::open(&db_path).unwrap();
        assert_eq!(reopened.schema_status(), SchemaStatus::Current);
    }

    #[test]
    fn test_upsert_replaces_previous_symbols() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        let old = symbol("a.py", "old_name", SymbolKind::Function, 1);
        store.upsert_file(&record("a.py", "h1"), &[old], &[]).unwrap();

        let new = symbol("a.py", "new_name", SymbolKind::Function, 3);
        store
            .upsert_file(&record("a.py", "h2"), &[new.clone()], &[])
            .unwrap();

        let file = store.get_file("a.py").unwrap().unwrap();
        assert_eq!(file.content_hash, "h2");
        assert_eq!(file.symbol_ids, vec![new.id.clone()]);
        assert!(store.find_by_name("old_name", 10, 0).unwrap().items.is_empty());
        assert_eq!(store.get_symbol(&new.id).unwrap(), Some(new));
    }

    #[test]
    fn test_same_line_symbols_keep_insert_order() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        // Ids sort alpha < mid < zeta; declaration order must win
        let symbols = vec![
            symbol("c.js", "zeta", SymbolKind::Constant, 4),
            symbol("c.js", "alpha", SymbolKind::Constant, 4),
            symbol("c.js", "mid", SymbolKind::Constant, 4),
            symbol("c.js", "setup", SymbolKind::Function, 1),
        ];
        store.upsert_file(&record("c.js", "h"), &symbols, &[]).unwrap();

        let names: Vec<String> = store
            .symbols_in_file("c.js")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["setup", "zeta", "alpha", "mid"]);

        let expected = vec!["c.js#setup", "c.js#zeta", "c.js#alpha", "c.js#mid"];
        assert_eq!(store.get_file("c.js").unwrap().unwrap().symbol_ids, expected);
        assert_eq!(store.file_records().unwrap()["c.js"].symbol_ids, expected);
    }

    #[test]
    fn test_find_by_name_ranking() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        let symbols = vec![
            symbol("a.py", "UserProfileView", SymbolKind::Class, 1),
            symbol("a.py", "load_user", SymbolKind::Function, 10),
            symbol("a.py", "User", SymbolKind::Class, 20),
            symbol("a.py", "user", SymbolKind::Constant, 30),
        ];
        store.upsert_file(&record("a.py", "h"), &symbols, &[]).unwrap();

        let page = store.find_by_name("User", 10, 0).unwrap();
        let names: Vec<_> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["User", "user", "UserProfileView", "load_user"]);
        assert_eq!(page.total, 4);
    }

    #[test]
    fn test_delete_file_removes_symbols_and_edges() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        let caller = symbol("a.py", "main", SymbolKind::Function, 1);
        let callee = symbol("a.py", "helper", SymbolKind::Function, 5);
        let edge = Relationship {
            from_id: caller.id.clone(),
            to_id: Some(callee.id.clone()),
            to_name: "helper".to_string(),
            kind: RelationshipKind::Calls,
            file_path: "a.py".to_string(),
            line: 2,
        };
        store
            .upsert_file(&record("a.py", "h"), &[caller.clone(), callee], &[edge])
            .unwrap();
        assert_eq!(store.callers_of("helper").unwrap().len(), 1);

        assert!(store.delete_file("a.py").unwrap());
        assert!(!store.delete_file("a.py").unwrap());
        assert!(store.callers_of("helper").unwrap().is_empty());
        assert_eq!(store.stats().unwrap().relationships, 0);
    }

    #[test]
    fn test_generation_bumps_on_write() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        let before = store.generation().unwrap();
        store.upsert_file(&record("a.py", "h"), &[], &[]).unwrap();
        assert_eq!(store.generation().unwrap(), before + 1);
    }

    #[test]
    fn test_resolve_file_by_suffix() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();
        store.upsert_file(&record("src/app/auth.py", "h"), &[], &[]).unwrap();
        store.upsert_file(&record("lib/oauth.py", "h"), &[], &[]).unwrap();

        assert_eq!(
            store.resolve_file("auth.py").unwrap().as_deref(),
            Some("src/app/auth.py")
        );
        assert_eq!(store.resolve_file("missing.py").unwrap(), None);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("user login", " OR ").as_deref(), Some("\"user\"* OR \"login\"*"));
        assert_eq!(fts_query("\"quoted\" AND", " ").as_deref(), Some("\"quoted\"* \"AND\"*"));
        assert_eq!(fts_query("  -- ", " "), None);
    }

    #[test]
    fn test_stats_empty() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.symbols, 0);
        assert_eq!(stats.files, 0);
        assert_eq!(stats.relationships, 0);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
        assert_eq!(stats.last_full_index, None);
    }

    #[test]
    fn test_compact_keeps_data() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();
        let s = symbol("a.py", "authenticate", SymbolKind::Function, 1);
        store.upsert_file(&record("a.py", "h"), &[s], &[]).unwrap();

        store.compact().unwrap();
        assert_eq!(store.full_text_search("authenticate", 10, 0).unwrap().total, 1);
    }
}
