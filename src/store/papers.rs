//! A keyword shard: papers plus the analysis caches derived from them.
//!
//! Identity columns are written once by ingestion (`insert_if_absent`);
//! the analysis engine only touches the cache columns and cache tables.

use super::{from_micros, lock, open_connection, to_micros};
use crate::error::StoreError;
use crate::models::{ArchivedInsight, ComparisonResult, InsightSnapshot, Paper, Summary};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TABLE: &str = "papers";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS papers (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    abstract     TEXT NOT NULL,
    authors      TEXT NOT NULL,
    categories   TEXT NOT NULL,
    published_at INTEGER NOT NULL,
    ingested_at  INTEGER NOT NULL,
    pdf_url      TEXT NOT NULL,
    summary      TEXT,
    summary_key  TEXT,
    summary_json TEXT,
    insight_tags TEXT
);
CREATE INDEX IF NOT EXISTS idx_papers_ingested ON papers (ingested_at);
CREATE INDEX IF NOT EXISTS idx_papers_published ON papers (published_at);

CREATE TABLE IF NOT EXISTS comparisons (
    paper_a         TEXT NOT NULL,
    paper_b         TEXT NOT NULL,
    content_version TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    PRIMARY KEY (paper_a, paper_b)
);

CREATE TABLE IF NOT EXISTS insights (
    window_days    INTEGER PRIMARY KEY,
    paper_set_hash TEXT NOT NULL,
    payload        TEXT NOT NULL,
    generated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS insight_history (
    window_days  INTEGER NOT NULL,
    generated_on TEXT NOT NULL,
    payload      TEXT NOT NULL,
    archived_at  INTEGER NOT NULL,
    PRIMARY KEY (window_days, generated_on)
);
";

const PAPER_COLUMNS: &str = "id, title, abstract, authors, categories, published_at, \
                             ingested_at, pdf_url, summary, insight_tags";

struct PaperRow {
    id: String,
    title: String,
    abstract_text: String,
    authors: String,
    categories: String,
    published_at: i64,
    ingested_at: i64,
    pdf_url: String,
    summary: Option<String>,
    insight_tags: Option<String>,
}

impl PaperRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            abstract_text: row.get(2)?,
            authors: row.get(3)?,
            categories: row.get(4)?,
            published_at: row.get(5)?,
            ingested_at: row.get(6)?,
            pdf_url: row.get(7)?,
            summary: row.get(8)?,
            insight_tags: row.get(9)?,
        })
    }

    fn into_paper(self) -> Result<Paper, StoreError> {
        let insight_tags = match self.insight_tags {
            Some(ref json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        Ok(Paper {
            authors: serde_json::from_str(&self.authors)?,
            categories: serde_json::from_str(&self.categories)?,
            published_at: from_micros(TABLE, self.published_at)?,
            ingested_at: from_micros(TABLE, self.ingested_at)?,
            id: self.id,
            title: self.title,
            abstract_text: self.abstract_text,
            pdf_url: self.pdf_url,
            summary: self.summary,
            insight_tags,
        })
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// SQLite-backed shard for one keyword.
pub struct PaperStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl PaperStore {
    /// Open (or create) a shard at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory shard.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Insert a paper unless its id is already present.
    ///
    /// Returns `false` for a duplicate; the existing row is never touched.
    pub fn insert_if_absent(&self, paper: &Paper) -> Result<bool, StoreError> {
        let authors = serde_json::to_string(&paper.authors)?;
        let categories = serde_json::to_string(&paper.categories)?;
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO papers
                (id, title, abstract, authors, categories, published_at, ingested_at, pdf_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                paper.id,
                paper.title,
                paper.abstract_text,
                authors,
                categories,
                to_micros(paper.published_at),
                to_micros(paper.ingested_at),
                paper.pdf_url,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<Paper>, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM papers WHERE id = ?1", PAPER_COLUMNS),
                params![id],
                PaperRow::from_row,
            )
            .optional()?;
        row.map(PaperRow::into_paper).transpose()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Papers without a cached summary, oldest publication first.
    pub fn pending_analysis(&self, limit: usize) -> Result<Vec<Paper>, StoreError> {
        self.select(
            "WHERE summary IS NULL ORDER BY published_at ASC, id ASC LIMIT ?1",
            params![limit.min(i64::MAX as usize) as i64],
        )
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM papers WHERE summary IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Papers ingested at or after `since`, newest publication first.
    pub fn ingested_since(&self, since: DateTime<Utc>) -> Result<Vec<Paper>, StoreError> {
        self.select(
            "WHERE ingested_at >= ?1 ORDER BY published_at DESC, id ASC",
            params![to_micros(since)],
        )
    }

    /// Case-insensitive substring match on title, abstract and summary.
    pub fn search(&self, text: &str) -> Result<Vec<Paper>, StoreError> {
        let pattern = like_pattern(text.trim());
        self.select(
            "WHERE title LIKE ?1 ESCAPE '\\' OR abstract LIKE ?1 ESCAPE '\\' \
             OR summary LIKE ?1 ESCAPE '\\' ORDER BY published_at DESC, id ASC",
            params![pattern],
        )
    }

    fn select(&self, tail: &str, params: impl rusqlite::Params) -> Result<Vec<Paper>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM papers {}", PAPER_COLUMNS, tail))?;
        let rows = stmt
            .query_map(params, PaperRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PaperRow::into_paper).collect()
    }

    /// Cached summary for `paper_id`, only if it was built for `cache_key`.
    pub fn cached_summary(
        &self,
        paper_id: &str,
        cache_key: &str,
    ) -> Result<Option<Summary>, StoreError> {
        let conn = lock(&self.conn)?;
        let json: Option<Option<String>> = conn
            .query_row(
                "SELECT summary_json FROM papers WHERE id = ?1 AND summary_key = ?2",
                params![paper_id, cache_key],
                |row| row.get(0),
            )
            .optional()?;
        match json.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Write a summary into the paper's cache columns.
    pub fn store_summary(&self, summary: &Summary) -> Result<(), StoreError> {
        let json = serde_json::to_string(summary)?;
        let tags = serde_json::to_string(&summary.tags)?;
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE papers
             SET summary = ?2, summary_key = ?3, summary_json = ?4, insight_tags = ?5
             WHERE id = ?1",
            params![summary.paper_id, summary.text, summary.cache_key, json, tags],
        )?;
        if updated == 0 {
            return Err(StoreError::Missing(format!("paper {}", summary.paper_id)));
        }
        Ok(())
    }

    /// Cached comparison for the canonical pair `(paper_a, paper_b)`.
    pub fn cached_comparison(
        &self,
        paper_a: &str,
        paper_b: &str,
    ) -> Result<Option<ComparisonResult>, StoreError> {
        let conn = lock(&self.conn)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT payload FROM comparisons WHERE paper_a = ?1 AND paper_b = ?2",
                params![paper_a, paper_b],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    /// Insert or replace the single comparison row for a pair.
    pub fn store_comparison(&self, result: &ComparisonResult) -> Result<(), StoreError> {
        if result.paper_a >= result.paper_b {
            return Err(StoreError::Corrupt {
                table: "comparisons",
                reason: format!(
                    "pair ({}, {}) is not in canonical order",
                    result.paper_a, result.paper_b
                ),
            });
        }
        let json = serde_json::to_string(result)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO comparisons (paper_a, paper_b, content_version, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.paper_a,
                result.paper_b,
                result.content_version,
                json,
                to_micros(result.created_at),
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn comparison_count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM comparisons", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn cached_insight(&self, window_days: u32) -> Result<Option<InsightSnapshot>, StoreError> {
        let conn = lock(&self.conn)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT payload FROM insights WHERE window_days = ?1",
                params![window_days],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    pub fn store_insight(&self, snapshot: &InsightSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO insights (window_days, paper_set_hash, payload, generated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.window_days,
                snapshot.paper_set_hash,
                json,
                to_micros(snapshot.generated_at),
            ],
        )?;
        Ok(())
    }

    /// Keep `snapshot` as the day's entry for its window; a later cycle on
    /// the same day replaces it.
    pub fn archive_insight(
        &self,
        snapshot: &InsightSnapshot,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)?;
        let day = at.date_naive().format("%Y-%m-%d").to_string();
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO insight_history (window_days, generated_on, payload, archived_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.window_days, day, json, to_micros(at)],
        )?;
        Ok(())
    }

    /// Archived snapshots for a window, newest day first.
    pub fn insight_history(
        &self,
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<ArchivedInsight>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT generated_on, payload FROM insight_history
             WHERE window_days = ?1 ORDER BY generated_on DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![window_days, limit.min(i64::MAX as usize) as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(day, json)| -> Result<ArchivedInsight, StoreError> {
                let generated_on = NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|e| {
                    StoreError::Corrupt {
                        table: "insight_history",
                        reason: format!("bad date {:?}: {}", day, e),
                    }
                })?;
                Ok(ArchivedInsight {
                    generated_on,
                    snapshot: serde_json::from_str(&json)?,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        lock(&self.conn)?.execute_batch(sql)?;
        Ok(())
    }

    /// Fold the WAL back into the database file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        if self.path.is_none() {
            return Ok(());
        }
        let conn = lock(&self.conn)?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
