//! Keyword table: search terms, watermarks and per-keyword health.

use super::{from_micros, lock, open_connection, to_micros};
use crate::error::StoreError;
use crate::models::Keyword;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const TABLE: &str = "keywords";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS keywords (
    name          TEXT PRIMARY KEY,
    query         TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    last_fetch_at INTEGER,
    last_run_at   INTEGER,
    last_error    TEXT,
    last_error_at INTEGER,
    created_at    INTEGER NOT NULL
);
";

const SELECT_COLUMNS: &str =
    "name, query, active, last_fetch_at, last_run_at, last_error, created_at";

/// Raw row before timestamp conversion.
struct KeywordRow {
    name: String,
    query: String,
    active: bool,
    last_fetch_at: Option<i64>,
    last_run_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
}

impl KeywordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            query: row.get(1)?,
            active: row.get(2)?,
            last_fetch_at: row.get(3)?,
            last_run_at: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_keyword(self) -> Result<Keyword, StoreError> {
        Ok(Keyword {
            name: self.name,
            query: self.query,
            active: self.active,
            last_fetch_at: self
                .last_fetch_at
                .map(|m| from_micros(TABLE, m))
                .transpose()?,
            last_run_at: self
                .last_run_at
                .map(|m| from_micros(TABLE, m))
                .transpose()?,
            last_error: self.last_error,
            created_at: from_micros(TABLE, self.created_at)?,
        })
    }
}

/// Durable keyword table.
pub struct KeywordStore {
    conn: Mutex<Connection>,
}

impl KeywordStore {
    /// Open (or create) the keyword store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("Keyword store ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new active keyword. Fails with `Conflict` if the name exists.
    pub fn add(&self, name: &str, query: &str, now: DateTime<Utc>) -> Result<Keyword, StoreError> {
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO keywords (name, query, active, created_at)
             VALUES (?1, ?2, 1, ?3)",
            params![name, query, to_micros(now)],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("keyword {:?}", name)));
        }
        debug!("Added keyword {:?} with query {:?}", name, query);

        Ok(Keyword {
            name: name.to_string(),
            query: query.to_string(),
            active: true,
            last_fetch_at: None,
            last_run_at: None,
            last_error: None,
            created_at: now,
        })
    }

    /// Remove a keyword. Its shard file is left on disk.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM keywords WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    pub fn set_active(&self, name: &str, active: bool) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE keywords SET active = ?2 WHERE name = ?1",
            params![name, active],
        )?;
        Ok(updated > 0)
    }

    pub fn get(&self, name: &str) -> Result<Option<Keyword>, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM keywords WHERE name = ?1", SELECT_COLUMNS),
                params![name],
                KeywordRow::from_row,
            )
            .optional()?;
        row.map(KeywordRow::into_keyword).transpose()
    }

    /// All keywords, sorted by name.
    pub fn list(&self) -> Result<Vec<Keyword>, StoreError> {
        self.select("")
    }

    /// Active keywords, sorted by name.
    pub fn active(&self) -> Result<Vec<Keyword>, StoreError> {
        self.select("WHERE active = 1")
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM keywords", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    fn select(&self, filter: &str) -> Result<Vec<Keyword>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM keywords {} ORDER BY name",
            SELECT_COLUMNS, filter
        ))?;
        let rows = stmt
            .query_map([], KeywordRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(KeywordRow::into_keyword).collect()
    }

    /// Move the watermark forward to `to`. Never moves it backwards.
    ///
    /// Returns whether the stored watermark changed.
    pub fn advance_watermark(&self, name: &str, to: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            "UPDATE keywords SET last_fetch_at = ?2
             WHERE name = ?1 AND (last_fetch_at IS NULL OR last_fetch_at < ?2)",
            params![name, to_micros(to)],
        )?;
        Ok(updated > 0)
    }

    /// Record a completed cycle and its most relevant failure, if any.
    pub fn record_run(
        &self,
        name: &str,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let error_at = error.map(|_| to_micros(at));
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE keywords SET last_run_at = ?2, last_error = ?3, last_error_at = ?4
             WHERE name = ?1",
            params![name, to_micros(at), error, error_at],
        )?;
        Ok(())
    }

    /// Record a failed cycle. `last_run_at` stays put so the run is retried.
    pub fn record_failure(
        &self,
        name: &str,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE keywords SET last_error = ?2, last_error_at = ?3 WHERE name = ?1",
            params![name, error, to_micros(at)],
        )?;
        Ok(())
    }

    /// The most recently recorded failure still standing on any keyword.
    pub fn latest_error(&self) -> Result<Option<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let error: Option<String> = conn
            .query_row(
                "SELECT last_error FROM keywords WHERE last_error IS NOT NULL
                 ORDER BY last_error_at DESC, name ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_add_and_conflict() {
        let store = KeywordStore::in_memory().unwrap();
        assert!(store.is_empty().unwrap());

        let kw = store.add("materials science", "all:\"materials science\"", at(0)).unwrap();
        assert!(kw.active);
        assert!(kw.last_fetch_at.is_none());

        let dup = store.add("materials science", "whatever", at(1));
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_watermark_only_moves_forward() {
        let store = KeywordStore::in_memory().unwrap();
        store.add("ml", "all:ml", at(0)).unwrap();

        assert!(store.advance_watermark("ml", at(5)).unwrap());
        assert!(!store.advance_watermark("ml", at(3)).unwrap());
        assert!(!store.advance_watermark("ml", at(5)).unwrap());
        assert_eq!(store.get("ml").unwrap().unwrap().last_fetch_at, Some(at(5)));

        assert!(store.advance_watermark("ml", at(6)).unwrap());
        assert_eq!(store.get("ml").unwrap().unwrap().last_fetch_at, Some(at(6)));
    }

    #[test]
    fn test_active_filter_and_ordering() {
        let store = KeywordStore::in_memory().unwrap();
        store.add("zeolites", "all:zeolites", at(0)).unwrap();
        store.add("alloys", "all:alloys", at(0)).unwrap();
        store.add("batteries", "all:batteries", at(0)).unwrap();
        assert!(store.set_active("batteries", false).unwrap());
        assert!(!store.set_active("missing", false).unwrap());

        let all: Vec<String> = store.list().unwrap().into_iter().map(|k| k.name).collect();
        assert_eq!(all, vec!["alloys", "batteries", "zeolites"]);

        let active: Vec<String> = store.active().unwrap().into_iter().map(|k| k.name).collect();
        assert_eq!(active, vec!["alloys", "zeolites"]);
    }

    #[test]
    fn test_run_bookkeeping() {
        let store = KeywordStore::in_memory().unwrap();
        store.add("ml", "all:ml", at(0)).unwrap();

        store.record_failure("ml", at(8), "disk full").unwrap();
        let kw = store.get("ml").unwrap().unwrap();
        assert_eq!(kw.last_error.as_deref(), Some("disk full"));
        assert!(kw.last_run_at.is_none());

        store.record_run("ml", at(9), None).unwrap();
        let kw = store.get("ml").unwrap().unwrap();
        assert_eq!(kw.last_run_at, Some(at(9)));
        assert!(kw.last_error.is_none());
        assert!(store.latest_error().unwrap().is_none());

        assert!(store.remove("ml").unwrap());
        assert!(store.get("ml").unwrap().is_none());
    }

    #[test]
    fn test_latest_error_orders_by_time() {
        let store = KeywordStore::in_memory().unwrap();
        store.add("alloys", "all:alloys", at(0)).unwrap();
        store.add("zeolites", "all:zeolites", at(0)).unwrap();

        store.record_failure("zeolites", at(3), "feed down").unwrap();
        store
            .record_run("alloys", at(5), Some("analysis unavailable for 1 paper(s)"))
            .unwrap();
        assert_eq!(
            store.latest_error().unwrap().as_deref(),
            Some("analysis unavailable for 1 paper(s)")
        );

        store.record_run("alloys", at(6), None).unwrap();
        assert_eq!(store.latest_error().unwrap().as_deref(), Some("feed down"));
    }
}
