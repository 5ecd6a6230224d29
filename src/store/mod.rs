//! Durable state: the keyword table and one paper shard per keyword.
//!
//! Layout under the data directory:
//!
//! ```text
//! keywords.db              keyword table + watermarks
//! shards/<slug>-<hash>.db  papers, comparison cache, insight cache
//! ```

mod keywords;
mod papers;

pub use keywords::KeywordStore;
pub use papers::PaperStore;

use crate::error::StoreError;
use crate::models::hash_parts;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub(crate) fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(table: &'static str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        table,
        reason: format!("timestamp out of range: {}", micros),
    })
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

/// Open a SQLite file with the pragmas every store uses.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    // WAL is unavailable on some filesystems; rollback journal still works.
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode = WAL;") {
        warn!("Could not enable WAL for {}: {}", path.display(), e);
    }
    Ok(conn)
}

/// File name of a keyword's shard: readable slug plus a hash suffix so
/// that names differing only in punctuation never collide.
pub fn shard_file_name(keyword: &str) -> String {
    let mut slug: String = keyword
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while slug.contains("__") {
        slug = slug.replace("__", "_");
    }
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "keyword" } else { slug };
    let suffix = &hash_parts([keyword])[..8];

    format!("{}-{}.db", slug, suffix)
}

/// Lazily opened shards, one per keyword name.
pub struct ShardRegistry {
    root: Option<PathBuf>,
    open: Mutex<HashMap<String, Arc<PaperStore>>>,
}

impl ShardRegistry {
    /// Shards stored as files under `data_dir/shards`.
    pub fn on_disk(data_dir: &Path) -> Self {
        Self {
            root: Some(data_dir.join("shards")),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Shards held in memory (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            root: None,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Shard for a keyword, opening (and creating) it on first use.
    pub fn shard(&self, keyword: &str) -> Result<Arc<PaperStore>, StoreError> {
        let mut open = self.open.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(store) = open.get(keyword) {
            return Ok(Arc::clone(store));
        }

        let store = match self.root {
            Some(ref root) => {
                let path = root.join(shard_file_name(keyword));
                debug!("Opening shard for {:?} at {}", keyword, path.display());
                PaperStore::open(&path)?
            }
            None => PaperStore::in_memory()?,
        };
        let store = Arc::new(store);
        open.insert(keyword.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Shards opened so far, sorted by keyword.
    pub fn opened(&self) -> Result<Vec<(String, Arc<PaperStore>)>, StoreError> {
        let open = self.open.lock().map_err(|_| StoreError::Poisoned)?;
        let mut shards: Vec<_> = open
            .iter()
            .map(|(name, store)| (name.clone(), Arc::clone(store)))
            .collect();
        shards.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(shards)
    }

    /// Drop a keyword's handle so its file is no longer held open.
    pub fn close(&self, keyword: &str) -> Result<(), StoreError> {
        let mut open = self.open.lock().map_err(|_| StoreError::Poisoned)?;
        open.remove(keyword);
        Ok(())
    }

    /// Flush WAL contents of every open shard into the main database files.
    pub fn checkpoint_all(&self) -> Result<(), StoreError> {
        for (name, store) in self.opened()? {
            store.checkpoint()?;
            debug!("Checkpointed shard {:?}", name);
        }
        info!("All open shards checkpointed");
        Ok(())
    }
}
