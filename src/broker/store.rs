//! Durable FIFO item storage backed by SQLite.
//!
//! Items live in a single `Items(Id, Json)` table ordered by the integer
//! primary key. The store assumes exclusive ownership of the database file,
//! so it keeps one long-running transaction open and commits it only when
//! the configured interval has elapsed: uncommitted rows are always visible
//! to the connection that wrote them.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::protocol::Item;

/// Default minimum time between commits.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(10);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS Items(Id INTEGER PRIMARY KEY, Json TEXT);";

/// How many rows a purge should remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    /// Every row in the queue.
    All,
    /// Up to this many of the oldest rows.
    Oldest(u64),
}

/// Configuration for opening a [`QueueStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file. `None` keeps the queue in memory.
    pub path: Option<PathBuf>,
    /// Minimum time between commits to stable storage.
    pub min_commit_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            min_commit_interval: DEFAULT_COMMIT_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// In-memory store with the default commit interval.
    pub fn memory() -> Self {
        Self::default()
    }

    /// File-backed store with the default commit interval.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Override the minimum commit interval.
    #[must_use]
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.min_commit_interval = interval;
        self
    }
}

/// Durable queue of JSON items.
///
/// Dropping the store commits any pending mutations. Prefer [`QueueStore::close`]
/// on the normal exit path so that a failing final commit is reported.
pub struct QueueStore {
    conn: Option<Connection>,
    count: u64,
    min_commit_interval: Duration,
    last_commit: Instant,
}

impl QueueStore {
    /// Open (or create) the queue described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The database directory cannot be created
    /// - The database cannot be opened or the schema cannot be created
    /// - The existing rows cannot be counted (corruption)
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                ensure_parent_dir(path)?;
                Connection::open(path)?
            },
            None => Connection::open_in_memory()?,
        };

        conn.execute_batch(SCHEMA)?;
        conn.execute_batch("VACUUM;")?;
        let count: i64 = conn.query_row("SELECT count(*) FROM Items;", [], |row| row.get(0))?;
        conn.execute_batch("BEGIN;")?;

        tracing::debug!(
            path = ?config.path,
            count,
            interval_ms = config.min_commit_interval.as_millis() as u64,
            "Opened queue store"
        );

        Ok(Self {
            conn: Some(conn),
            count: u64::try_from(count).unwrap_or(0),
            min_commit_interval: config.min_commit_interval,
            last_commit: Instant::now(),
        })
    }

    /// Number of items in the queue.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append an item as the newest row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the insert or a due commit fails.
    pub fn push(&mut self, item: &Item) -> Result<()> {
        self.conn()?
            .prepare_cached("INSERT INTO Items(Json) VALUES (?1);")?
            .execute(params![item.as_str()])?;
        self.count += 1;
        self.maybe_commit()
    }

    /// Remove and return the oldest item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyQueue`] when there is nothing to pop, or
    /// [`Error::Storage`] if the database operation fails.
    pub fn pop(&mut self) -> Result<Item> {
        if self.count == 0 {
            return Err(Error::EmptyQueue);
        }

        let conn = self.conn()?;
        let oldest: Option<(i64, String)> = conn
            .prepare_cached("SELECT Id, Json FROM Items ORDER BY Id LIMIT 1;")?
            .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        // The counter says there is a row, so a missing one means the file
        // was changed behind our back.
        let (id, json) = oldest.ok_or(Error::Storage(rusqlite::Error::QueryReturnedNoRows))?;

        conn.prepare_cached("DELETE FROM Items WHERE Id = ?1;")?
            .execute(params![id])?;
        self.count -= 1;
        self.maybe_commit()?;

        Ok(Item::from_stored(json))
    }

    /// Remove up to `n` of the oldest items, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the delete or a due commit fails.
    pub fn purge(&mut self, n: Purge) -> Result<u64> {
        if self.count == 0 {
            return Ok(0);
        }

        let conn = self.conn()?;
        let removed = match n {
            Purge::Oldest(limit) if limit < self.count => {
                let limit = i64::try_from(limit).unwrap_or(i64::MAX);
                conn.execute(
                    "DELETE FROM Items WHERE Id IN (SELECT Id FROM Items ORDER BY Id LIMIT ?1);",
                    params![limit],
                )?
            },
            _ => conn.execute("DELETE FROM Items;", [])?,
        };

        let removed = removed as u64;
        self.count = self.count.saturating_sub(removed);
        self.maybe_commit()?;
        Ok(removed)
    }

    /// Commit pending mutations now, regardless of the interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the commit fails.
    pub fn flush(&mut self) -> Result<()> {
        self.conn()?.execute_batch("COMMIT; BEGIN;")?;
        self.last_commit = Instant::now();
        Ok(())
    }

    /// Commit pending mutations and close the database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the final commit or the close fails.
    pub fn close(mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.execute_batch("COMMIT;")?;
        conn.close().map_err(|(_, e)| Error::Storage(e))?;
        tracing::debug!(count = self.count, "Closed queue store");
        Ok(())
    }

    fn maybe_commit(&mut self) -> Result<()> {
        if self.last_commit.elapsed() >= self.min_commit_interval {
            self.flush()?;
        }
        Ok(())
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or(Error::Storage(rusqlite::Error::InvalidQuery))
    }
}

impl Drop for QueueStore {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !conn.is_autocommit()
            && let Err(e) = conn.execute_batch("COMMIT;")
        {
            tracing::error!(error = %e, "Failed to commit queue store on drop");
        }
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("count", &self.count)
            .field("min_commit_interval", &self.min_commit_interval)
            .finish_non_exhaustive()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    Ok(())
}
