// Archive package: on-disk layout, database lifecycle, scope operators,
// pagination conventions.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_PAGE_LIMIT;
use crate::db;
use crate::error::Result;
use crate::events::EventBus;

const ARCHIVE_ID_KEY: &str = "archive_id";

/// An offset/limit page request. The limit is clamped to MAX_PAGE_LIMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub offset: u64,
    pub limit: u64,
}

impl PageRange {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: limit.min(MAX_PAGE_LIMIT),
        }
    }

    /// The canonical range used by full scans. Callers that may exceed one
    /// page loop with `next()` until `total` is reached.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: MAX_PAGE_LIMIT,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// One page of results plus the total count and the echoed range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemList<T> {
    pub total: u64,
    pub items: Vec<T>,
    pub range: PageRange,
}

impl<T> ItemList<T> {
    pub fn page(total: u64, items: Vec<T>, range: PageRange) -> Self {
        Self { total, items, range }
    }
}

/// A self-contained archival package: directory, embedded database, blob
/// store, change-event bus. One archive is owned by one thread; all database
/// work goes through the scope operators below.
pub struct Archive {
    root: PathBuf,
    id: String,
    conn: Connection,
    events: EventBus,
    // Ingest run-state (session ids currently running / asked to stop).
    pub(crate) active_sessions: RefCell<HashSet<String>>,
    pub(crate) stopping_sessions: RefCell<HashSet<String>>,
}

impl Archive {
    /// Open or create an archive at the given directory. The optional id is
    /// used on first open only (bootstrap and sync mirrors pass the source
    /// archive's id); later opens read the stored id back.
    pub fn open(root: &Path, id: Option<&str>) -> Result<Archive> {
        db::init_archive_folders(root)?;
        let conn = db::open_db(&db::get_db_path(root))?;

        let archive_id = match db::schema::get_meta(&conn, ARCHIVE_ID_KEY)? {
            Some(existing) => existing,
            None => {
                let fresh = id
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                db::schema::set_meta(&conn, ARCHIVE_ID_KEY, &fresh)?;
                fresh
            }
        };

        let archive = Archive {
            root: root.to_path_buf(),
            id: archive_id,
            conn,
            events: EventBus::new(),
            active_sessions: RefCell::new(HashSet::new()),
            stopping_sessions: RefCell::new(HashSet::new()),
        };

        crate::collections::ensure_roots(&archive)?;

        // Incomplete ingest sessions pick up where they left off
        crate::ingest::resume_sessions(&archive)?;

        Ok(archive)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_dir(&self) -> PathBuf {
        db::get_blob_path(&self.root)
    }

    pub fn sync_dir(&self) -> PathBuf {
        db::get_sync_path(&self.root)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run database work inside a unit of work. SQLite autocommit is the
    /// flush; the connection is the session.
    pub fn unit_of_work<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(&self.conn)
    }

    /// Run database work inside a transaction. Nested calls reuse the open
    /// transaction (the embedded store is single-writer and does not support
    /// true nesting; savepoints are deliberately not used).
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            // Already inside a transaction
            return f(&self.conn);
        }

        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Direct connection access for read paths that manage their own scope.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Tear down the database connection and release the archive.
    pub fn close(self) {
        log::debug!("Closing archive {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout_and_roots() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path(), None).unwrap();

        assert!(db::get_db_path(tmp.path()).exists());
        assert!(archive.blob_dir().exists());
        assert!(archive.sync_dir().exists());

        let roots = schema::list_collections(archive.conn()).unwrap();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_archive_id_persists_across_opens() {
        let tmp = TempDir::new().unwrap();
        let first = Archive::open(tmp.path(), Some("fixed-id")).unwrap();
        assert_eq!(first.id(), "fixed-id");
        drop(first);

        let second = Archive::open(tmp.path(), Some("other-id")).unwrap();
        assert_eq!(second.id(), "fixed-id");
    }

    #[test]
    fn test_nested_transaction_reuses_outer() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path(), None).unwrap();

        archive
            .transaction(|conn| {
                schema::set_meta(conn, "outer", "1")?;
                archive.transaction(|conn| {
                    schema::set_meta(conn, "inner", "2")?;
                    assert!(!conn.is_autocommit());
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(
            schema::get_meta(archive.conn(), "inner").unwrap().as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let tmp = TempDir::new().unwrap();
        let archive = Archive::open(tmp.path(), None).unwrap();

        let result: Result<()> = archive.transaction(|conn| {
            schema::set_meta(conn, "doomed", "1")?;
            Err(crate::error::ArcaError::Other("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(schema::get_meta(archive.conn(), "doomed").unwrap().is_none());
    }

    #[test]
    fn test_page_range_clamps_limit() {
        let range = PageRange::new(0, 5000);
        assert_eq!(range.limit, MAX_PAGE_LIMIT);
    }
}
