// Database module

pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::constants::{BLOB_FOLDER, DB_FILENAME, SYNC_FOLDER};
use crate::error::Result;

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Get the database path for an archive root
pub fn get_db_path(archive_root: &Path) -> PathBuf {
    archive_root.join(DB_FILENAME)
}

/// Get the blob folder path for an archive root
pub fn get_blob_path(archive_root: &Path) -> PathBuf {
    archive_root.join(BLOB_FOLDER)
}

/// Get the sync staging folder path for an archive root
pub fn get_sync_path(archive_root: &Path) -> PathBuf {
    archive_root.join(SYNC_FOLDER)
}

/// Initialize archive folder structure
pub fn init_archive_folders(archive_root: &Path) -> Result<()> {
    std::fs::create_dir_all(archive_root)?;
    std::fs::create_dir_all(archive_root.join(BLOB_FOLDER))?;
    std::fs::create_dir_all(archive_root.join(SYNC_FOLDER))?;
    Ok(())
}
