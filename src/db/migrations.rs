// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;
use crate::error::{ArcaError, Result};

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Archive identity and other portable key/value metadata
    CREATE TABLE archive_meta (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );

    -- Collections form a forest rooted at the two reserved collections.
    -- schema is a JSON array of schema properties.
    CREATE TABLE collections (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        parent_id TEXT REFERENCES collections(id),
        schema TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_collections_parent ON collections(parent_id);

    -- Assets: metadata is JSON {property_id: [values]},
    -- redacted_properties is a JSON array of property ids.
    CREATE TABLE assets (
        id TEXT PRIMARY KEY,
        collection_id TEXT NOT NULL REFERENCES collections(id),
        access_control TEXT NOT NULL DEFAULT 'PUBLIC'
            CHECK (access_control IN ('PUBLIC', 'RESTRICTED', 'METADATA_ONLY')),
        metadata TEXT NOT NULL DEFAULT '{}',
        redacted_properties TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_assets_collection ON assets(collection_id);

    -- Media files live on disk at blob/{id}.{ext}; asset_id is set when the
    -- media is attached to an asset.
    CREATE TABLE media_files (
        id TEXT PRIMARY KEY,
        asset_id TEXT REFERENCES assets(id),
        mime_type TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_media_files_asset ON media_files(asset_id);
    CREATE INDEX idx_media_files_sha256 ON media_files(sha256);

    -- Ingest sessions (resumable staging workspaces)
    CREATE TABLE ingest_sessions (
        id TEXT PRIMARY KEY,
        base_path TEXT NOT NULL,
        collection_id TEXT NOT NULL REFERENCES collections(id),
        phase TEXT NOT NULL DEFAULT 'READ_METADATA'
            CHECK (phase IN ('READ_METADATA', 'READ_FILES', 'PROCESS_FILES', 'COMPLETED', 'ERROR')),
        valid INTEGER NOT NULL DEFAULT 1,
        use_locator_ids INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_ingest_sessions_phase ON ingest_sessions(phase);

    -- Staged asset imports, one per source row / bundle record.
    -- locator is the stable identifier of the source record.
    CREATE TABLE ingest_assets (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES ingest_sessions(id) ON DELETE CASCADE,
        locator TEXT NOT NULL,
        access_control TEXT NOT NULL DEFAULT 'PUBLIC'
            CHECK (access_control IN ('PUBLIC', 'RESTRICTED', 'METADATA_ONLY')),
        redacted_properties TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}',
        validation_errors TEXT,
        phase TEXT NOT NULL DEFAULT 'READ_FILES'
            CHECK (phase IN ('READ_METADATA', 'READ_FILES', 'PROCESS_FILES', 'COMPLETED', 'ERROR')),
        UNIQUE(session_id, locator)
    );
    CREATE INDEX idx_ingest_assets_session ON ingest_assets(session_id);
    CREATE INDEX idx_ingest_assets_phase ON ingest_assets(phase);

    -- Staged media-file imports. A file counts as read once it carries either
    -- a media reference or an error.
    CREATE TABLE ingest_files (
        id TEXT PRIMARY KEY,
        ingest_asset_id TEXT NOT NULL REFERENCES ingest_assets(id) ON DELETE CASCADE,
        relative_path TEXT NOT NULL,
        error TEXT,
        media_id TEXT REFERENCES media_files(id)
    );
    CREATE INDEX idx_ingest_files_asset ON ingest_files(ingest_asset_id);
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a database created by a newer build
    if current_version > target_version {
        return Err(ArcaError::DatabaseInconsistency(format!(
            "schema version {} is newer than this build supports (max {})",
            current_version, target_version
        )));
    }

    if current_version == target_version {
        return Ok(());
    }

    // Apply pending migrations one-by-one
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)
            .map_err(|e| ArcaError::DatabaseInconsistency(format!(
                "migration {} failed: {}",
                migration_version, e
            )))?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}
