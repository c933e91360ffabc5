// Database schema types and query helpers

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use crate::error::Result;

// ----- Archive meta -----

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let result = conn
        .query_row(
            "SELECT value FROM archive_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(result)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO archive_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// ----- Collection -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRow {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub schema: String,
    pub created_at: String,
}

fn map_collection(row: &rusqlite::Row) -> rusqlite::Result<CollectionRow> {
    Ok(CollectionRow {
        id: row.get(0)?,
        title: row.get(1)?,
        parent_id: row.get(2)?,
        schema: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const COLLECTION_COLUMNS: &str = "id, title, parent_id, schema, created_at";

pub fn insert_collection(
    conn: &Connection,
    id: &str,
    title: &str,
    parent_id: Option<&str>,
    schema: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO collections (id, title, parent_id, schema) VALUES (?1, ?2, ?3, ?4)",
        params![id, title, parent_id, schema],
    )?;
    Ok(())
}

pub fn get_collection(conn: &Connection, id: &str) -> Result<Option<CollectionRow>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM collections WHERE id = ?1", COLLECTION_COLUMNS),
            params![id],
            map_collection,
        )
        .optional()?;
    Ok(result)
}

pub fn list_collections(conn: &Connection) -> Result<Vec<CollectionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM collections ORDER BY created_at, id",
        COLLECTION_COLUMNS
    ))?;
    let rows = stmt.query_map([], map_collection)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_child_collections(conn: &Connection, parent_id: &str) -> Result<Vec<CollectionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM collections WHERE parent_id = ?1 ORDER BY created_at, id",
        COLLECTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![parent_id], map_collection)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_collections_page(
    conn: &Connection,
    limit: u64,
    offset: u64,
) -> Result<Vec<CollectionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM collections ORDER BY created_at, id LIMIT ?1 OFFSET ?2",
        COLLECTION_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], map_collection)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count_collections(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn update_collection_title(conn: &Connection, id: &str, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE collections SET title = ?1 WHERE id = ?2",
        params![title, id],
    )?;
    Ok(())
}

pub fn update_collection_schema(conn: &Connection, id: &str, schema: &str) -> Result<()> {
    conn.execute(
        "UPDATE collections SET schema = ?1 WHERE id = ?2",
        params![schema, id],
    )?;
    Ok(())
}

pub fn update_collection_row(
    conn: &Connection,
    id: &str,
    title: &str,
    parent_id: Option<&str>,
    schema: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE collections SET title = ?1, parent_id = ?2, schema = ?3 WHERE id = ?4",
        params![title, parent_id, schema, id],
    )?;
    Ok(())
}

pub fn delete_collection(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM collections WHERE id = ?1", params![id])?;
    Ok(())
}

// ----- Asset -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRow {
    pub id: String,
    pub collection_id: String,
    pub access_control: String,
    pub metadata: String,
    pub redacted_properties: String,
    pub created_at: String,
}

fn map_asset(row: &rusqlite::Row) -> rusqlite::Result<AssetRow> {
    Ok(AssetRow {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        access_control: row.get(2)?,
        metadata: row.get(3)?,
        redacted_properties: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const ASSET_COLUMNS: &str = "id, collection_id, access_control, metadata, redacted_properties, created_at";

pub fn insert_asset(
    conn: &Connection,
    id: &str,
    collection_id: &str,
    access_control: &str,
    metadata: &str,
    redacted_properties: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO assets (id, collection_id, access_control, metadata, redacted_properties)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, collection_id, access_control, metadata, redacted_properties],
    )?;
    Ok(())
}

pub fn get_asset(conn: &Connection, id: &str) -> Result<Option<AssetRow>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS),
            params![id],
            map_asset,
        )
        .optional()?;
    Ok(result)
}

pub fn update_asset_row(
    conn: &Connection,
    id: &str,
    collection_id: &str,
    access_control: &str,
    metadata: &str,
    redacted_properties: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE assets SET collection_id = ?1, access_control = ?2, metadata = ?3,
                           redacted_properties = ?4
         WHERE id = ?5",
        params![collection_id, access_control, metadata, redacted_properties, id],
    )?;
    Ok(())
}

pub fn update_asset_metadata(conn: &Connection, id: &str, metadata: &str) -> Result<()> {
    conn.execute(
        "UPDATE assets SET metadata = ?1 WHERE id = ?2",
        params![metadata, id],
    )?;
    Ok(())
}

pub fn list_assets_in_collection(
    conn: &Connection,
    collection_id: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<AssetRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assets WHERE collection_id = ?1
         ORDER BY created_at, id LIMIT ?2 OFFSET ?3",
        ASSET_COLUMNS
    ))?;
    let rows = stmt.query_map(params![collection_id, limit as i64, offset as i64], map_asset)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count_assets_in_collection(conn: &Connection, collection_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assets WHERE collection_id = ?1",
        params![collection_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn list_all_assets(conn: &Connection, limit: u64, offset: u64) -> Result<Vec<AssetRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assets ORDER BY created_at, id LIMIT ?1 OFFSET ?2",
        ASSET_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], map_asset)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count_all_assets(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn delete_asset(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM assets WHERE id = ?1", params![id])?;
    Ok(())
}

// ----- Media file -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFileRow {
    pub id: String,
    pub asset_id: Option<String>,
    pub mime_type: String,
    pub sha256: String,
    pub created_at: String,
}

fn map_media_file(row: &rusqlite::Row) -> rusqlite::Result<MediaFileRow> {
    Ok(MediaFileRow {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        mime_type: row.get(2)?,
        sha256: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const MEDIA_COLUMNS: &str = "id, asset_id, mime_type, sha256, created_at";

pub fn insert_media_file(
    conn: &Connection,
    id: &str,
    asset_id: Option<&str>,
    mime_type: &str,
    sha256: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO media_files (id, asset_id, mime_type, sha256) VALUES (?1, ?2, ?3, ?4)",
        params![id, asset_id, mime_type, sha256],
    )?;
    Ok(())
}

pub fn get_media_file(conn: &Connection, id: &str) -> Result<Option<MediaFileRow>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM media_files WHERE id = ?1", MEDIA_COLUMNS),
            params![id],
            map_media_file,
        )
        .optional()?;
    Ok(result)
}

pub fn update_media_asset(conn: &Connection, id: &str, asset_id: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE media_files SET asset_id = ?1 WHERE id = ?2",
        params![asset_id, id],
    )?;
    Ok(())
}

pub fn update_media_file_row(
    conn: &Connection,
    id: &str,
    asset_id: Option<&str>,
    mime_type: &str,
    sha256: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE media_files SET asset_id = ?1, mime_type = ?2, sha256 = ?3 WHERE id = ?4",
        params![asset_id, mime_type, sha256, id],
    )?;
    Ok(())
}

pub fn list_media_for_asset(conn: &Connection, asset_id: &str) -> Result<Vec<MediaFileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM media_files WHERE asset_id = ?1 ORDER BY created_at, id",
        MEDIA_COLUMNS
    ))?;
    let rows = stmt.query_map(params![asset_id], map_media_file)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_all_media(conn: &Connection, limit: u64, offset: u64) -> Result<Vec<MediaFileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM media_files ORDER BY created_at, id LIMIT ?1 OFFSET ?2",
        MEDIA_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], map_media_file)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count_all_media(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn find_media_by_hash(conn: &Connection, sha256: &str) -> Result<Option<MediaFileRow>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM media_files WHERE sha256 = ?1 LIMIT 1", MEDIA_COLUMNS),
            params![sha256],
            map_media_file,
        )
        .optional()?;
    Ok(result)
}

pub fn delete_media_file(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM media_files WHERE id = ?1", params![id])?;
    Ok(())
}

// ----- Ingest session -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSessionRow {
    pub id: String,
    pub base_path: String,
    pub collection_id: String,
    pub phase: String,
    pub valid: bool,
    pub use_locator_ids: bool,
    pub created_at: String,
}

fn map_ingest_session(row: &rusqlite::Row) -> rusqlite::Result<IngestSessionRow> {
    Ok(IngestSessionRow {
        id: row.get(0)?,
        base_path: row.get(1)?,
        collection_id: row.get(2)?,
        phase: row.get(3)?,
        valid: row.get(4)?,
        use_locator_ids: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const SESSION_COLUMNS: &str = "id, base_path, collection_id, phase, valid, use_locator_ids, created_at";

pub fn insert_ingest_session(
    conn: &Connection,
    id: &str,
    base_path: &str,
    collection_id: &str,
    use_locator_ids: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_sessions (id, base_path, collection_id, use_locator_ids)
         VALUES (?1, ?2, ?3, ?4)",
        params![id, base_path, collection_id, use_locator_ids],
    )?;
    Ok(())
}

pub fn get_ingest_session(conn: &Connection, id: &str) -> Result<Option<IngestSessionRow>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM ingest_sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            map_ingest_session,
        )
        .optional()?;
    Ok(result)
}

pub fn list_ingest_sessions(conn: &Connection) -> Result<Vec<IngestSessionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingest_sessions ORDER BY created_at, id",
        SESSION_COLUMNS
    ))?;
    let rows = stmt.query_map([], map_ingest_session)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_incomplete_sessions(conn: &Connection) -> Result<Vec<IngestSessionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingest_sessions
         WHERE phase NOT IN ('COMPLETED', 'ERROR')
         ORDER BY created_at, id",
        SESSION_COLUMNS
    ))?;
    let rows = stmt.query_map([], map_ingest_session)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn update_session_phase(conn: &Connection, id: &str, phase: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_sessions SET phase = ?1 WHERE id = ?2",
        params![phase, id],
    )?;
    Ok(())
}

pub fn update_session_use_locator_ids(conn: &Connection, id: &str, value: bool) -> Result<()> {
    conn.execute(
        "UPDATE ingest_sessions SET use_locator_ids = ?1 WHERE id = ?2",
        params![value, id],
    )?;
    Ok(())
}

pub fn update_session_valid(conn: &Connection, id: &str, valid: bool) -> Result<()> {
    conn.execute(
        "UPDATE ingest_sessions SET valid = ?1 WHERE id = ?2",
        params![valid, id],
    )?;
    Ok(())
}

pub fn delete_ingest_session(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM ingest_sessions WHERE id = ?1", params![id])?;
    Ok(())
}

// ----- Staged asset import -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAssetRow {
    pub id: String,
    pub session_id: String,
    pub locator: String,
    pub access_control: String,
    pub redacted_properties: String,
    pub metadata: String,
    pub validation_errors: Option<String>,
    pub phase: String,
}

fn map_ingest_asset(row: &rusqlite::Row) -> rusqlite::Result<IngestAssetRow> {
    Ok(IngestAssetRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        locator: row.get(2)?,
        access_control: row.get(3)?,
        redacted_properties: row.get(4)?,
        metadata: row.get(5)?,
        validation_errors: row.get(6)?,
        phase: row.get(7)?,
    })
}

const INGEST_ASSET_COLUMNS: &str =
    "id, session_id, locator, access_control, redacted_properties, metadata, validation_errors, phase";

#[allow(clippy::too_many_arguments)]
pub fn insert_ingest_asset(
    conn: &Connection,
    id: &str,
    session_id: &str,
    locator: &str,
    access_control: &str,
    redacted_properties: &str,
    metadata: &str,
    validation_errors: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_assets
             (id, session_id, locator, access_control, redacted_properties, metadata, validation_errors)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, session_id, locator, access_control, redacted_properties, metadata, validation_errors],
    )?;
    Ok(())
}

pub fn get_ingest_asset_by_locator(
    conn: &Connection,
    session_id: &str,
    locator: &str,
) -> Result<Option<IngestAssetRow>> {
    let result = conn
        .query_row(
            &format!(
                "SELECT {} FROM ingest_assets WHERE session_id = ?1 AND locator = ?2",
                INGEST_ASSET_COLUMNS
            ),
            params![session_id, locator],
            map_ingest_asset,
        )
        .optional()?;
    Ok(result)
}

pub fn list_ingest_assets(conn: &Connection, session_id: &str) -> Result<Vec<IngestAssetRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingest_assets WHERE session_id = ?1 ORDER BY locator",
        INGEST_ASSET_COLUMNS
    ))?;
    let rows = stmt.query_map(params![session_id], map_ingest_asset)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_ingest_assets_in_phase(
    conn: &Connection,
    session_id: &str,
    phases: &[&str],
) -> Result<Vec<IngestAssetRow>> {
    let placeholders: Vec<String> = (0..phases.len()).map(|i| format!("?{}", i + 2)).collect();
    let sql = format!(
        "SELECT {} FROM ingest_assets WHERE session_id = ?1 AND phase IN ({}) ORDER BY locator",
        INGEST_ASSET_COLUMNS,
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&session_id];
    for phase in phases {
        params_vec.push(phase);
    }
    let rows = stmt.query_map(params_vec.as_slice(), map_ingest_asset)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn update_ingest_asset_phase(conn: &Connection, id: &str, phase: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_assets SET phase = ?1 WHERE id = ?2",
        params![phase, id],
    )?;
    Ok(())
}

pub fn update_ingest_asset_validation(
    conn: &Connection,
    id: &str,
    validation_errors: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE ingest_assets SET validation_errors = ?1 WHERE id = ?2",
        params![validation_errors, id],
    )?;
    Ok(())
}

pub fn update_ingest_asset_metadata(conn: &Connection, id: &str, metadata: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_assets SET metadata = ?1 WHERE id = ?2",
        params![metadata, id],
    )?;
    Ok(())
}

// ----- Staged file import -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFileRow {
    pub id: String,
    pub ingest_asset_id: String,
    pub relative_path: String,
    pub error: Option<String>,
    pub media_id: Option<String>,
}

fn map_ingest_file(row: &rusqlite::Row) -> rusqlite::Result<IngestFileRow> {
    Ok(IngestFileRow {
        id: row.get(0)?,
        ingest_asset_id: row.get(1)?,
        relative_path: row.get(2)?,
        error: row.get(3)?,
        media_id: row.get(4)?,
    })
}

const INGEST_FILE_COLUMNS: &str = "id, ingest_asset_id, relative_path, error, media_id";

pub fn insert_ingest_file(
    conn: &Connection,
    id: &str,
    ingest_asset_id: &str,
    relative_path: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_files (id, ingest_asset_id, relative_path) VALUES (?1, ?2, ?3)",
        params![id, ingest_asset_id, relative_path],
    )?;
    Ok(())
}

pub fn list_ingest_files(conn: &Connection, ingest_asset_id: &str) -> Result<Vec<IngestFileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingest_files WHERE ingest_asset_id = ?1 ORDER BY relative_path",
        INGEST_FILE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![ingest_asset_id], map_ingest_file)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn list_unread_ingest_files(
    conn: &Connection,
    ingest_asset_id: &str,
) -> Result<Vec<IngestFileRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingest_files
         WHERE ingest_asset_id = ?1 AND media_id IS NULL AND error IS NULL
         ORDER BY relative_path",
        INGEST_FILE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![ingest_asset_id], map_ingest_file)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn set_ingest_file_media(conn: &Connection, id: &str, media_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_files SET media_id = ?1, error = NULL WHERE id = ?2",
        params![media_id, id],
    )?;
    Ok(())
}

pub fn set_ingest_file_error(conn: &Connection, id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE ingest_files SET error = ?1 WHERE id = ?2",
        params![error, id],
    )?;
    Ok(())
}

/// Session-wide file totals: (total, read). A file counts as read once it
/// carries either a media reference or an error.
pub fn count_session_files(conn: &Connection, session_id: &str) -> Result<(u64, u64)> {
    let (total, read): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COUNT(CASE WHEN f.media_id IS NOT NULL OR f.error IS NOT NULL THEN 1 END)
         FROM ingest_files f
         JOIN ingest_assets a ON a.id = f.ingest_asset_id
         WHERE a.session_id = ?1",
        params![session_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((total as u64, read as u64))
}

/// All media ids brought in by a session (for cancellation cleanup).
pub fn list_session_media_ids(conn: &Connection, session_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT f.media_id FROM ingest_files f
         JOIN ingest_assets a ON a.id = f.ingest_asset_id
         WHERE a.session_id = ?1 AND f.media_id IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
