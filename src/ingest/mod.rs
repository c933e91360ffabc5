// Ingest engine: resumable staging of records and media from a bundle or
// spreadsheet source, committed atomically into real assets.

pub mod bootstrap;
pub mod session;
pub mod spreadsheet;

use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::archive::Archive;
use crate::collections::{self, RawMetadata};
use crate::db::schema;
use crate::error::{ArcaError, Result, ValidationErrors};
use crate::events::{ChangeSet, ResourceRef};
use crate::media;

pub use bootstrap::bootstrap_from_bundle;
pub use session::run_session;

/// Session / staged-asset lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestPhase {
    ReadMetadata,
    ReadFiles,
    ProcessFiles,
    Completed,
    Error,
}

impl IngestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestPhase::ReadMetadata => "READ_METADATA",
            IngestPhase::ReadFiles => "READ_FILES",
            IngestPhase::ProcessFiles => "PROCESS_FILES",
            IngestPhase::Completed => "COMPLETED",
            IngestPhase::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "READ_METADATA" => Ok(IngestPhase::ReadMetadata),
            "READ_FILES" => Ok(IngestPhase::ReadFiles),
            "PROCESS_FILES" => Ok(IngestPhase::ProcessFiles),
            "COMPLETED" => Ok(IngestPhase::Completed),
            "ERROR" => Ok(IngestPhase::Error),
            other => Err(ArcaError::Parse(format!("unknown ingest phase '{}'", other))),
        }
    }
}

/// One staged media-file import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    pub id: String,
    pub relative_path: String,
    pub error: Option<String>,
    pub media_id: Option<String>,
}

/// One staged asset import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedAsset {
    pub id: String,
    pub locator: String,
    pub access_control: String,
    pub redacted_properties: Vec<String>,
    pub metadata: RawMetadata,
    pub validation_errors: Option<ValidationErrors>,
    pub phase: IngestPhase,
    pub files: Vec<StagedFile>,
}

/// A session with its staged imports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSessionState {
    pub id: String,
    pub base_path: String,
    pub collection_id: String,
    pub phase: IngestPhase,
    pub valid: bool,
    pub assets: Vec<StagedAsset>,
}

fn to_staged_asset(conn: &Connection, row: schema::IngestAssetRow) -> Result<StagedAsset> {
    let files = schema::list_ingest_files(conn, &row.id)?
        .into_iter()
        .map(|f| StagedFile {
            id: f.id,
            relative_path: f.relative_path,
            error: f.error,
            media_id: f.media_id,
        })
        .collect();
    let validation_errors = match &row.validation_errors {
        Some(json) => Some(serde_json::from_str(json)?),
        None => None,
    };
    Ok(StagedAsset {
        phase: IngestPhase::parse(&row.phase)?,
        metadata: serde_json::from_str(&row.metadata)?,
        redacted_properties: serde_json::from_str(&row.redacted_properties)?,
        validation_errors,
        files,
        id: row.id,
        locator: row.locator,
        access_control: row.access_control,
    })
}

/// Create a new ingest session for a source path targeting a collection.
pub fn create_session(archive: &Archive, base_path: &Path, collection_id: &str) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    archive.transaction(|conn| {
        collections::get_collection(conn, collection_id)?;
        schema::insert_ingest_session(
            conn,
            &id,
            &base_path.to_string_lossy(),
            collection_id,
            false,
        )
    })?;
    log::info!("Created ingest session {} for {}", id, base_path.display());
    Ok(id)
}

pub fn get_session(archive: &Archive, session_id: &str) -> Result<IngestSessionState> {
    archive.unit_of_work(|conn| {
        let row = schema::get_ingest_session(conn, session_id)?
            .ok_or_else(|| ArcaError::DoesNotExist(format!("ingest session {}", session_id)))?;
        let mut assets = Vec::new();
        for staged in schema::list_ingest_assets(conn, session_id)? {
            assets.push(to_staged_asset(conn, staged)?);
        }
        Ok(IngestSessionState {
            phase: IngestPhase::parse(&row.phase)?,
            id: row.id,
            base_path: row.base_path,
            collection_id: row.collection_id,
            valid: row.valid,
            assets,
        })
    })
}

pub fn list_sessions(archive: &Archive) -> Result<Vec<String>> {
    archive.unit_of_work(|conn| {
        Ok(schema::list_ingest_sessions(conn)?
            .into_iter()
            .map(|s| s.id)
            .collect())
    })
}

/// Ask a running session to stop at its next check point.
pub fn request_stop(archive: &Archive, session_id: &str) {
    archive
        .stopping_sessions
        .borrow_mut()
        .insert(session_id.to_string());
}

/// Resume every incomplete session (called after archive open).
pub fn resume_sessions(archive: &Archive) -> Result<()> {
    let sessions = archive.unit_of_work(|conn| schema::list_incomplete_sessions(conn))?;
    for session in sessions {
        log::info!("Resuming ingest session {}", session.id);
        let stop = std::sync::atomic::AtomicBool::new(false);
        if let Err(err) = session::run_session(archive, &session.id, &stop) {
            log::error!("Resume of session {} failed: {}", session.id, err);
        }
    }
    Ok(())
}

/// Promote a session's staged imports into real assets, then delete the
/// session. Runs in one transaction; bundle-supplied locator ids are
/// preserved, falling back to updating an existing asset on collision.
pub fn commit_session(archive: &Archive, session_id: &str) -> Result<Vec<String>> {
    let mut label_refs = Vec::new();
    let (created, updated) = archive.transaction(|conn| {
        let session = schema::get_ingest_session(conn, session_id)?
            .ok_or_else(|| ArcaError::DoesNotExist(format!("ingest session {}", session_id)))?;
        let merged = collections::merged_schema(conn, &session.collection_id)?;

        let mut created: Vec<ResourceRef> = Vec::new();
        let mut updated: Vec<ResourceRef> = Vec::new();

        for item in schema::list_ingest_assets(conn, session_id)? {
            let raw: RawMetadata = serde_json::from_str(&item.metadata)?;
            let metadata =
                match collections::validate_metadata(conn, &merged, &raw, &mut label_refs)? {
                    Ok(metadata) => metadata,
                    Err(errors) => return Err(ArcaError::Validation(errors)),
                };
            let metadata_json = serde_json::to_string(&metadata)?;

            let media_ids: Vec<String> = schema::list_ingest_files(conn, &item.id)?
                .into_iter()
                .filter_map(|f| f.media_id)
                .collect();

            let asset_id = if session.use_locator_ids {
                item.locator.clone()
            } else {
                uuid::Uuid::new_v4().to_string()
            };

            match schema::get_asset(conn, &asset_id)? {
                Some(existing) => {
                    schema::update_asset_row(
                        conn,
                        &asset_id,
                        &existing.collection_id,
                        &item.access_control,
                        &metadata_json,
                        &item.redacted_properties,
                    )?;
                    for media_id in &media_ids {
                        schema::update_media_asset(conn, media_id, Some(&asset_id))?;
                    }
                    updated.push(ResourceRef::new(asset_id, Some(existing.collection_id)));
                }
                None => {
                    schema::insert_asset(
                        conn,
                        &asset_id,
                        &session.collection_id,
                        &item.access_control,
                        &metadata_json,
                        &item.redacted_properties,
                    )?;
                    for media_id in &media_ids {
                        schema::update_media_asset(conn, media_id, Some(&asset_id))?;
                    }
                    created.push(ResourceRef::new(
                        asset_id,
                        Some(session.collection_id.clone()),
                    ));
                }
            }
        }

        // Cascades delete the staged rows
        schema::delete_ingest_session(conn, session_id)?;

        Ok((created, updated))
    })?;

    let ids: Vec<String> = created
        .iter()
        .chain(updated.iter())
        .map(|r| r.id.clone())
        .collect();

    // Label records created while validating staged metadata are announced
    // alongside the promoted assets
    let mut all_created = label_refs;
    all_created.extend(created);

    archive.events().emit_assets(ChangeSet {
        created: all_created,
        updated,
        deleted: Vec::new(),
    });

    // Other staged sessions may reference the assets that just landed
    revalidate_sessions(archive)?;

    log::info!("Committed ingest session {}", session_id);
    Ok(ids)
}

/// Cancel a session: stop the active run, delete every media file the
/// session created, delete the session row.
pub fn cancel_session(archive: &Archive, session_id: &str) -> Result<()> {
    request_stop(archive, session_id);

    // The staged file rows reference the media rows, so the session (and its
    // cascaded staging) goes first.
    let media_ids = archive.transaction(|conn| {
        let media_ids = schema::list_session_media_ids(conn, session_id)?;
        schema::delete_ingest_session(conn, session_id)?;
        Ok(media_ids)
    })?;
    if !media_ids.is_empty() {
        media::delete(archive, &media_ids)?;
    }

    archive.stopping_sessions.borrow_mut().remove(session_id);

    log::info!("Cancelled ingest session {}", session_id);
    Ok(())
}

/// Walk every staged asset of every incomplete session through its target
/// schema again, refreshing per-item validation errors and session validity.
pub fn revalidate_sessions(archive: &Archive) -> Result<()> {
    let sessions = archive.unit_of_work(|conn| schema::list_incomplete_sessions(conn))?;
    for session in sessions {
        revalidate_session(archive, &session.id)?;
    }
    Ok(())
}

fn revalidate_session(archive: &Archive, session_id: &str) -> Result<()> {
    let mut label_refs = Vec::new();
    archive.transaction(|conn| {
        let session = match schema::get_ingest_session(conn, session_id)? {
            Some(session) => session,
            None => return Ok(()),
        };

        let merged = match collections::merged_schema(conn, &session.collection_id) {
            Ok(merged) => merged,
            Err(ArcaError::DoesNotExist(_)) | Err(ArcaError::InvalidCollection(_)) => {
                schema::update_session_valid(conn, session_id, false)?;
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        let mut valid = true;
        for item in schema::list_ingest_assets(conn, session_id)? {
            let raw: RawMetadata = serde_json::from_str(&item.metadata)?;
            match collections::validate_metadata(conn, &merged, &raw, &mut label_refs)? {
                Ok(_) => schema::update_ingest_asset_validation(conn, &item.id, None)?,
                Err(errors) => {
                    valid = false;
                    let json = serde_json::to_string(&errors)?;
                    schema::update_ingest_asset_validation(conn, &item.id, Some(&json))?;
                }
            }
        }

        schema::update_session_valid(conn, session_id, valid)
    })?;

    archive.events().emit_assets(ChangeSet::created(label_refs));
    Ok(())
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
