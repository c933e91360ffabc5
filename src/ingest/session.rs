// Ingest session execution.
//
// The run loop is resumable: all progress lives in the staged tables, and the
// stop flag is checked before each staged asset and before each media file.
// Re-running a session picks up exactly where it left off.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::archive::Archive;
use crate::bundle::BundleReader;
use crate::collections::{self, properties, RawMetadata, SchemaProperty};
use crate::constants::{BUNDLE_EXTENSIONS, FILES_COLUMN, FILES_SEPARATOR};
use crate::db::schema::{self, IngestFileRow, IngestSessionRow};
use crate::error::{ArcaError, Result};
use crate::events::{ChangeEvent, IngestStatus};
use crate::media::{self, MediaFile, MediaSource};

use super::{spreadsheet, IngestPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Bundle,
    Spreadsheet,
}

fn source_kind(base_path: &str) -> SourceKind {
    let extension = Path::new(base_path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match extension {
        Some(ext) if BUNDLE_EXTENSIONS.contains(&ext.as_str()) => SourceKind::Bundle,
        _ => SourceKind::Spreadsheet,
    }
}

/// Run (or resume) an ingest session. Idempotent and re-entrant-protected:
/// a second call while the session is active logs and returns.
pub fn run_session(archive: &Archive, session_id: &str, stop: &AtomicBool) -> Result<()> {
    {
        let mut active = archive.active_sessions.borrow_mut();
        if !active.insert(session_id.to_string()) {
            log::info!("Ingest session {} is already running", session_id);
            return Ok(());
        }
    }

    let result = run_inner(archive, session_id, stop);

    archive.active_sessions.borrow_mut().remove(session_id);
    archive.stopping_sessions.borrow_mut().remove(session_id);

    if let Err(err) = &result {
        log::error!("Ingest session {} failed: {}", session_id, err);
        let _ = archive.unit_of_work(|conn| {
            schema::update_session_phase(conn, session_id, IngestPhase::Error.as_str())
        });
    }

    result
}

fn should_stop(archive: &Archive, session_id: &str, stop: &AtomicBool) -> bool {
    stop.load(Ordering::Relaxed) || archive.stopping_sessions.borrow().contains(session_id)
}

fn load_session(archive: &Archive, session_id: &str) -> Result<IngestSessionRow> {
    archive.unit_of_work(|conn| {
        schema::get_ingest_session(conn, session_id)?
            .ok_or_else(|| ArcaError::DoesNotExist(format!("ingest session {}", session_id)))
    })
}

fn run_inner(archive: &Archive, session_id: &str, stop: &AtomicBool) -> Result<()> {
    let session = load_session(archive, session_id)?;

    match IngestPhase::parse(&session.phase)? {
        IngestPhase::ReadMetadata => {
            read_metadata_phase(archive, &session)?;
            let session = load_session(archive, session_id)?;
            read_files_phase(archive, &session, stop)
        }
        IngestPhase::ReadFiles | IngestPhase::ProcessFiles => {
            read_files_phase(archive, &session, stop)
        }
        IngestPhase::Completed | IngestPhase::Error => Ok(()),
    }
}

fn emit_status(archive: &Archive, session_id: &str, phase: IngestPhase, total: u64, read: u64) {
    archive.events().emit(&ChangeEvent::Ingest(IngestStatus {
        session_id: session_id.to_string(),
        phase: phase.as_str().to_string(),
        total_files: total,
        files_read: read,
    }));
}

// ----- READ_METADATA -----

fn read_metadata_phase(archive: &Archive, session: &IngestSessionRow) -> Result<()> {
    emit_status(archive, &session.id, IngestPhase::ReadMetadata, 0, 0);

    match source_kind(&session.base_path) {
        SourceKind::Bundle => read_bundle_metadata(archive, session)?,
        SourceKind::Spreadsheet => read_spreadsheet_metadata(archive, session)?,
    }

    archive.unit_of_work(|conn| {
        schema::update_session_phase(conn, &session.id, IngestPhase::ReadFiles.as_str())
    })
}

fn read_bundle_metadata(archive: &Archive, session: &IngestSessionRow) -> Result<()> {
    let mut reader = BundleReader::open(Path::new(&session.base_path))?;

    // A manifest marks the bundle as carrying explicit identifiers; commit
    // preserves them via the record locators.
    if reader.manifest()?.is_some() {
        archive.unit_of_work(|conn| {
            schema::update_session_use_locator_ids(conn, &session.id, true)
        })?;
    }

    for entry_name in reader.metadata_entries() {
        let file = match reader.read_metadata(&entry_name) {
            Ok(file) => file,
            Err(err) => {
                // Parse errors poison only this entry
                log::warn!("Skipping unreadable metadata entry: {}", err);
                archive.unit_of_work(|conn| {
                    schema::update_session_valid(conn, &session.id, false)
                })?;
                continue;
            }
        };

        if let Some(target) = &file.collection {
            if target != &session.collection_id {
                continue;
            }
        }

        for (locator, record) in &file.assets {
            let raw: RawMetadata = record
                .metadata
                .iter()
                .map(|(key, value)| (key.clone(), properties::value_list(value)))
                .collect();
            let access_control = record
                .access_control
                .map(|a| a.as_str())
                .unwrap_or("PUBLIC");
            read_metadata_object(
                archive,
                session,
                raw,
                &record.files,
                locator,
                access_control,
                &record.redacted_properties,
                false,
            )?;
        }
    }

    Ok(())
}

fn read_spreadsheet_metadata(archive: &Archive, session: &IngestSessionRow) -> Result<()> {
    let sheets = spreadsheet::read_sheets(Path::new(&session.base_path))?;

    for sheet in sheets {
        for (index, row) in sheet.rows.iter().enumerate() {
            let locator = format!("{},{}", sheet.name, index);

            let files: Vec<String> = row
                .get(FILES_COLUMN)
                .map(|value| {
                    value
                        .split(FILES_SEPARATOR)
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let raw: RawMetadata = row
                .iter()
                .filter(|(header, _)| header.as_str() != FILES_COLUMN)
                .map(|(header, value)| {
                    (header.clone(), vec![Value::String(value.clone())])
                })
                .collect();

            read_metadata_object(archive, session, raw, &files, &locator, "PUBLIC", &[], true)?;
        }
    }

    Ok(())
}

/// Stage one record. Deduplicates on (session, locator); validates against
/// the target collection and stores the outcome with the staged row.
#[allow(clippy::too_many_arguments)]
pub fn read_metadata_object(
    archive: &Archive,
    session: &IngestSessionRow,
    raw: RawMetadata,
    files: &[String],
    locator: &str,
    access_control: &str,
    redacted_properties: &[String],
    convert: bool,
) -> Result<()> {
    let mut label_refs = Vec::new();
    archive.transaction(|conn| {
        if schema::get_ingest_asset_by_locator(conn, &session.id, locator)?.is_some() {
            return Ok(());
        }

        let merged = collections::merged_schema(conn, &session.collection_id)?;
        let staged = if convert {
            convert_labels(conn, &merged, raw, &mut label_refs)?
        } else {
            raw
        };

        let validation = properties::validate_metadata(conn, &merged, &staged, &mut label_refs)?;
        let errors_json = match &validation {
            Ok(_) => None,
            Err(errors) => Some(serde_json::to_string(errors)?),
        };

        let id = uuid::Uuid::new_v4().to_string();
        schema::insert_ingest_asset(
            conn,
            &id,
            &session.id,
            locator,
            access_control,
            &serde_json::to_string(redacted_properties)?,
            &serde_json::to_string(&staged)?,
            errors_json.as_deref(),
        )?;

        for relative_path in files {
            let file_id = uuid::Uuid::new_v4().to_string();
            schema::insert_ingest_file(conn, &file_id, &id, relative_path)?;
        }

        if validation.is_err() {
            schema::update_session_valid(conn, &session.id, false)?;
        }

        Ok(())
    })?;

    // Label records created while coercing this record are real assets
    archive.events().emit_assets(crate::events::ChangeSet::created(label_refs));

    Ok(())
}

/// Map human column labels to merged-schema property ids (case-insensitive)
/// and coerce each value to its property's variant. Structurally impossible
/// values are kept raw so validation records the failure.
fn convert_labels(
    conn: &rusqlite::Connection,
    merged: &[SchemaProperty],
    raw: RawMetadata,
    created: &mut Vec<crate::events::ResourceRef>,
) -> Result<RawMetadata> {
    let by_label: HashMap<String, &SchemaProperty> = merged
        .iter()
        .map(|p| (p.label.to_lowercase(), p))
        .collect();

    let mut out = RawMetadata::new();
    for (key, values) in raw {
        let property = match by_label.get(&key.to_lowercase()) {
            Some(property) => *property,
            None => match merged.iter().find(|p| p.id == key) {
                Some(property) => property,
                None => continue,
            },
        };

        let mut coerced = Vec::new();
        for value in values {
            match properties::cast_or_create_property_value(conn, property, &value, created)? {
                Ok(Some(text)) => coerced.push(Value::String(text)),
                Ok(None) => {}
                Err(_) => coerced.push(value),
            }
        }
        out.insert(property.id.clone(), coerced);
    }

    Ok(out)
}

// ----- READ_FILES -----

fn read_files_phase(
    archive: &Archive,
    session: &IngestSessionRow,
    stop: &AtomicBool,
) -> Result<()> {
    let kind = source_kind(&session.base_path);
    let mut reader = match kind {
        SourceKind::Bundle => Some(BundleReader::open(Path::new(&session.base_path))?),
        SourceKind::Spreadsheet => None,
    };
    let base_dir = spreadsheet::media_base_dir(Path::new(&session.base_path));

    let (total, mut read) =
        archive.unit_of_work(|conn| schema::count_session_files(conn, &session.id))?;
    emit_status(archive, &session.id, IngestPhase::ReadFiles, total, read);

    let staged = archive.unit_of_work(|conn| {
        schema::list_ingest_assets_in_phase(
            conn,
            &session.id,
            &[
                IngestPhase::ReadFiles.as_str(),
                IngestPhase::ProcessFiles.as_str(),
            ],
        )
    })?;

    for item in staged {
        if should_stop(archive, &session.id, stop) {
            log::info!("Ingest session {} stopping", session.id);
            return Ok(());
        }

        archive.unit_of_work(|conn| {
            schema::update_ingest_asset_phase(conn, &item.id, IngestPhase::ProcessFiles.as_str())
        })?;
        emit_status(archive, &session.id, IngestPhase::ProcessFiles, total, read);

        let unread =
            archive.unit_of_work(|conn| schema::list_unread_ingest_files(conn, &item.id))?;
        for file in unread {
            if should_stop(archive, &session.id, stop) {
                log::info!("Ingest session {} stopping", session.id);
                return Ok(());
            }

            match stage_file(archive, reader.as_mut(), &base_dir, &file) {
                Ok(media) => {
                    archive.unit_of_work(|conn| {
                        schema::set_ingest_file_media(conn, &file.id, &media.id)
                    })?;
                }
                Err(err) => {
                    log::error!("Failed to stage {}: {}", file.relative_path, err);
                    archive.unit_of_work(|conn| {
                        schema::set_ingest_file_error(conn, &file.id, error_code(&err))
                    })?;
                }
            }
            read += 1;
            emit_status(archive, &session.id, IngestPhase::ReadFiles, total, read);
        }

        archive.unit_of_work(|conn| {
            schema::update_ingest_asset_phase(conn, &item.id, IngestPhase::Completed.as_str())
        })?;
    }

    archive.unit_of_work(|conn| {
        schema::update_session_phase(conn, &session.id, IngestPhase::Completed.as_str())
    })?;
    emit_status(archive, &session.id, IngestPhase::Completed, total, read);

    Ok(())
}

fn stage_file(
    archive: &Archive,
    reader: Option<&mut BundleReader>,
    base_dir: &Path,
    file: &IngestFileRow,
) -> Result<MediaFile> {
    match reader {
        Some(reader) => {
            // Bundle media entries are addressed by basename
            let slug = file
                .relative_path
                .rsplit('/')
                .next()
                .unwrap_or(file.relative_path.as_str());
            let extension = Path::new(slug)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .ok_or_else(|| ArcaError::UnsupportedMediaType(slug.to_string()))?;
            media::put(
                archive,
                MediaSource::Extract {
                    extension,
                    extract_to: Box::new(move |dest| reader.extract_media(slug, dest)),
                },
            )
        }
        None => {
            let source = base_dir.join(&file.relative_path);
            media::put(archive, MediaSource::Path(&source))
        }
    }
}

/// Per-file ingest error codes recorded on the staged file row.
fn error_code(err: &ArcaError) -> &'static str {
    match err {
        ArcaError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
        ArcaError::Io(_) | ArcaError::Bundle(_) => "IO_ERROR",
        _ => "UNEXPECTED_ERROR",
    }
}
