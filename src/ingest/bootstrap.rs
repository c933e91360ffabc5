// Bootstrap: recreate a whole archive from an exported bundle.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use rusqlite::Connection;

use crate::archive::Archive;
use crate::bundle::{BundleReader, CollectionSpec};
use crate::collections;
use crate::constants::{ROOT_ASSET_COLLECTION_ID, ROOT_DATABASE_COLLECTION_ID};
use crate::db::schema;
use crate::error::{ArcaError, Result};

use super::IngestPhase;

/// Order collection specs parent-first. Parents outside the spec set (the
/// reserved roots, or collections that already exist) count as resolved.
pub(crate) fn topological_order(specs: &[CollectionSpec]) -> Result<Vec<CollectionSpec>> {
    let ids: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
    let mut pending: Vec<CollectionSpec> = specs.to_vec();
    let mut resolved: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(specs.len());

    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|spec| {
            let ready = match &spec.parent_id {
                None => true,
                Some(parent) => !ids.contains(parent.as_str()) || resolved.contains(parent),
            };
            if ready {
                resolved.insert(spec.id.clone());
                ordered.push(spec.clone());
            }
            !ready
        });
        if pending.len() == before {
            return Err(ArcaError::InvalidCollection(
                "collection specs contain a parent cycle".to_string(),
            ));
        }
    }

    Ok(ordered)
}

/// Create or update collections from specs, parent-first. The reserved roots
/// are never recreated; their titles are refreshed. Returns (created,
/// updated) collection ids.
pub(crate) fn apply_collection_specs(
    conn: &Connection,
    specs: &[CollectionSpec],
) -> Result<(Vec<String>, Vec<String>)> {
    let mut created = Vec::new();
    let mut updated = Vec::new();

    for spec in topological_order(specs)? {
        let schema_json = collections::properties::schema_to_json(&spec.schema)?;
        match schema::get_collection(conn, &spec.id)? {
            Some(existing) => {
                if existing.title != spec.title
                    || existing.parent_id != spec.parent_id
                    || existing.schema != schema_json
                {
                    let reserved = spec.id == ROOT_ASSET_COLLECTION_ID
                        || spec.id == ROOT_DATABASE_COLLECTION_ID;
                    let parent_id = if reserved { None } else { spec.parent_id.as_deref() };
                    schema::update_collection_row(
                        conn,
                        &spec.id,
                        &spec.title,
                        parent_id,
                        &schema_json,
                    )?;
                    updated.push(spec.id.clone());
                }
            }
            None => {
                schema::insert_collection(
                    conn,
                    &spec.id,
                    &spec.title,
                    spec.parent_id.as_deref(),
                    &schema_json,
                )?;
                created.push(spec.id.clone());
            }
        }
    }

    Ok((created, updated))
}

/// The collection type implied by a spec forest (before the rows exist).
fn spec_type(
    by_id: &HashMap<&str, &CollectionSpec>,
    spec: &CollectionSpec,
) -> Result<collections::CollectionType> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut cursor = spec.id.clone();

    loop {
        if !visited.insert(cursor.clone()) {
            return Err(ArcaError::InvalidCollection(format!(
                "parent cycle at {}",
                cursor
            )));
        }
        match cursor.as_str() {
            ROOT_ASSET_COLLECTION_ID => return Ok(collections::CollectionType::Assets),
            ROOT_DATABASE_COLLECTION_ID => return Ok(collections::CollectionType::Database),
            _ => {}
        }
        let current = by_id.get(cursor.as_str()).ok_or_else(|| {
            ArcaError::InvalidCollection(format!("missing ancestor {}", cursor))
        })?;
        match &current.parent_id {
            Some(parent) => cursor = parent.clone(),
            None => {
                return Err(ArcaError::InvalidCollection(format!(
                    "collection {} is not rooted at a reserved collection",
                    current.id
                )))
            }
        }
    }
}

/// Create a fresh archive from a bundle that carries a manifest: recreate the
/// collection forest with matching ids, then ingest each collection's records
/// in dependency order (controlled databases first, so references resolve).
/// Sessions auto-commit when they complete validly and auto-cancel on error.
pub fn bootstrap_from_bundle(bundle_path: &Path, dest_root: &Path) -> Result<Archive> {
    let mut reader = BundleReader::open(bundle_path)?;
    let manifest = reader
        .manifest()?
        .ok_or_else(|| ArcaError::Parse("bundle has no manifest".to_string()))?;
    let archive_id = manifest
        .archive_id
        .clone()
        .ok_or_else(|| ArcaError::Parse("bundle manifest has no archive id".to_string()))?;

    let archive = Archive::open(dest_root, Some(&archive_id))?;

    archive.transaction(|conn| {
        apply_collection_specs(conn, &manifest.collections)?;
        Ok(())
    })?;

    // Which collections actually carry records in this bundle
    let mut target_ids: Vec<String> = Vec::new();
    for entry_name in reader.metadata_entries() {
        match reader.read_metadata(&entry_name) {
            Ok(file) => {
                if let Some(collection) = file.collection {
                    if !target_ids.contains(&collection) {
                        target_ids.push(collection);
                    }
                }
            }
            Err(err) => log::warn!("Skipping unreadable metadata entry: {}", err),
        }
    }

    // Controlled databases first, then asset collections
    let by_id: HashMap<&str, &CollectionSpec> = manifest
        .collections
        .iter()
        .map(|s| (s.id.as_str(), s))
        .collect();
    target_ids.sort();
    target_ids.sort_by_key(|id| {
        by_id
            .get(id.as_str())
            .and_then(|spec| spec_type(&by_id, spec).ok())
            .map(|t| match t {
                collections::CollectionType::Database => 0,
                collections::CollectionType::Assets => 1,
            })
            .unwrap_or(2)
    });

    for collection_id in target_ids {
        let session_id = super::create_session(&archive, bundle_path, &collection_id)?;
        let stop = AtomicBool::new(false);
        if let Err(err) = super::run_session(&archive, &session_id, &stop) {
            log::error!("Bootstrap session for {} failed: {}", collection_id, err);
            super::cancel_session(&archive, &session_id)?;
            continue;
        }

        let state = super::get_session(&archive, &session_id)?;
        if state.phase == IngestPhase::Completed && state.valid {
            super::commit_session(&archive, &session_id)?;
        } else {
            log::warn!(
                "Bootstrap session for {} ended in {:?} (valid={}); cancelling",
                collection_id,
                state.phase,
                state.valid
            );
            super::cancel_session(&archive, &session_id)?;
        }
    }

    Ok(archive)
}
