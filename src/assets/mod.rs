// Asset service: create/update/move/delete, value coercion, referential
// integrity on delete.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::archive::{Archive, ItemList, PageRange};
use crate::collections::{self, Metadata, RawMetadata};
use crate::constants::SCHEMA_VALIDATION_CHUNK;
use crate::db::schema::{self, AssetRow};
use crate::error::{ArcaError, MoveError, ReferenceError, Result, ValidationErrors};
use crate::events::{ChangeSet, ResourceRef};
use crate::media;

pub use crate::collections::properties::cast_or_create_property_value;

/// Per-asset access level. RESTRICTED assets never leave the archive during
/// sync; METADATA_ONLY assets sync without their media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessControl {
    #[serde(rename = "PUBLIC")]
    Public,
    #[serde(rename = "RESTRICTED")]
    Restricted,
    #[serde(rename = "METADATA_ONLY")]
    MetadataOnly,
}

impl AccessControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessControl::Public => "PUBLIC",
            AccessControl::Restricted => "RESTRICTED",
            AccessControl::MetadataOnly => "METADATA_ONLY",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PUBLIC" => Ok(AccessControl::Public),
            "RESTRICTED" => Ok(AccessControl::Restricted),
            "METADATA_ONLY" => Ok(AccessControl::MetadataOnly),
            other => Err(ArcaError::Parse(format!("unknown access level '{}'", other))),
        }
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        AccessControl::Public
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: String,
    pub collection_id: String,
    pub access_control: AccessControl,
    pub metadata: Metadata,
    pub redacted_properties: Vec<String>,
    pub media: Vec<String>,
    pub created_at: String,
}

fn to_asset(conn: &Connection, row: AssetRow) -> Result<Asset> {
    let media = schema::list_media_for_asset(conn, &row.id)?
        .into_iter()
        .map(|m| m.id)
        .collect();
    Ok(Asset {
        access_control: AccessControl::parse(&row.access_control)?,
        metadata: serde_json::from_str(&row.metadata)?,
        redacted_properties: serde_json::from_str(&row.redacted_properties)?,
        media,
        id: row.id,
        collection_id: row.collection_id,
        created_at: row.created_at,
    })
}

pub fn get_asset(conn: &Connection, id: &str) -> Result<Asset> {
    let row = schema::get_asset(conn, id)?
        .ok_or_else(|| ArcaError::DoesNotExist(format!("asset {}", id)))?;
    to_asset(conn, row)
}

pub fn list_assets(
    conn: &Connection,
    collection_id: &str,
    range: PageRange,
) -> Result<ItemList<Asset>> {
    let total = schema::count_assets_in_collection(conn, collection_id)?;
    let rows = schema::list_assets_in_collection(conn, collection_id, range.limit, range.offset)?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(to_asset(conn, row)?);
    }
    Ok(ItemList::page(total, items, range))
}

#[derive(Debug, Clone, Default)]
pub struct CreateAsset {
    pub access_control: AccessControl,
    pub metadata: RawMetadata,
    pub media: Vec<String>,
    /// Used by ingest commit and sync to preserve source identifiers.
    pub force_id: Option<String>,
    pub redacted_properties: Vec<String>,
}

pub fn create_asset(archive: &Archive, collection_id: &str, request: CreateAsset) -> Result<Asset> {
    let mut label_refs = Vec::new();
    let created = archive.transaction(|conn| {
        let merged = collections::merged_schema(conn, collection_id)?;
        let metadata =
            match collections::validate_metadata(conn, &merged, &request.metadata, &mut label_refs)?
            {
                Ok(metadata) => metadata,
                Err(errors) => return Err(ArcaError::Validation(errors)),
            };

        let id = request
            .force_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if schema::get_asset(conn, &id)?.is_some() {
            return Err(ArcaError::Other(format!("asset {} already exists", id)));
        }

        schema::insert_asset(
            conn,
            &id,
            collection_id,
            request.access_control.as_str(),
            &serde_json::to_string(&metadata)?,
            &serde_json::to_string(&request.redacted_properties)?,
        )?;

        for media_id in &request.media {
            schema::get_media_file(conn, media_id)?
                .ok_or_else(|| ArcaError::DoesNotExist(format!("media file {}", media_id)))?;
            schema::update_media_asset(conn, media_id, Some(&id))?;
        }

        get_asset(conn, &id)
    })?;

    // Label records created during coercion are announced with the asset
    let mut created_refs = label_refs;
    created_refs.push(ResourceRef::new(
        created.id.clone(),
        Some(created.collection_id.clone()),
    ));
    archive.events().emit_assets(ChangeSet::created(created_refs));

    crate::ingest::revalidate_sessions(archive)?;

    Ok(created)
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAsset {
    pub metadata: Option<RawMetadata>,
    pub media: Option<Vec<String>>,
    pub access_control: Option<AccessControl>,
    pub redacted_properties: Option<Vec<String>>,
}

/// Update an asset. Fields left as None keep their prior value; supplied
/// metadata replaces the record wholesale after validation.
pub fn update_asset(archive: &Archive, id: &str, request: UpdateAsset) -> Result<Asset> {
    let mut label_refs = Vec::new();
    let updated = archive.transaction(|conn| {
        let existing = get_asset(conn, id)?;
        let merged = collections::merged_schema(conn, &existing.collection_id)?;

        let metadata = match &request.metadata {
            Some(raw) => {
                match collections::validate_metadata(conn, &merged, raw, &mut label_refs)? {
                    Ok(metadata) => metadata,
                    Err(errors) => return Err(ArcaError::Validation(errors)),
                }
            }
            None => existing.metadata.clone(),
        };
        let access_control = request.access_control.unwrap_or(existing.access_control);
        let redacted = request
            .redacted_properties
            .clone()
            .unwrap_or_else(|| existing.redacted_properties.clone());

        schema::update_asset_row(
            conn,
            id,
            &existing.collection_id,
            access_control.as_str(),
            &serde_json::to_string(&metadata)?,
            &serde_json::to_string(&redacted)?,
        )?;

        if let Some(new_media) = &request.media {
            let keep: HashSet<&str> = new_media.iter().map(|s| s.as_str()).collect();
            for old in &existing.media {
                if !keep.contains(old.as_str()) {
                    schema::update_media_asset(conn, old, None)?;
                }
            }
            for media_id in new_media {
                schema::get_media_file(conn, media_id)?
                    .ok_or_else(|| ArcaError::DoesNotExist(format!("media file {}", media_id)))?;
                schema::update_media_asset(conn, media_id, Some(id))?;
            }
        }

        get_asset(conn, id)
    })?;

    archive.events().emit_assets(ChangeSet {
        created: label_refs,
        updated: vec![ResourceRef::new(
            updated.id.clone(),
            Some(updated.collection_id.clone()),
        )],
        deleted: Vec::new(),
    });

    crate::ingest::revalidate_sessions(archive)?;

    Ok(updated)
}

/// Move assets to another collection of the same type. Each asset's metadata
/// must satisfy the destination's merged schema.
pub fn move_assets(archive: &Archive, ids: &[String], destination_id: &str) -> Result<()> {
    let mut label_refs = Vec::new();
    let moved = archive.transaction(|conn| {
        let destination_type = collections::collection_type(conn, destination_id)?;
        let merged = collections::merged_schema(conn, destination_id)?;

        let mut errors: Vec<MoveError> = Vec::new();
        let mut moves: Vec<(String, Metadata)> = Vec::new();

        for id in ids {
            let asset = get_asset(conn, id)?;
            if collections::collection_type(conn, &asset.collection_id)? != destination_type {
                let mut detail = ValidationErrors::new();
                detail.insert(
                    "collection".to_string(),
                    vec!["source and destination collection types differ".to_string()],
                );
                errors.push(MoveError {
                    asset_id: id.clone(),
                    errors: detail,
                });
                continue;
            }

            let raw = collections::properties::metadata_to_raw(&asset.metadata);
            match collections::validate_metadata(conn, &merged, &raw, &mut label_refs)? {
                Ok(metadata) => moves.push((id.clone(), metadata)),
                Err(detail) => errors.push(MoveError {
                    asset_id: id.clone(),
                    errors: detail,
                }),
            }
        }

        if !errors.is_empty() {
            return Err(ArcaError::MoveRejected(errors));
        }

        let mut refs = Vec::new();
        for (id, metadata) in moves {
            let asset = get_asset(conn, &id)?;
            schema::update_asset_row(
                conn,
                &id,
                destination_id,
                asset.access_control.as_str(),
                &serde_json::to_string(&metadata)?,
                &serde_json::to_string(&asset.redacted_properties)?,
            )?;
            refs.push(ResourceRef::new(id, Some(destination_id.to_string())));
        }
        Ok(refs)
    })?;

    archive.events().emit_assets(ChangeSet {
        created: label_refs,
        updated: moved,
        deleted: Vec::new(),
    });

    crate::ingest::revalidate_sessions(archive)?;

    Ok(())
}

/// Delete assets, enforcing referential integrity.
///
/// A referencing asset blocks the delete when its required reference would
/// end up pointing at nothing; otherwise the reference is stripped from the
/// referring asset's metadata.
pub fn delete_assets(archive: &Archive, ids: &[String]) -> Result<()> {
    let delete_set: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();

    let (deleted_refs, media_files) = archive.transaction(|conn| {
        let mut targets = Vec::new();
        let mut target_collections: HashSet<String> = HashSet::new();
        for id in ids {
            let asset = get_asset(conn, id)?;
            target_collections.insert(asset.collection_id.clone());
            targets.push(asset);
        }

        let mut blockers: HashSet<String> = HashSet::new();
        // (referencing asset, property) -> remaining values
        let mut strips: HashMap<(String, String), Vec<String>> = HashMap::new();

        for collection_id in &target_collections {
            for (owner, property) in
                collections::find_properties_referencing_collection(conn, collection_id)?
            {
                for subtree_id in collections::subtree_ids(conn, &owner.id)? {
                    let mut range = PageRange::new(0, SCHEMA_VALIDATION_CHUNK);
                    loop {
                        let rows = schema::list_assets_in_collection(
                            conn,
                            &subtree_id,
                            range.limit,
                            range.offset,
                        )?;
                        if rows.is_empty() {
                            break;
                        }
                        let exhausted = (rows.len() as u64) < range.limit;

                        for row in rows {
                            if delete_set.contains(row.id.as_str()) {
                                continue;
                            }
                            let metadata: Metadata = serde_json::from_str(&row.metadata)?;
                            let values = match metadata.get(&property.id) {
                                Some(values) => values,
                                None => continue,
                            };
                            let remaining: Vec<String> = values
                                .iter()
                                .filter(|v| !delete_set.contains(v.as_str()))
                                .cloned()
                                .collect();
                            if remaining.len() == values.len() {
                                continue;
                            }
                            if property.required && remaining.is_empty() {
                                blockers.insert(row.id.clone());
                            } else {
                                strips.insert((row.id.clone(), property.id.clone()), remaining);
                            }
                        }

                        if exhausted {
                            break;
                        }
                        range = range.next();
                    }
                }
            }
        }

        if !blockers.is_empty() {
            let mut list: Vec<ReferenceError> = blockers
                .into_iter()
                .map(|asset_id| ReferenceError { asset_id })
                .collect();
            list.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
            return Err(ArcaError::ReferentialIntegrity(list));
        }

        for ((asset_id, property_id), remaining) in strips {
            let row = schema::get_asset(conn, &asset_id)?
                .ok_or_else(|| ArcaError::DoesNotExist(format!("asset {}", asset_id)))?;
            let mut metadata: Metadata = serde_json::from_str(&row.metadata)?;
            metadata.insert(property_id, remaining);
            schema::update_asset_metadata(conn, &asset_id, &serde_json::to_string(&metadata)?)?;
        }

        // The asset service owns cleanup of its media references; the rows go
        // here, the on-disk blobs are unlinked after the transaction commits.
        let mut media_files = Vec::new();
        let mut refs = Vec::new();
        for target in &targets {
            for media in schema::list_media_for_asset(conn, &target.id)? {
                schema::delete_media_file(conn, &media.id)?;
                media_files.push(media);
            }
            schema::delete_asset(conn, &target.id)?;
            refs.push(ResourceRef::new(
                target.id.clone(),
                Some(target.collection_id.clone()),
            ));
        }

        Ok((refs, media_files))
    })?;

    for media_file in &media_files {
        media::remove_blob_files(archive, &media_file.id, &media_file.mime_type);
    }

    archive.events().emit_assets(ChangeSet::deleted(deleted_refs));
    if !media_files.is_empty() {
        archive.events().emit_media(ChangeSet::deleted(
            media_files
                .iter()
                .map(|m| ResourceRef::new(m.id.clone(), m.asset_id.clone()))
                .collect(),
        ));
    }

    crate::ingest::revalidate_sessions(archive)?;

    Ok(())
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
