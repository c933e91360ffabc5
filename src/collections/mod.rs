// Collection service: CRUD, merged schemas, validation, reverse references.

pub mod properties;

use std::collections::{BTreeMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::archive::{Archive, PageRange};
use crate::constants::{
    ROOT_ASSET_COLLECTION_ID, ROOT_ASSET_COLLECTION_TITLE, ROOT_DATABASE_COLLECTION_ID,
    ROOT_DATABASE_COLLECTION_TITLE, SCHEMA_VALIDATION_CHUNK,
};
use crate::db::schema::{self, CollectionRow};
use crate::error::{AggregatedError, AggregatedErrors, ArcaError, Result, ValidationErrors};
use crate::events::{ChangeSet, ResourceRef};

pub use properties::{
    cast_or_create_property_value, validate_metadata, Metadata, PropertyKind, RawMetadata,
    SchemaProperty,
};

/// A collection with its parsed schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub schema: Vec<SchemaProperty>,
    pub created_at: String,
}

/// Derived from which reserved root the collection descends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    Assets,
    Database,
}

fn to_collection(row: CollectionRow) -> Result<Collection> {
    let schema = properties::parse_schema(&row.schema)?;
    Ok(Collection {
        id: row.id,
        title: row.title,
        parent_id: row.parent_id,
        schema,
        created_at: row.created_at,
    })
}

/// Create the two reserved root collections if missing. Idempotent.
pub fn ensure_roots(archive: &Archive) -> Result<()> {
    archive.transaction(|conn| {
        for (id, title) in [
            (ROOT_ASSET_COLLECTION_ID, ROOT_ASSET_COLLECTION_TITLE),
            (ROOT_DATABASE_COLLECTION_ID, ROOT_DATABASE_COLLECTION_TITLE),
        ] {
            if schema::get_collection(conn, id)?.is_none() {
                schema::insert_collection(conn, id, title, None, "[]")?;
            }
        }
        Ok(())
    })
}

pub fn get_root_asset_collection(archive: &Archive) -> Result<Collection> {
    ensure_roots(archive)?;
    get_collection(archive.conn(), ROOT_ASSET_COLLECTION_ID)
}

pub fn get_root_database_collection(archive: &Archive) -> Result<Collection> {
    ensure_roots(archive)?;
    get_collection(archive.conn(), ROOT_DATABASE_COLLECTION_ID)
}

pub fn get_collection(conn: &Connection, id: &str) -> Result<Collection> {
    let row = schema::get_collection(conn, id)?
        .ok_or_else(|| ArcaError::DoesNotExist(format!("collection {}", id)))?;
    to_collection(row)
}

pub fn list_collections(conn: &Connection) -> Result<Vec<Collection>> {
    schema::list_collections(conn)?
        .into_iter()
        .map(to_collection)
        .collect()
}

pub fn list_collections_page(
    conn: &Connection,
    range: crate::archive::PageRange,
) -> Result<crate::archive::ItemList<Collection>> {
    let total = schema::count_collections(conn)?;
    let rows = schema::list_collections_page(conn, range.limit, range.offset)?;
    let items: Result<Vec<Collection>> = rows.into_iter().map(to_collection).collect();
    Ok(crate::archive::ItemList::page(total, items?, range))
}

/// Walk parent pointers from the collection to its root. Returns the chain
/// self-first. A cycle or a dangling parent fails with InvalidCollection.
pub fn ancestor_chain(conn: &Connection, id: &str) -> Result<Vec<Collection>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut cursor = Some(id.to_string());

    while let Some(current) = cursor {
        if !visited.insert(current.clone()) {
            return Err(ArcaError::InvalidCollection(format!(
                "parent cycle at {}",
                current
            )));
        }
        let collection = get_collection(conn, &current).map_err(|err| match err {
            ArcaError::DoesNotExist(_) => {
                ArcaError::InvalidCollection(format!("missing ancestor {}", current))
            }
            other => other,
        })?;
        cursor = collection.parent_id.clone();
        chain.push(collection);
    }

    Ok(chain)
}

/// Which reserved root the collection descends from.
pub fn collection_type(conn: &Connection, id: &str) -> Result<CollectionType> {
    let chain = ancestor_chain(conn, id)?;
    let root = chain
        .last()
        .ok_or_else(|| ArcaError::InvalidCollection(id.to_string()))?;
    match root.id.as_str() {
        ROOT_ASSET_COLLECTION_ID => Ok(CollectionType::Assets),
        ROOT_DATABASE_COLLECTION_ID => Ok(CollectionType::Database),
        other => Err(ArcaError::InvalidCollection(format!(
            "collection {} is not rooted at a reserved collection (found {})",
            id, other
        ))),
    }
}

/// The collection and all its descendants.
pub fn subtree_ids(conn: &Connection, root_id: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue = vec![root_id.to_string()];

    while let Some(current) = queue.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for child in schema::list_child_collections(conn, &current)? {
            queue.push(child.id);
        }
        out.push(current);
    }

    Ok(out)
}

/// The merged schema: walk from the collection to the root, prepending each
/// ancestor's properties and skipping ids already claimed at a deeper level.
pub fn merged_schema(conn: &Connection, id: &str) -> Result<Vec<SchemaProperty>> {
    merged_schema_with_override(conn, id, None)
}

/// Merged schema with one collection's own schema replaced — used to dry-run
/// a proposed schema against the existing subtree.
pub fn merged_schema_with_override(
    conn: &Connection,
    id: &str,
    override_schema: Option<(&str, &[SchemaProperty])>,
) -> Result<Vec<SchemaProperty>> {
    let chain = ancestor_chain(conn, id)?;
    let mut merged: Vec<SchemaProperty> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for collection in &chain {
        let own: &[SchemaProperty] = match override_schema {
            Some((override_id, schema)) if override_id == collection.id => schema,
            _ => &collection.schema,
        };
        let fresh: Vec<SchemaProperty> = own
            .iter()
            .filter(|p| !seen.contains(&p.id))
            .cloned()
            .collect();
        for property in &fresh {
            seen.insert(property.id.clone());
        }
        merged.splice(0..0, fresh);
    }

    Ok(merged)
}

fn check_schema_ids(schema: &[SchemaProperty]) -> Result<()> {
    let mut seen = HashSet::new();
    for property in schema {
        if !seen.insert(property.id.as_str()) {
            return Err(ArcaError::InvalidCollection(format!(
                "duplicate property id '{}'",
                property.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct CreateCollection {
    pub title: String,
    pub schema: Vec<SchemaProperty>,
    /// Used by bootstrap and sync to recreate a remote archive with
    /// matching identifiers.
    pub force_id: Option<String>,
}

pub fn create_collection(
    archive: &Archive,
    parent_id: &str,
    request: CreateCollection,
) -> Result<Collection> {
    check_schema_ids(&request.schema)?;

    let created = archive.transaction(|conn| {
        // Parent must exist and be rooted
        collection_type(conn, parent_id)?;

        let id = request
            .force_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if schema::get_collection(conn, &id)?.is_some() {
            return Err(ArcaError::InvalidCollection(format!(
                "collection {} already exists",
                id
            )));
        }

        let schema_json = properties::schema_to_json(&request.schema)?;
        schema::insert_collection(conn, &id, &request.title, Some(parent_id), &schema_json)?;
        get_collection(conn, &id)
    })?;

    archive.events().emit_collections(ChangeSet::created(vec![ResourceRef::new(
        created.id.clone(),
        created.parent_id.clone(),
    )]));

    Ok(created)
}

/// Rename only.
pub fn update_collection(archive: &Archive, id: &str, title: &str) -> Result<()> {
    archive.transaction(|conn| {
        get_collection(conn, id)?;
        schema::update_collection_title(conn, id, title)
    })?;

    archive
        .events()
        .emit_collections(ChangeSet::updated(vec![ResourceRef::new(id, None)]));
    Ok(())
}

/// Replace a collection's schema. Every asset in the collection's subtree is
/// validated against the proposed schema first; on any failure the schema is
/// left unchanged and the per-property error counts are returned.
pub fn update_collection_schema(
    archive: &Archive,
    id: &str,
    new_schema: Vec<SchemaProperty>,
) -> Result<()> {
    check_schema_ids(&new_schema)?;

    let mut label_refs = Vec::new();
    archive.transaction(|conn| {
        get_collection(conn, id)?;

        // message counts keyed per property
        let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();

        for collection_id in subtree_ids(conn, id)? {
            let merged = merged_schema_with_override(conn, &collection_id, Some((id, &new_schema)))?;
            let mut range = PageRange::new(0, SCHEMA_VALIDATION_CHUNK);

            loop {
                let rows = schema::list_assets_in_collection(
                    conn,
                    &collection_id,
                    range.limit,
                    range.offset,
                )?;
                if rows.is_empty() {
                    break;
                }
                let exhausted = (rows.len() as u64) < range.limit;

                for row in rows {
                    let stored: Metadata = serde_json::from_str(&row.metadata)?;
                    let raw = properties::metadata_to_raw(&stored);
                    if let Err(errors) =
                        properties::validate_metadata(conn, &merged, &raw, &mut label_refs)?
                    {
                        for (property_id, messages) in errors {
                            let per_property = counts.entry(property_id).or_default();
                            for message in messages {
                                *per_property.entry(message).or_insert(0) += 1;
                            }
                        }
                    }
                }

                if exhausted {
                    break;
                }
                range = range.next();
            }
        }

        if !counts.is_empty() {
            let mut aggregate = AggregatedErrors::new();
            for (property_id, messages) in counts {
                let mut list: Vec<AggregatedError> = messages
                    .into_iter()
                    .map(|(message, count)| AggregatedError { message, count })
                    .collect();
                list.sort_by(|a, b| b.count.cmp(&a.count));
                aggregate.insert(property_id, list);
            }
            return Err(ArcaError::SchemaValidation(aggregate));
        }

        let schema_json = properties::schema_to_json(&new_schema)?;
        schema::update_collection_schema(conn, id, &schema_json)
    })?;

    archive
        .events()
        .emit_collections(ChangeSet::updated(vec![ResourceRef::new(id, None)]));
    archive.events().emit_assets(ChangeSet::created(label_refs));

    // Staged ingest records validate against the schema that just changed
    crate::ingest::revalidate_sessions(archive)?;

    Ok(())
}

/// Delete an empty collection. Refuses when children or assets remain.
pub fn delete_collection(archive: &Archive, id: &str) -> Result<()> {
    if id == ROOT_ASSET_COLLECTION_ID || id == ROOT_DATABASE_COLLECTION_ID {
        return Err(ArcaError::InvalidCollection(
            "reserved collections cannot be deleted".to_string(),
        ));
    }

    archive.transaction(|conn| {
        get_collection(conn, id)?;
        if !schema::list_child_collections(conn, id)?.is_empty() {
            return Err(ArcaError::InvalidCollection(format!(
                "collection {} still has child collections",
                id
            )));
        }
        if schema::count_assets_in_collection(conn, id)? > 0 {
            return Err(ArcaError::InvalidCollection(format!(
                "collection {} still has assets",
                id
            )));
        }
        schema::delete_collection(conn, id)
    })?;

    archive
        .events()
        .emit_collections(ChangeSet::deleted(vec![ResourceRef::new(id, None)]));
    Ok(())
}

/// Outcome of validating one inbound record.
#[derive(Debug, Clone)]
pub enum ItemValidation {
    Success(Metadata),
    Failure(ValidationErrors),
}

pub fn validate_items_for_collection(
    archive: &Archive,
    id: &str,
    items: &[RawMetadata],
) -> Result<Vec<ItemValidation>> {
    let mut label_refs = Vec::new();
    let out = archive.transaction(|conn| {
        let merged = merged_schema(conn, id)?;
        let mut out = Vec::with_capacity(items.len());
        for raw in items {
            match properties::validate_metadata(conn, &merged, raw, &mut label_refs)? {
                Ok(metadata) => out.push(ItemValidation::Success(metadata)),
                Err(errors) => out.push(ItemValidation::Failure(errors)),
            }
        }
        Ok(out)
    })?;

    // Label records created during coercion are real assets
    archive.events().emit_assets(ChangeSet::created(label_refs));

    Ok(out)
}

/// Every (owner collection, property) pair whose property is a
/// controlled-database reference pointing at the target collection.
pub fn find_properties_referencing_collection(
    conn: &Connection,
    target_id: &str,
) -> Result<Vec<(Collection, SchemaProperty)>> {
    let mut out = Vec::new();
    for collection in list_collections(conn)? {
        for property in &collection.schema {
            if let PropertyKind::DbReference { database_id } = &property.kind {
                if database_id == target_id {
                    out.push((collection.clone(), property.clone()));
                }
            }
        }
    }
    Ok(out)
}

/// The title property: the first free-text property in the merged schema.
pub fn get_title_property(conn: &Connection, id: &str) -> Result<Option<SchemaProperty>> {
    Ok(merged_schema(conn, id)?
        .into_iter()
        .find(|p| p.kind == PropertyKind::FreeText))
}

/// A label-record collection can be created from just a title string: every
/// required property in its merged schema is the title property itself.
pub fn is_label_record_collection(conn: &Connection, id: &str) -> Result<bool> {
    let merged = merged_schema(conn, id)?;
    let title = match merged.iter().find(|p| p.kind == PropertyKind::FreeText) {
        Some(title) => title.clone(),
        None => return Ok(merged.iter().all(|p| !p.required)),
    };
    Ok(merged.iter().all(|p| !p.required || p.id == title.id))
}

/// The metadata for a label record with the given title, when the collection
/// supports label records.
pub fn get_label_record_metadata(
    conn: &Connection,
    id: &str,
    title: &str,
) -> Result<Option<Metadata>> {
    if !is_label_record_collection(conn, id)? {
        return Ok(None);
    }
    let title_property = match get_title_property(conn, id)? {
        Some(property) => property,
        None => return Ok(None),
    };
    let mut metadata = Metadata::new();
    for property in merged_schema(conn, id)? {
        metadata.insert(property.id, Vec::new());
    }
    metadata.insert(title_property.id, vec![title.to_string()]);
    Ok(Some(metadata))
}

pub(crate) fn asset_exists_in_collection(
    conn: &Connection,
    collection_id: &str,
    asset_id: &str,
) -> Result<bool> {
    match schema::get_asset(conn, asset_id)? {
        Some(row) => Ok(row.collection_id == collection_id),
        None => Ok(false),
    }
}

/// Find an existing label record by its title value.
pub(crate) fn find_label_record(
    conn: &Connection,
    collection_id: &str,
    title_property_id: &str,
    label: &str,
) -> Result<Option<String>> {
    let mut range = PageRange::new(0, SCHEMA_VALIDATION_CHUNK);
    loop {
        let rows =
            schema::list_assets_in_collection(conn, collection_id, range.limit, range.offset)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let exhausted = (rows.len() as u64) < range.limit;

        for row in rows {
            let metadata: Metadata = serde_json::from_str(&row.metadata)?;
            if let Some(values) = metadata.get(title_property_id) {
                if values.iter().any(|v| v == label) {
                    return Ok(Some(row.id));
                }
            }
        }

        if exhausted {
            return Ok(None);
        }
        range = range.next();
    }
}

/// Find a label record by label, creating it when the collection supports
/// label records. Returns None when the collection does not, otherwise the
/// record id and whether this call inserted it (callers fold fresh records
/// into the change event of the operation that caused them).
pub(crate) fn get_or_create_label_record(
    conn: &Connection,
    collection_id: &str,
    label: &str,
) -> Result<Option<(String, bool)>> {
    let metadata = match get_label_record_metadata(conn, collection_id, label)? {
        Some(metadata) => metadata,
        None => return Ok(None),
    };
    let title_property = match get_title_property(conn, collection_id)? {
        Some(property) => property,
        None => return Ok(None),
    };

    if let Some(existing) = find_label_record(conn, collection_id, &title_property.id, label)? {
        return Ok(Some((existing, false)));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let metadata_json = serde_json::to_string(&metadata)?;
    schema::insert_asset(conn, &id, collection_id, "PUBLIC", &metadata_json, "[]")?;
    log::debug!("Created label record '{}' in {}", label, collection_id);
    Ok(Some((id, true)))
}
