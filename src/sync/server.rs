// Sync server: destination side of the mirror. Transactions stage media
// under sync/{tx}/ and never touch the live archive until commit.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::{
    asset_content_hash, media_content_hash, visible_metadata, AcceptedAsset, BeginRequest,
    BeginResponse, MediaDescriptor,
};
use crate::archive::Archive;
use crate::assets::AccessControl;
use crate::collections;
use crate::constants::{
    MAX_PAGE_LIMIT, ROOT_ASSET_COLLECTION_ID, ROOT_DATABASE_COLLECTION_ID, SYNC_TX_TIMEOUT_SECS,
};
use crate::db::schema;
use crate::error::{ArcaError, Result};
use crate::events::{ChangeSet, ResourceRef};
use crate::ingest::bootstrap::apply_collection_specs;
use crate::media;

type Policy<'a> = Box<dyn Fn(&BeginRequest) -> bool + 'a>;

struct SyncTxn {
    request: BeginRequest,
    deadline: Instant,
    want_assets: HashSet<String>,
    want_media: HashSet<String>,
    delete_assets: Vec<String>,
    delete_media: Vec<String>,
    accepted_assets: Vec<AcceptedAsset>,
    accepted_media: Vec<MediaDescriptor>,
}

pub struct SyncServer<'a> {
    archive: &'a Archive,
    transactions: RefCell<HashMap<String, SyncTxn>>,
    policy: Option<Policy<'a>>,
    timeout: Duration,
}

impl<'a> SyncServer<'a> {
    pub fn new(archive: &'a Archive) -> Self {
        Self {
            archive,
            transactions: RefCell::new(HashMap::new()),
            policy: None,
            timeout: Duration::from_secs(SYNC_TX_TIMEOUT_SECS),
        }
    }

    /// Attach a predicate that may reject incoming begin requests.
    pub fn with_policy(archive: &'a Archive, policy: impl Fn(&BeginRequest) -> bool + 'a) -> Self {
        let mut server = Self::new(archive);
        server.policy = Some(Box::new(policy));
        server
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(archive: &'a Archive, timeout: Duration) -> Self {
        let mut server = Self::new(archive);
        server.timeout = timeout;
        server
    }

    fn staging_dir(&self, transaction_id: &str) -> PathBuf {
        self.archive.sync_dir().join(transaction_id)
    }

    /// Drop transactions past their inactivity deadline, staging included.
    fn expire_stale(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .transactions
            .borrow()
            .iter()
            .filter(|(_, txn)| txn.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            log::warn!("Sync transaction {} expired", id);
            self.transactions.borrow_mut().remove(&id);
            let _ = std::fs::remove_dir_all(self.staging_dir(&id));
        }
    }

    /// Content hashes of everything this archive currently holds.
    fn local_hashes(&self) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
        self.archive.unit_of_work(|conn| {
            let mut merged_cache: HashMap<String, Vec<collections::SchemaProperty>> =
                HashMap::new();
            let mut asset_hashes = HashMap::new();
            let mut offset = 0u64;
            loop {
                let rows = schema::list_all_assets(conn, MAX_PAGE_LIMIT, offset)?;
                if rows.is_empty() {
                    break;
                }
                let exhausted = (rows.len() as u64) < MAX_PAGE_LIMIT;
                for row in rows {
                    let merged = match merged_cache.get(&row.collection_id) {
                        Some(merged) => merged.clone(),
                        None => {
                            let merged = collections::merged_schema(conn, &row.collection_id)?;
                            merged_cache.insert(row.collection_id.clone(), merged.clone());
                            merged
                        }
                    };
                    let metadata: collections::Metadata = serde_json::from_str(&row.metadata)?;
                    let redacted: Vec<String> = serde_json::from_str(&row.redacted_properties)?;
                    let visible = visible_metadata(&merged, &redacted, &metadata);
                    let hash = asset_content_hash(
                        AccessControl::parse(&row.access_control)?,
                        &row.collection_id,
                        &visible,
                    )?;
                    asset_hashes.insert(row.id, hash);
                }
                if exhausted {
                    break;
                }
                offset += MAX_PAGE_LIMIT;
            }

            let mut media_hashes = HashMap::new();
            let mut offset = 0u64;
            loop {
                let rows = schema::list_all_media(conn, MAX_PAGE_LIMIT, offset)?;
                if rows.is_empty() {
                    break;
                }
                let exhausted = (rows.len() as u64) < MAX_PAGE_LIMIT;
                for row in rows {
                    let hash =
                        media_content_hash(row.asset_id.as_deref(), &row.mime_type, &row.sha256)?;
                    media_hashes.insert(row.id, hash);
                }
                if exhausted {
                    break;
                }
                offset += MAX_PAGE_LIMIT;
            }

            Ok((asset_hashes, media_hashes))
        })
    }

    /// Step 1: open a transaction, compute what this archive still wants and
    /// what it must delete to mirror the request.
    pub fn begin(&self, request: BeginRequest) -> Result<BeginResponse> {
        self.expire_stale();

        if let Some(policy) = &self.policy {
            if !policy(&request) {
                return Err(ArcaError::SyncRejected);
            }
        }

        let (local_assets, local_media) = self.local_hashes()?;

        let requested_assets: HashSet<&str> =
            request.assets.iter().map(|r| r.id.as_str()).collect();
        let requested_media: HashSet<&str> = request.media.iter().map(|r| r.id.as_str()).collect();

        let want_assets: HashSet<String> = request
            .assets
            .iter()
            .filter(|r| local_assets.get(&r.id) != Some(&r.sha256))
            .map(|r| r.id.clone())
            .collect();
        let want_media: HashSet<String> = request
            .media
            .iter()
            .filter(|r| local_media.get(&r.id) != Some(&r.sha256))
            .map(|r| r.id.clone())
            .collect();

        let delete_assets: Vec<String> = local_assets
            .keys()
            .filter(|id| !requested_assets.contains(id.as_str()))
            .cloned()
            .collect();
        let delete_media: Vec<String> = local_media
            .keys()
            .filter(|id| !requested_media.contains(id.as_str()))
            .cloned()
            .collect();

        let transaction_id = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir_all(self.staging_dir(&transaction_id))?;

        let response = BeginResponse {
            transaction_id: transaction_id.clone(),
            want_assets: want_assets.iter().cloned().collect(),
            want_media: want_media.iter().cloned().collect(),
        };

        self.transactions.borrow_mut().insert(
            transaction_id,
            SyncTxn {
                request,
                deadline: Instant::now() + self.timeout,
                want_assets,
                want_media,
                delete_assets,
                delete_media,
                accepted_assets: Vec::new(),
                accepted_media: Vec::new(),
            },
        );

        Ok(response)
    }

    fn with_txn<T>(
        &self,
        transaction_id: &str,
        f: impl FnOnce(&mut SyncTxn) -> Result<T>,
    ) -> Result<T> {
        self.expire_stale();
        let mut transactions = self.transactions.borrow_mut();
        let txn = transactions
            .get_mut(transaction_id)
            .ok_or_else(|| ArcaError::SyncTransaction(transaction_id.to_string()))?;
        // Sliding inactivity window: every call touches
        txn.deadline = Instant::now() + self.timeout;
        f(txn)
    }

    /// Step 2: collect full asset payloads.
    pub fn accept_assets(&self, transaction_id: &str, assets: Vec<AcceptedAsset>) -> Result<()> {
        self.with_txn(transaction_id, |txn| {
            for asset in assets {
                if !txn.want_assets.contains(&asset.id) {
                    log::warn!("Ignoring unrequested asset {}", asset.id);
                    continue;
                }
                txn.accepted_assets.push(asset);
            }
            Ok(())
        })
    }

    /// Step 2: stage one media file's bytes. The live blob area is not
    /// touched until commit. Bytes the archive already holds under the same
    /// content hash are copied locally instead of drained from the stream.
    pub fn accept_media(
        &self,
        transaction_id: &str,
        descriptor: MediaDescriptor,
        stream: &mut dyn Read,
    ) -> Result<()> {
        let staging = self.staging_dir(transaction_id);
        let wanted = self.with_txn(transaction_id, |txn| {
            Ok(txn.want_media.contains(&descriptor.id))
        })?;
        if !wanted {
            log::warn!("Ignoring unrequested media {}", descriptor.id);
            return Ok(());
        }

        let dest = staging.join(&descriptor.id);

        let existing = self.archive.unit_of_work(|conn| {
            schema::find_media_by_hash(conn, &descriptor.sha256)
        })?;
        let local_copy = existing.and_then(|m| {
            let path = media::original_path(self.archive, &m.id, &m.mime_type);
            path.exists().then_some(path)
        });

        match local_copy {
            Some(path) => {
                std::fs::copy(&path, &dest)?;
            }
            None => {
                let mut out = std::fs::File::create(&dest)?;
                std::io::copy(stream, &mut out)?;
            }
        }

        self.with_txn(transaction_id, |txn| {
            txn.accepted_media.push(descriptor);
            Ok(())
        })
    }

    /// Step 3: replay the transaction in one unit of work. On failure the
    /// staged files are discarded and the live archive is unchanged.
    pub fn commit(&self, transaction_id: &str) -> Result<()> {
        self.expire_stale();
        let txn = self
            .transactions
            .borrow_mut()
            .remove(transaction_id)
            .ok_or_else(|| ArcaError::SyncTransaction(transaction_id.to_string()))?;
        let staging = self.staging_dir(transaction_id);

        let result = self.apply(&txn, &staging);
        let _ = std::fs::remove_dir_all(&staging);

        match result {
            Ok(applied) => {
                // Deleted blobs are unlinked only after the flush succeeded
                for (id, mime_type) in &applied.removed_blobs {
                    media::remove_blob_files(self.archive, id, mime_type);
                }
                self.archive.events().emit_collections(applied.collections);
                self.archive.events().emit_assets(applied.assets);
                self.archive.events().emit_media(applied.media);
                log::info!("Sync transaction {} committed", transaction_id);
                Ok(())
            }
            Err(err) => {
                log::error!("Sync transaction {} failed: {}", transaction_id, err);
                Err(err)
            }
        }
    }

    /// Abort a transaction, discarding its staging area.
    pub fn abort(&self, transaction_id: &str) -> Result<()> {
        self.transactions.borrow_mut().remove(transaction_id);
        let _ = std::fs::remove_dir_all(self.staging_dir(transaction_id));
        Ok(())
    }

    fn apply(&self, txn: &SyncTxn, staging: &std::path::Path) -> Result<AppliedChanges> {
        let mut moved_in: Vec<PathBuf> = Vec::new();

        let result = self.archive.transaction(|conn| {
            // The mirror rewrites parents and children in one pass
            conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

            let mut applied = AppliedChanges::default();

            // 1. Collections: delete ones not in the request, then create or
            //    update the requested forest parent-first.
            let requested: HashSet<&str> = txn
                .request
                .collections
                .iter()
                .map(|c| c.id.as_str())
                .collect();
            for collection in schema::list_collections(conn)? {
                if requested.contains(collection.id.as_str()) {
                    continue;
                }
                if collection.id == ROOT_ASSET_COLLECTION_ID
                    || collection.id == ROOT_DATABASE_COLLECTION_ID
                {
                    continue;
                }
                schema::delete_collection(conn, &collection.id)?;
                applied
                    .collections
                    .deleted
                    .push(ResourceRef::new(collection.id, None));
            }

            let (created, updated) = apply_collection_specs(conn, &txn.request.collections)?;
            applied.collections.created = created
                .into_iter()
                .map(|id| ResourceRef::new(id, None))
                .collect();
            applied.collections.updated = updated
                .into_iter()
                .map(|id| ResourceRef::new(id, None))
                .collect();

            // 2. Assets not in the request
            for asset_id in &txn.delete_assets {
                if let Some(row) = schema::get_asset(conn, asset_id)? {
                    schema::delete_asset(conn, asset_id)?;
                    applied
                        .assets
                        .deleted
                        .push(ResourceRef::new(asset_id.clone(), Some(row.collection_id)));
                }
            }

            // 3. Incoming assets, preserving source identifiers
            for asset in &txn.accepted_assets {
                let metadata_json = serde_json::to_string(&asset.metadata)?;
                let redacted_json = serde_json::to_string(&asset.redacted_properties)?;
                match schema::get_asset(conn, &asset.id)? {
                    Some(_) => {
                        schema::update_asset_row(
                            conn,
                            &asset.id,
                            &asset.collection_id,
                            asset.access_control.as_str(),
                            &metadata_json,
                            &redacted_json,
                        )?;
                        applied.assets.updated.push(ResourceRef::new(
                            asset.id.clone(),
                            Some(asset.collection_id.clone()),
                        ));
                    }
                    None => {
                        schema::insert_asset(
                            conn,
                            &asset.id,
                            &asset.collection_id,
                            asset.access_control.as_str(),
                            &metadata_json,
                            &redacted_json,
                        )?;
                        applied.assets.created.push(ResourceRef::new(
                            asset.id.clone(),
                            Some(asset.collection_id.clone()),
                        ));
                    }
                }
            }

            // 4. Incoming media: hash the staged bytes, move them into the
            //    blob area, derive the rendition, upsert the record.
            for descriptor in &txn.accepted_media {
                let staged = staging.join(&descriptor.id);
                let sha256 = crate::hash::compute_file_sha256(&staged)?;
                let dest =
                    media::original_path(self.archive, &descriptor.id, &descriptor.mime_type);
                std::fs::rename(&staged, &dest)?;
                moved_in.push(dest.clone());

                if media::is_image_mime(&descriptor.mime_type) {
                    let rendition_dest = media::rendition_path(self.archive, &descriptor.id);
                    media::rendition::generate_rendition(
                        &dest,
                        &rendition_dest,
                        &Default::default(),
                    )?;
                    moved_in.push(rendition_dest);
                }

                match schema::get_media_file(conn, &descriptor.id)? {
                    Some(_) => {
                        schema::update_media_file_row(
                            conn,
                            &descriptor.id,
                            descriptor.asset_id.as_deref(),
                            &descriptor.mime_type,
                            &sha256,
                        )?;
                        applied.media.updated.push(ResourceRef::new(
                            descriptor.id.clone(),
                            descriptor.asset_id.clone(),
                        ));
                    }
                    None => {
                        schema::insert_media_file(
                            conn,
                            &descriptor.id,
                            descriptor.asset_id.as_deref(),
                            &descriptor.mime_type,
                            &sha256,
                        )?;
                        applied.media.created.push(ResourceRef::new(
                            descriptor.id.clone(),
                            descriptor.asset_id.clone(),
                        ));
                    }
                }
            }

            // 5. Media not in the request
            for media_id in &txn.delete_media {
                if let Some(row) = schema::get_media_file(conn, media_id)? {
                    schema::delete_media_file(conn, media_id)?;
                    applied
                        .removed_blobs
                        .push((row.id.clone(), row.mime_type.clone()));
                    applied
                        .media
                        .deleted
                        .push(ResourceRef::new(row.id, row.asset_id));
                }
            }

            Ok(applied)
        });

        if result.is_err() {
            // The database rolled back; undo the file moves too
            for path in moved_in {
                let _ = std::fs::remove_file(path);
            }
        }

        result
    }
}

#[derive(Default)]
struct AppliedChanges {
    collections: ChangeSet,
    assets: ChangeSet,
    media: ChangeSet,
    removed_blobs: Vec<(String, String)>,
}
