// Sync client: source side of the mirror. Gathers content hashes, proposes
// the sendable set, then streams whatever the destination still wants.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::Read;

use super::{
    asset_content_hash, media_content_hash, visible_metadata, AcceptedAsset, BeginRequest,
    BeginResponse, HashedRef, MediaDescriptor,
};
use crate::archive::Archive;
use crate::assets::AccessControl;
use crate::bundle::CollectionSpec;
use crate::collections;
use crate::constants::{MAX_PAGE_LIMIT, SYNC_PUSH_CHUNK};
use crate::db::schema;
use crate::error::{ArcaError, Result};
use crate::media;
use crate::sync::SyncServer;

/// The transport seam. The RPC layer implements this against a remote peer;
/// LocalSyncTarget wraps an in-process server.
pub trait SyncTarget {
    fn begin(&mut self, request: BeginRequest) -> Result<BeginResponse>;
    fn accept_assets(&mut self, transaction_id: &str, assets: Vec<AcceptedAsset>) -> Result<()>;
    fn accept_media(
        &mut self,
        transaction_id: &str,
        descriptor: MediaDescriptor,
        stream: &mut dyn Read,
    ) -> Result<()>;
    fn commit(&mut self, transaction_id: &str) -> Result<()>;
}

/// In-process transport: client and server in the same process.
pub struct LocalSyncTarget<'a> {
    pub server: SyncServer<'a>,
}

impl<'a> SyncTarget for LocalSyncTarget<'a> {
    fn begin(&mut self, request: BeginRequest) -> Result<BeginResponse> {
        self.server.begin(request)
    }

    fn accept_assets(&mut self, transaction_id: &str, assets: Vec<AcceptedAsset>) -> Result<()> {
        self.server.accept_assets(transaction_id, assets)
    }

    fn accept_media(
        &mut self,
        transaction_id: &str,
        descriptor: MediaDescriptor,
        stream: &mut dyn Read,
    ) -> Result<()> {
        self.server.accept_media(transaction_id, descriptor, stream)
    }

    fn commit(&mut self, transaction_id: &str) -> Result<()> {
        self.server.commit(transaction_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub transaction_id: String,
    pub pushed_assets: usize,
    pub pushed_media: usize,
    /// True when this request coalesced onto a run already in flight.
    pub coalesced: bool,
}

/// Serialises sync runs for one archive: at most one in flight; a request
/// arriving while one runs coalesces instead of starting another.
pub struct SyncClient<'a> {
    archive: &'a Archive,
    in_flight: Cell<bool>,
}

impl<'a> SyncClient<'a> {
    pub fn new(archive: &'a Archive) -> Self {
        Self {
            archive,
            in_flight: Cell::new(false),
        }
    }

    pub fn run(&self, target: &mut dyn SyncTarget) -> Result<SyncOutcome> {
        if self.in_flight.get() {
            log::info!("Sync already in flight; coalescing");
            return Ok(SyncOutcome {
                coalesced: true,
                ..Default::default()
            });
        }
        self.in_flight.set(true);
        let result = sync_archive(self.archive, target);
        self.in_flight.set(false);
        result
    }
}

struct Gathered {
    request: BeginRequest,
    asset_payloads: HashMap<String, AcceptedAsset>,
    media_payloads: HashMap<String, MediaDescriptor>,
}

fn gather(archive: &Archive) -> Result<Gathered> {
    archive.unit_of_work(|conn| {
        let collections_spec: Vec<CollectionSpec> = collections::list_collections(conn)?
            .into_iter()
            .map(|c| CollectionSpec {
                id: c.id,
                title: c.title,
                parent_id: c.parent_id,
                schema: c.schema,
            })
            .collect();

        let mut merged_cache: HashMap<String, Vec<collections::SchemaProperty>> = HashMap::new();
        let mut asset_refs = Vec::new();
        let mut asset_payloads = HashMap::new();
        let mut media_refs = Vec::new();
        let mut media_payloads = HashMap::new();

        let mut offset = 0u64;
        loop {
            let rows = schema::list_all_assets(conn, MAX_PAGE_LIMIT, offset)?;
            if rows.is_empty() {
                break;
            }
            let exhausted = (rows.len() as u64) < MAX_PAGE_LIMIT;

            for row in rows {
                let access_control = AccessControl::parse(&row.access_control)?;
                // Restricted assets never leave the source
                if access_control == AccessControl::Restricted {
                    continue;
                }

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

                asset_refs.push(HashedRef {
                    id: row.id.clone(),
                    sha256: asset_content_hash(access_control, &row.collection_id, &visible)?,
                });
                asset_payloads.insert(
                    row.id.clone(),
                    AcceptedAsset {
                        id: row.id.clone(),
                        collection_id: row.collection_id.clone(),
                        access_control,
                        metadata: visible,
                        redacted_properties: redacted,
                    },
                );

                // Metadata-only assets sync without their media
                if access_control != AccessControl::Public {
                    continue;
                }
                for media_row in schema::list_media_for_asset(conn, &row.id)? {
                    media_refs.push(HashedRef {
                        id: media_row.id.clone(),
                        sha256: media_content_hash(
                            media_row.asset_id.as_deref(),
                            &media_row.mime_type,
                            &media_row.sha256,
                        )?,
                    });
                    media_payloads.insert(
                        media_row.id.clone(),
                        MediaDescriptor {
                            id: media_row.id,
                            asset_id: media_row.asset_id,
                            mime_type: media_row.mime_type,
                            sha256: media_row.sha256,
                        },
                    );
                }
            }

            if exhausted {
                break;
            }
            offset += MAX_PAGE_LIMIT;
        }

        Ok(Gathered {
            request: BeginRequest {
                archive_id: archive.id().to_string(),
                collections: collections_spec,
                assets: asset_refs,
                media: media_refs,
            },
            asset_payloads,
            media_payloads,
        })
    })
}

/// Mirror this archive onto a destination. The source is the authority: the
/// destination ends up with exactly the sendable collections, assets, and
/// media of the source.
pub fn sync_archive(archive: &Archive, target: &mut dyn SyncTarget) -> Result<SyncOutcome> {
    let mut gathered = gather(archive)?;
    let response = target.begin(gathered.request)?;
    let transaction_id = response.transaction_id.clone();

    let mut wanted_assets = Vec::new();
    for id in &response.want_assets {
        match gathered.asset_payloads.remove(id) {
            Some(payload) => wanted_assets.push(payload),
            None => log::warn!("Destination wants unknown asset {}", id),
        }
    }
    let pushed_assets = wanted_assets.len();
    for chunk in wanted_assets.chunks(SYNC_PUSH_CHUNK) {
        target.accept_assets(&transaction_id, chunk.to_vec())?;
    }

    let mut pushed_media = 0;
    for id in &response.want_media {
        let descriptor = match gathered.media_payloads.remove(id) {
            Some(descriptor) => descriptor,
            None => {
                log::warn!("Destination wants unknown media {}", id);
                continue;
            }
        };
        let source = media::original_path(archive, &descriptor.id, &descriptor.mime_type);
        let mut stream = std::fs::File::open(&source).map_err(|err| {
            ArcaError::Other(format!("media blob {} unreadable: {}", source.display(), err))
        })?;
        target.accept_media(&transaction_id, descriptor, &mut stream)?;
        pushed_media += 1;
    }

    target.commit(&transaction_id)?;

    log::info!(
        "Sync pushed {} assets and {} media files",
        pushed_assets,
        pushed_media
    );

    Ok(SyncOutcome {
        transaction_id,
        pushed_assets,
        pushed_media,
        coalesced: false,
    })
}
