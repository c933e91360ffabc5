// Sync protocol: a three-step transactional mirror from a source archive to
// a destination archive, deduplicated by content hashes over a canonical
// serialisation.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::assets::AccessControl;
use crate::bundle::CollectionSpec;
use crate::collections::{Metadata, SchemaProperty};
use crate::error::Result;
use crate::hash;

pub use client::{sync_archive, LocalSyncTarget, SyncClient, SyncOutcome, SyncTarget};
pub use server::SyncServer;

/// An id plus the content hash of its canonical serialisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashedRef {
    pub id: String,
    pub sha256: String,
}

/// Step 1: everything the source proposes to mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRequest {
    pub archive_id: String,
    pub collections: Vec<CollectionSpec>,
    pub assets: Vec<HashedRef>,
    pub media: Vec<HashedRef>,
}

/// Step 1 reply: the transaction id and what the server still wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginResponse {
    pub transaction_id: String,
    pub want_assets: Vec<String>,
    pub want_media: Vec<String>,
}

/// Step 2: one asset's full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedAsset {
    pub id: String,
    pub collection_id: String,
    pub access_control: AccessControl,
    pub metadata: Metadata,
    pub redacted_properties: Vec<String>,
}

/// Step 2: one media file's record, streamed alongside its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub id: String,
    pub asset_id: Option<String>,
    pub mime_type: String,
    pub sha256: String,
}

#[derive(Serialize)]
struct AssetDigest<'a> {
    access_control: &'a str,
    collection: &'a str,
    metadata: &'a Metadata,
}

/// The content hash both peers compute for an asset: access level, owning
/// collection, and visible metadata, canonically serialised.
pub fn asset_content_hash(
    access_control: AccessControl,
    collection_id: &str,
    visible: &Metadata,
) -> Result<String> {
    hash::compute_canonical_sha256(&AssetDigest {
        access_control: access_control.as_str(),
        collection: collection_id,
        metadata: visible,
    })
}

#[derive(Serialize)]
struct MediaDigest<'a> {
    asset_id: Option<&'a str>,
    mime_type: &'a str,
    sha256: &'a str,
}

/// The content hash both peers compute for a media file.
pub fn media_content_hash(
    asset_id: Option<&str>,
    mime_type: &str,
    sha256: &str,
) -> Result<String> {
    hash::compute_canonical_sha256(&MediaDigest {
        asset_id,
        mime_type,
        sha256,
    })
}

/// Filter metadata down to what sync exposes: properties marked visible in
/// the merged schema, minus the asset's redacted set.
pub fn visible_metadata(
    merged: &[SchemaProperty],
    redacted: &[String],
    metadata: &Metadata,
) -> Metadata {
    merged
        .iter()
        .filter(|p| p.visible && !redacted.contains(&p.id))
        .filter_map(|p| {
            metadata
                .get(&p.id)
                .map(|values| (p.id.clone(), values.clone()))
        })
        .collect()
}
