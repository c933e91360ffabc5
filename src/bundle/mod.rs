// Bundle codec: the portable zip format used by ingest, export, and sync
// bootstrap. A bundle is a zip archive with a single top-level directory
// holding manifest.json (optional), metadata/*.json, and media/*.

pub mod reader;
pub mod writer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assets::AccessControl;
use crate::collections::SchemaProperty;

pub use reader::BundleReader;
pub use writer::{export_archive, export_collection, BundleWriter};

/// A collection as serialized into a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub schema: Vec<SchemaProperty>,
}

/// The optional bundle manifest. Bundles that carry one can recreate an
/// archive with matching identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub archive_id: Option<String>,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
}

/// One record inside a metadata file. `metadata` values may be scalars or
/// lists; `files` reference entries under `media/` by basename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<AccessControl>,
}

/// One metadata/*.json entry: records keyed by locator, optionally pinned to
/// a target collection. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, MetadataRecord>,
}
