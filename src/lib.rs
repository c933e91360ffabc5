// Arca - archival package engine
//
// A self-contained, file-backed store for digital assets and structured
// metadata validated against per-collection schemas. Each archive is a
// directory holding an embedded relational database and a content-addressed
// blob store.

pub mod constants;
pub mod error;
pub mod events;
pub mod hash;
pub mod db;
pub mod archive;
pub mod media;
pub mod collections;
pub mod assets;
pub mod bundle;
pub mod ingest;
pub mod sync;

pub use archive::{Archive, ItemList, PageRange};
pub use assets::{AccessControl, Asset, CreateAsset, UpdateAsset};
pub use collections::{Collection, CollectionType, Metadata, PropertyKind, SchemaProperty};
pub use error::{ArcaError, Result};
pub use events::{ChangeEvent, ChangeSet, EventBus, IngestStatus, ResourceRef};
