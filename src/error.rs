// Arca Error Types

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-property validation failures: property id -> human-readable messages.
pub type ValidationErrors = BTreeMap<String, Vec<String>>;

/// One distinct validation message and how many assets produced it.
/// Used when a schema update is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatedError {
    pub message: String,
    pub count: usize,
}

/// Aggregated schema-update failures: property id -> distinct messages with counts.
pub type AggregatedErrors = BTreeMap<String, Vec<AggregatedError>>;

/// A referencing asset that blocks a delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceError {
    pub asset_id: String,
}

/// A single asset that could not be moved, with its validation failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveError {
    pub asset_id: String,
    pub errors: ValidationErrors,
}

#[derive(Error, Debug)]
pub enum ArcaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bundle error: {0}")]
    Bundle(#[from] zip::result::ZipError),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] csv::Error),

    #[error("Rendition error: {0}")]
    Rendition(#[from] image::ImageError),

    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    #[error("Database inconsistency: {0}")]
    DatabaseInconsistency(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Invalid collection: {0}")]
    InvalidCollection(String),

    #[error("Validation failed")]
    Validation(ValidationErrors),

    #[error("Schema update rejected")]
    SchemaValidation(AggregatedErrors),

    #[error("Assets are still referenced")]
    ReferentialIntegrity(Vec<ReferenceError>),

    #[error("Move rejected")]
    MoveRejected(Vec<MoveError>),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Sync transaction not found or expired: {0}")]
    SyncTransaction(String),

    #[error("Sync request rejected by policy")]
    SyncRejected,

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for ArcaError {
    fn from(err: anyhow::Error) -> Self {
        ArcaError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArcaError>;
