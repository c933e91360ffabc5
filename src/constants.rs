// Arca Constants

// Paths
pub const DB_FILENAME: &str = "db.sqlite3";
pub const BLOB_FOLDER: &str = "blob";
pub const SYNC_FOLDER: &str = "sync";

// Reserved collections (auto-created on first open)
pub const ROOT_ASSET_COLLECTION_ID: &str = "$root";
pub const ROOT_ASSET_COLLECTION_TITLE: &str = "Assets";
pub const ROOT_DATABASE_COLLECTION_ID: &str = "$database";
pub const ROOT_DATABASE_COLLECTION_TITLE: &str = "Databases";

// Pagination
pub const MAX_PAGE_LIMIT: u64 = 1000;

// Schema updates validate existing assets in chunks of this size
pub const SCHEMA_VALIDATION_CHUNK: u64 = 100;

// Renditions
pub const RENDITION_WIDTH: u32 = 300;
pub const RENDITION_SUFFIX: &str = "rendition";
pub const RENDITION_EXTENSION: &str = "png";
pub const MEDIA_URI_SCHEME: &str = "media://";

// Sync
pub const SYNC_TX_TIMEOUT_SECS: u64 = 30;
pub const SYNC_PUSH_CHUNK: usize = 200;

// Ingest
pub const FILES_COLUMN: &str = "files";
pub const FILES_SEPARATOR: char = ';';
pub const BUNDLE_EXTENSIONS: [&str; 2] = ["danapack", "zip"];
pub const SPREADSHEET_EXTENSION: &str = "csv";

// Bundle layout
pub const BUNDLE_MANIFEST: &str = "manifest.json";
pub const BUNDLE_METADATA_FOLDER: &str = "metadata";
pub const BUNDLE_MEDIA_FOLDER: &str = "media";

// Accepted media types (extension -> canonical storage extension is 1:1 here)
pub const PDF_EXTENSIONS: [&str; 1] = ["pdf"];
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "tiff", "webp", "bmp"];
pub const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "m4a", "ogg"];
pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mov", "webm", "mkv", "avi"];
pub const SUBTITLE_EXTENSIONS: [&str; 2] = ["srt", "vtt"];

// Hashing
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB
