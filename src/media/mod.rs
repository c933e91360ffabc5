// Media store: content-addressed blobs with mime gating, SHA-256 hashing,
// and derived renditions.

pub mod rendition;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::archive::Archive;
use crate::constants::{
    AUDIO_EXTENSIONS, IMAGE_EXTENSIONS, MEDIA_URI_SCHEME, PDF_EXTENSIONS, RENDITION_EXTENSION,
    RENDITION_SUFFIX, SUBTITLE_EXTENSIONS, VIDEO_EXTENSIONS,
};
use crate::db::schema;
use crate::error::{ArcaError, Result};
use crate::events::{ChangeSet, ResourceRef};

pub use crate::db::schema::MediaFileRow as MediaFile;

/// Map an accepted file extension to its mime type.
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "tiff" => "image/tiff",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt",
        _ => return None,
    };
    Some(mime)
}

/// The canonical storage extension for a mime type. Blobs always live under
/// this extension so the on-disk name can be rebuilt from the record alone.
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let ext = match mime_type {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/tiff" => "tiff",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        "audio/flac" => "flac",
        "audio/mp4" => "m4a",
        "audio/ogg" => "ogg",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        "application/x-subrip" => "srt",
        "text/vtt" => "vtt",
        _ => return None,
    };
    Some(ext)
}

pub fn is_image_mime(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

/// All accepted extensions (pdf, images, audio, video, subtitles).
pub fn accepted_extensions() -> Vec<&'static str> {
    let mut out = Vec::new();
    out.extend_from_slice(&PDF_EXTENSIONS);
    out.extend_from_slice(&IMAGE_EXTENSIONS);
    out.extend_from_slice(&AUDIO_EXTENSIONS);
    out.extend_from_slice(&VIDEO_EXTENSIONS);
    out.extend_from_slice(&SUBTITLE_EXTENSIONS);
    out
}

/// Where a media file's bytes come from: a path to copy, or a callback that
/// writes them to the destination (bundle extraction, sync streaming).
pub enum MediaSource<'a> {
    Path(&'a Path),
    Extract {
        extension: String,
        extract_to: Box<dyn FnOnce(&Path) -> Result<()> + 'a>,
    },
}

impl<'a> MediaSource<'a> {
    fn extension(&self) -> Result<String> {
        match self {
            MediaSource::Path(path) => path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .ok_or_else(|| {
                    ArcaError::UnsupportedMediaType(format!(
                        "{} has no file extension",
                        path.display()
                    ))
                }),
            MediaSource::Extract { extension, .. } => Ok(extension.to_ascii_lowercase()),
        }
    }
}

pub fn original_path(archive: &Archive, id: &str, mime_type: &str) -> PathBuf {
    let ext = extension_for_mime(mime_type).unwrap_or("bin");
    archive.blob_dir().join(format!("{}.{}", id, ext))
}

pub fn rendition_path(archive: &Archive, id: &str) -> PathBuf {
    archive
        .blob_dir()
        .join(format!("{}.{}.{}", id, RENDITION_SUFFIX, RENDITION_EXTENSION))
}

/// The opaque rendition URI for a media file.
pub fn rendition_uri(id: &str) -> String {
    format!(
        "{}{}.{}.{}",
        MEDIA_URI_SCHEME, id, RENDITION_SUFFIX, RENDITION_EXTENSION
    )
}

/// Resolve a `media://` URI back to an absolute path under the blob area.
pub fn uri_to_path(archive: &Archive, uri: &str) -> Result<PathBuf> {
    let slug = uri
        .strip_prefix(MEDIA_URI_SCHEME)
        .ok_or_else(|| ArcaError::Parse(format!("not a media URI: {}", uri)))?;
    if slug.contains('/') || slug.contains('\\') || slug.contains("..") {
        return Err(ArcaError::Parse(format!("invalid media slug: {}", slug)));
    }
    Ok(archive.blob_dir().join(slug))
}

/// Copy a source into the blob area, hash it, generate a rendition for
/// images, and persist the record. On any failure after bytes touch disk,
/// the partial files are removed. Unsupported types never touch disk.
pub fn put(archive: &Archive, source: MediaSource) -> Result<MediaFile> {
    let extension = source.extension()?;
    let mime_type = mime_for_extension(&extension)
        .ok_or_else(|| ArcaError::UnsupportedMediaType(extension.clone()))?;

    let id = Uuid::new_v4().to_string();
    let dest = original_path(archive, &id, mime_type);
    let rendition_dest = rendition_path(archive, &id);

    let write_result = match source {
        MediaSource::Path(path) => std::fs::copy(path, &dest).map(|_| ()).map_err(ArcaError::from),
        MediaSource::Extract { extract_to, .. } => extract_to(&dest),
    };
    if let Err(err) = write_result {
        cleanup(&dest, &rendition_dest);
        return Err(err);
    }

    let sha256 = match crate::hash::compute_file_sha256(&dest) {
        Ok(sha) => sha,
        Err(err) => {
            cleanup(&dest, &rendition_dest);
            return Err(err);
        }
    };

    // Renditions are generated for images only; a failure there fails the put
    if is_image_mime(mime_type) {
        if let Err(err) =
            rendition::generate_rendition(&dest, &rendition_dest, &Default::default())
        {
            cleanup(&dest, &rendition_dest);
            return Err(err);
        }
    }

    let insert_result = archive.transaction(|conn| {
        schema::insert_media_file(conn, &id, None, mime_type, &sha256)?;
        schema::get_media_file(conn, &id)?
            .ok_or_else(|| ArcaError::DoesNotExist(format!("media file {}", id)))
    });

    let media = match insert_result {
        Ok(media) => media,
        Err(err) => {
            cleanup(&dest, &rendition_dest);
            return Err(err);
        }
    };

    archive.events().emit_media(ChangeSet::created(vec![ResourceRef::new(
        media.id.clone(),
        None,
    )]));

    Ok(media)
}

pub fn list_media(
    conn: &rusqlite::Connection,
    range: crate::archive::PageRange,
) -> Result<crate::archive::ItemList<MediaFile>> {
    let total = schema::count_all_media(conn)?;
    let items = schema::list_all_media(conn, range.limit, range.offset)?;
    Ok(crate::archive::ItemList::page(total, items, range))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDeleteResult {
    pub id: String,
    pub error: Option<String>,
}

/// Delete media files: unlink original and rendition, remove the record.
/// Returns a per-id result list. Asset references are the asset service's
/// responsibility and are not touched here.
pub fn delete(archive: &Archive, ids: &[String]) -> Result<Vec<MediaDeleteResult>> {
    let mut results = Vec::with_capacity(ids.len());
    let mut deleted = Vec::new();

    for id in ids {
        let outcome = archive.transaction(|conn| {
            let media = schema::get_media_file(conn, id)?
                .ok_or_else(|| ArcaError::DoesNotExist(format!("media file {}", id)))?;
            schema::delete_media_file(conn, id)?;
            Ok(media)
        });

        match outcome {
            Ok(media) => {
                remove_blob_files(archive, &media.id, &media.mime_type);
                deleted.push(ResourceRef::new(media.id.clone(), media.asset_id.clone()));
                results.push(MediaDeleteResult {
                    id: id.clone(),
                    error: None,
                });
            }
            Err(err) => results.push(MediaDeleteResult {
                id: id.clone(),
                error: Some(err.to_string()),
            }),
        }
    }

    archive.events().emit_media(ChangeSet::deleted(deleted));

    Ok(results)
}

/// Best-effort unlink of a media file's blobs (original + rendition).
pub(crate) fn remove_blob_files(archive: &Archive, id: &str, mime_type: &str) {
    let original = original_path(archive, id, mime_type);
    if let Err(err) = std::fs::remove_file(&original) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", original.display(), err);
        }
    }
    let rendition = rendition_path(archive, id);
    if let Err(err) = std::fs::remove_file(&rendition) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", rendition.display(), err);
        }
    }
}

fn cleanup(dest: &Path, rendition_dest: &Path) {
    let _ = std::fs::remove_file(dest);
    let _ = std::fs::remove_file(rendition_dest);
}
