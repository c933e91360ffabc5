// Bundle writing and export.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

use serde_json::Value;
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{CollectionSpec, Manifest, MetadataFile, MetadataRecord};
use crate::archive::{Archive, PageRange};
use crate::assets;
use crate::collections;
use crate::constants::{BUNDLE_MANIFEST, BUNDLE_MEDIA_FOLDER, BUNDLE_METADATA_FOLDER};
use crate::db::schema;
use crate::error::{ArcaError, Result};
use crate::media;

pub struct BundleWriter {
    zip: ZipWriter<File>,
    root: String,
}

impl BundleWriter {
    pub fn create(path: &Path, root_name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            zip: ZipWriter::new(file),
            root: root_name.to_string(),
        })
    }

    fn options() -> FileOptions {
        FileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    pub fn write_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        let name = format!("{}/{}", self.root, BUNDLE_MANIFEST);
        self.zip.start_file(name, Self::options())?;
        serde_json::to_writer_pretty(&mut self.zip, manifest)?;
        Ok(())
    }

    pub fn write_metadata_file(&mut self, file_name: &str, file: &MetadataFile) -> Result<()> {
        let name = format!("{}/{}/{}", self.root, BUNDLE_METADATA_FOLDER, file_name);
        self.zip.start_file(name, Self::options())?;
        serde_json::to_writer_pretty(&mut self.zip, file)?;
        Ok(())
    }

    /// Copy a media file into the bundle under a fresh random basename.
    /// Returns the slug callers record in `files[]`.
    pub fn add_media_from_path(&mut self, source: &Path) -> Result<String> {
        let extension = source
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .ok_or_else(|| {
                ArcaError::Other(format!("{} has no file extension", source.display()))
            })?;
        let slug = format!("{}.{}", Uuid::new_v4(), extension);
        let name = format!("{}/{}/{}", self.root, BUNDLE_MEDIA_FOLDER, slug);
        self.zip.start_file(name, Self::options())?;
        let mut reader = File::open(source)?;
        io::copy(&mut reader, &mut self.zip)?;
        Ok(slug)
    }

    pub fn finish(mut self) -> Result<()> {
        self.zip.finish()?;
        Ok(())
    }
}

fn root_name_for(out_path: &Path) -> String {
    out_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "export".to_string())
}

fn collection_metadata_file(
    archive: &Archive,
    writer: &mut BundleWriter,
    collection_id: &str,
) -> Result<MetadataFile> {
    let mut records = BTreeMap::new();
    let mut range = PageRange::all();

    loop {
        let page = archive.unit_of_work(|conn| {
            assets::list_assets(conn, collection_id, range)
        })?;
        let exhausted = (page.items.len() as u64) < range.limit;

        for asset in page.items {
            let mut files = Vec::new();
            for media_id in &asset.media {
                let media = archive.unit_of_work(|conn| {
                    schema::get_media_file(conn, media_id)?.ok_or_else(|| {
                        ArcaError::DoesNotExist(format!("media file {}", media_id))
                    })
                })?;
                let source = media::original_path(archive, &media.id, &media.mime_type);
                files.push(writer.add_media_from_path(&source)?);
            }

            let metadata: BTreeMap<String, Value> = asset
                .metadata
                .iter()
                .map(|(key, values)| {
                    (
                        key.clone(),
                        Value::Array(values.iter().map(|v| Value::String(v.clone())).collect()),
                    )
                })
                .collect();

            records.insert(
                asset.id.clone(),
                MetadataRecord {
                    metadata,
                    files,
                    redacted_properties: asset.redacted_properties.clone(),
                    access_control: Some(asset.access_control),
                },
            );
        }

        if exhausted {
            break;
        }
        range = range.next();
    }

    Ok(MetadataFile {
        collection: Some(collection_id.to_string()),
        assets: records,
    })
}

/// Export a single collection (metadata + media) to a bundle.
pub fn export_collection(archive: &Archive, collection_id: &str, out_path: &Path) -> Result<()> {
    archive.unit_of_work(|conn| collections::get_collection(conn, collection_id))?;

    let mut writer = BundleWriter::create(out_path, &root_name_for(out_path))?;
    let file = collection_metadata_file(archive, &mut writer, collection_id)?;
    writer.write_metadata_file(&format!("{}.json", collection_id), &file)?;
    writer.finish()?;

    log::info!("Exported collection {} to {}", collection_id, out_path.display());
    Ok(())
}

/// Export the whole archive: a manifest carrying the archive id and the full
/// collection forest, one metadata file per collection, and all media.
/// The result can recreate a mirror via bootstrap.
pub fn export_archive(archive: &Archive, out_path: &Path) -> Result<()> {
    let all = archive.unit_of_work(|conn| collections::list_collections(conn))?;

    let manifest = Manifest {
        archive_id: Some(archive.id().to_string()),
        collections: all
            .iter()
            .map(|c| CollectionSpec {
                id: c.id.clone(),
                title: c.title.clone(),
                parent_id: c.parent_id.clone(),
                schema: c.schema.clone(),
            })
            .collect(),
    };

    let mut writer = BundleWriter::create(out_path, &root_name_for(out_path))?;
    writer.write_manifest(&manifest)?;

    for collection in &all {
        let file = collection_metadata_file(archive, &mut writer, &collection.id)?;
        if file.assets.is_empty() {
            continue;
        }
        writer.write_metadata_file(&format!("{}.json", collection.id), &file)?;
    }

    writer.finish()?;
    log::info!("Exported archive {} to {}", archive.id(), out_path.display());
    Ok(())
}
