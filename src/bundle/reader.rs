// Bundle reading: lazy access to manifest, metadata entries, and media.

use std::fs::File;
use std::io;
use std::path::Path;

use zip::ZipArchive;

use super::{Manifest, MetadataFile};
use crate::constants::{BUNDLE_MANIFEST, BUNDLE_MEDIA_FOLDER, BUNDLE_METADATA_FOLDER};
use crate::error::{ArcaError, Result};

pub struct BundleReader {
    zip: ZipArchive<File>,
    root: String,
}

impl BundleReader {
    /// Open a bundle and locate its single top-level directory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let zip = ZipArchive::new(file)?;

        let mut root: Option<String> = None;
        for name in zip.file_names() {
            let top = match name.split('/').next() {
                Some(top) if !top.is_empty() => top,
                _ => continue,
            };
            match &root {
                None => root = Some(top.to_string()),
                Some(existing) if existing == top => {}
                Some(existing) => {
                    return Err(ArcaError::Parse(format!(
                        "bundle has multiple top-level entries ({}, {})",
                        existing, top
                    )));
                }
            }
        }

        let root = root.ok_or_else(|| ArcaError::Parse("bundle is empty".to_string()))?;
        Ok(Self { zip, root })
    }

    /// Parse the optional manifest. A missing manifest is Ok(None); a
    /// malformed one is a parse error.
    pub fn manifest(&mut self) -> Result<Option<Manifest>> {
        let name = format!("{}/{}", self.root, BUNDLE_MANIFEST);
        let entry = match self.zip.by_name(&name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest: Manifest = serde_json::from_reader(entry)
            .map_err(|err| ArcaError::Parse(format!("manifest.json: {}", err)))?;
        Ok(Some(manifest))
    }

    /// Entry names of all metadata files inside the bundle.
    pub fn metadata_entries(&self) -> Vec<String> {
        let prefix = format!("{}/{}/", self.root, BUNDLE_METADATA_FOLDER);
        self.zip
            .file_names()
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".json"))
            .map(|name| name.to_string())
            .collect()
    }

    /// Parse one metadata entry. Errors poison only this entry.
    pub fn read_metadata(&mut self, entry_name: &str) -> Result<MetadataFile> {
        let entry = self.zip.by_name(entry_name)?;
        let file: MetadataFile = serde_json::from_reader(entry)
            .map_err(|err| ArcaError::Parse(format!("{}: {}", entry_name, err)))?;
        Ok(file)
    }

    /// Basenames of all media entries.
    pub fn media_slugs(&self) -> Vec<String> {
        let prefix = format!("{}/{}/", self.root, BUNDLE_MEDIA_FOLDER);
        self.zip
            .file_names()
            .filter(|name| name.starts_with(&prefix) && !name.ends_with('/'))
            .filter_map(|name| name.rsplit('/').next().map(|s| s.to_string()))
            .collect()
    }

    /// Stream one media entry to a destination path.
    pub fn extract_media(&mut self, slug: &str, destination: &Path) -> Result<()> {
        let name = format!("{}/{}/{}", self.root, BUNDLE_MEDIA_FOLDER, slug);
        let mut entry = self.zip.by_name(&name)?;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(destination)?;
        io::copy(&mut entry, &mut out)?;
        Ok(())
    }
}
