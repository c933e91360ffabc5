// Rendition generation
//
// Creates display-friendly PNG derivatives of stored images, scaled to a
// fixed width.

use std::path::Path;

use image::imageops::FilterType;

use crate::error::Result;

/// Options for rendition generation.
#[derive(Debug, Clone)]
pub struct RenditionOptions {
    pub max_width: u32,
}

impl Default for RenditionOptions {
    fn default() -> Self {
        Self {
            max_width: crate::constants::RENDITION_WIDTH,
        }
    }
}

/// Generate a PNG rendition of an image file. The image is scaled down to
/// `max_width` preserving aspect ratio; smaller images are kept at size.
pub fn generate_rendition(
    source_path: &Path,
    output_path: &Path,
    options: &RenditionOptions,
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let img = image::open(source_path)?;

    let scaled = if img.width() > options.max_width {
        let height = (img.height() as u64 * options.max_width as u64 / img.width() as u64) as u32;
        img.resize(options.max_width, height.max(1), FilterType::Triangle)
    } else {
        img
    };

    // Write through a temp file so a crash never leaves a partial rendition
    let tmp_path = output_path.with_extension("tmp.png");
    scaled.save(&tmp_path)?;
    std::fs::rename(&tmp_path, output_path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, _| Rgb([(x % 255) as u8, 0, 0]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_rendition_scales_down_to_width() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source.png");
        let output = tmp.path().join("out.rendition.png");
        write_test_image(&source, 600, 400);

        generate_rendition(&source, &output, &RenditionOptions { max_width: 300 }).unwrap();

        let rendition = image::open(&output).unwrap();
        assert_eq!(rendition.width(), 300);
        assert_eq!(rendition.height(), 200);
    }

    #[test]
    fn test_small_image_kept_at_size() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("small.png");
        let output = tmp.path().join("small.rendition.png");
        write_test_image(&source, 120, 80);

        generate_rendition(&source, &output, &RenditionOptions::default()).unwrap();

        let rendition = image::open(&output).unwrap();
        assert_eq!(rendition.width(), 120);
    }

    #[test]
    fn test_non_image_fails() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("not-an-image.png");
        std::fs::write(&source, b"plain text").unwrap();
        let output = tmp.path().join("out.png");

        assert!(generate_rendition(&source, &output, &RenditionOptions::default()).is_err());
    }
}
