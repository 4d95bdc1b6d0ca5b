//! On-disk layout for downloaded images and thumbnails.

use image::{DynamicImage, ImageFormat};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

/// `pins/` holds full images, `thumbnails/` the JPEG previews.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pins_dir: PathBuf,
    thumbs_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            pins_dir: root.join("pins"),
            thumbs_dir: root.join("thumbnails"),
        }
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        if !self.pins_dir.exists() {
            fs::create_dir_all(&self.pins_dir)?;
        }
        if !self.thumbs_dir.exists() {
            fs::create_dir_all(&self.thumbs_dir)?;
        }
        Ok(())
    }

    /// File stem for a pin: `<pin_id>_<first 8 hex of md5(url)>`. The URL
    /// hash keeps a replaced source image from overwriting the old file.
    pub fn stem(pin_id: &str, image_url: &str) -> String {
        let safe: String = pin_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let digest = format!("{:x}", Md5::digest(image_url.as_bytes()));
        format!("{}_{}", safe, &digest[..8])
    }

    pub fn image_path(&self, stem: &str, ext: &str) -> PathBuf {
        self.pins_dir.join(format!("{}.{}", stem, ext))
    }

    pub fn thumbnail_path(&self, stem: &str) -> PathBuf {
        self.thumbs_dir.join(format!("{}_thumb.jpg", stem))
    }

    /// Write both files for one image. Either call may fail independently;
    /// a failure never leaves a partially written file at the final path.
    pub fn store(
        &self,
        stem: &str,
        bytes: &[u8],
        img: &DynamicImage,
        thumbnail_size: u32,
    ) -> std::io::Result<(PathBuf, PathBuf)> {
        self.ensure_dirs()?;

        let ext = image::guess_format(bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("jpg");
        let full = self.image_path(stem, ext);
        atomic_write(&full, bytes)?;

        let thumb = thumbnail_jpeg(img, thumbnail_size)?;
        let thumb_path = self.thumbnail_path(stem);
        atomic_write(&thumb_path, &thumb)?;

        Ok((full, thumb_path))
    }
}

/// Aspect-preserving JPEG preview no larger than `size` on either side.
pub fn thumbnail_jpeg(img: &DynamicImage, size: u32) -> std::io::Result<Vec<u8>> {
    let thumbnail = DynamicImage::ImageRgb8(img.thumbnail(size, size).to_rgb8());
    let mut out = Cursor::new(Vec::new());
    thumbnail
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(std::io::Error::other)?;
    Ok(out.into_inner())
}

/// Write to a sibling `.part` file, fsync, then rename into place.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.part", file_name));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// SHA-256 of the raw image bytes, lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_is_stable_and_url_sensitive() {
        let a = StorageLayout::stem("123", "https://i/a.jpg");
        let b = StorageLayout::stem("123", "https://i/a.jpg");
        let c = StorageLayout::stem("123", "https://i/b.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("123_"));
        assert_eq!(a.len(), "123_".len() + 8);
    }

    #[test]
    fn test_stem_sanitizes_pin_id() {
        let stem = StorageLayout::stem("../evil", "u");
        assert!(stem.starts_with("___evil_"));
    }

    #[test]
    fn test_atomic_write_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_into_missing_dir_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("a.bin");
        assert!(atomic_write(&path, b"x").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_thumbnail_preserves_aspect() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(600, 300));
        let bytes = thumbnail_jpeg(&img, 300).unwrap();
        let thumb = image::load_from_memory(&bytes).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (300, 150));
    }

    #[test]
    fn test_checksum_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
