//! Folder scanning for supported image files

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ScanError;

/// Supported image file extensions (lowercase, without the dot)
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "exr", "hdr", "pic", "psd",
];

/// Snapshot of a source file taken at scan time. The file may change or
/// disappear afterwards; later stages cope with that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Lowercase extension with its leading dot, or empty
    pub extension: String,
    pub is_supported: bool,
}

impl ImageHandle {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            is_supported: is_supported(path),
            extension,
        })
    }

    /// Whether the source is a floating point format that needs tone mapping
    pub fn is_hdr(&self) -> bool {
        matches!(self.extension.as_str(), ".exr" | ".hdr" | ".pic")
    }
}

/// Check if a path has a supported image extension (case-insensitive)
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// List the supported image files in `dir`, sorted case-insensitively by file
/// name. Only the root path can fail the scan; unreadable entries, non-files and
/// unsupported extensions are skipped.
pub fn scan_folder(dir: &Path, recursive: bool) -> Result<Vec<ImageHandle>, ScanError> {
    if !dir.exists() {
        return Err(ScanError::NotFound(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut images: Vec<ImageHandle> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.path().is_file() && is_supported(entry.path()))
        .filter_map(|entry| match ImageHandle::from_path(entry.path()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping file that vanished during scan");
                None
            }
        })
        .collect();

    images.sort_by_cached_key(|image| image.name.to_lowercase());
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_flat_scan_filters_and_sorts() -> Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join("a.png"), vec![0u8; 2048])?;
        fs::write(temp_dir.path().join("b.txt"), b"notes")?;
        fs::write(temp_dir.path().join("c.EXR"), vec![0u8; 10240])?;
        fs::create_dir(temp_dir.path().join("nested"))?;
        fs::write(temp_dir.path().join("nested").join("d.jpg"), b"x")?;

        let images = scan_folder(temp_dir.path(), false)?;
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "c.EXR"]);

        assert_eq!(images[0].size, 2048);
        assert_eq!(images[0].extension, ".png");
        assert_eq!(images[1].size, 10240);
        assert_eq!(images[1].extension, ".exr");
        assert!(images[1].is_hdr());
        assert!(images.iter().all(|i| i.is_supported && i.modified.is_some()));
        Ok(())
    }

    #[test]
    fn test_recursive_scan() -> Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join("Zebra.jpg"), b"x")?;
        let nested = temp_dir.path().join("one").join("two");
        fs::create_dir_all(&nested)?;
        fs::write(nested.join("apple.tif"), b"x")?;
        fs::write(nested.join("mango.webp"), b"x")?;
        fs::write(nested.join("readme.md"), b"x")?;

        let images = scan_folder(temp_dir.path(), true)?;
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["apple.tif", "mango.webp", "Zebra.jpg"]);
        assert_eq!(images[0].path, nested.join("apple.tif"));
        Ok(())
    }

    #[test]
    fn test_directory_with_image_extension_is_skipped() -> Result<()> {
        let temp_dir = tempdir()?;
        fs::create_dir(temp_dir.path().join("album.jpg"))?;
        assert!(scan_folder(temp_dir.path(), false)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_root_errors() -> Result<()> {
        let temp_dir = tempdir()?;
        let missing = temp_dir.path().join("missing");
        assert!(matches!(scan_folder(&missing, false), Err(ScanError::NotFound(_))));

        let file = temp_dir.path().join("a.png");
        fs::write(&file, b"x")?;
        assert!(matches!(scan_folder(&file, true), Err(ScanError::NotADirectory(_))));
        Ok(())
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported(Path::new("photo.JPG")));
        assert!(is_supported(Path::new("/a/b/render.exr")));
        assert!(!is_supported(Path::new("notes.txt")));
        assert!(!is_supported(Path::new("no_extension")));
    }
}
