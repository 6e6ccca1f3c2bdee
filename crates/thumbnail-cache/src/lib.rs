//! Thumbnail production and caching for the Image Viewer Pro backend
//!
//! This crate turns image files (including HDR/EXR sources) into JPEG
//! thumbnails and caches them on disk, keyed by a digest of the source path,
//! the requested size and the source modification time.
//!
//! # Features
//!
//! - **Decoder chain**: a native decoder that keeps floating point samples, with
//!   a generic 8-bit decoder as fallback
//! - **HDR tone mapping**: gamma correction and peak normalization into 8 bits
//! - **Dual caching**: byte-budgeted in-memory LRU in front of a content-addressed
//!   disk directory, with optional disk eviction by last access
//! - **Parallel batches**: a process-wide rayon pool, order-preserving results,
//!   per-item failure isolation and cooperative cancellation
//! - **Folder scanning**: recursive or flat listings of supported image files

pub mod buffer;
pub mod cache;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod generate;
pub mod lru;
pub mod scan;
pub mod service;
pub mod tonemap;

pub use buffer::{ChannelOrder, DecodedBuffer, SampleKind, Samples};
pub use cache::{CacheStats, CacheStore};
pub use decode::{Codec, Decoded, Decoder, GenericDecoder, NativeDecoder, NativeDecoderConfig};
pub use dispatch::{BatchReport, DispatchError, JobResult, WorkerPool};
pub use error::{DecodeError, PipelineError, ScanError};
pub use generate::{fit_dimensions, BuildOptions, OutputKind, Thumbnail};
pub use lru::LruCache;
pub use scan::{scan_folder, ImageHandle, SUPPORTED_EXTENSIONS};
pub use service::{ImageInfo, ServiceStats, ThumbnailService};
pub use tokio_util::sync::CancellationToken;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Configuration for the whole pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub thumbnail_size: u32,
    pub thumbnail_quality: u8,
    pub full_image_max_size: u32,
    pub full_image_quality: u8,
    pub gamma: f64,
    /// Cache directory; `None` picks the per-user cache dir, or the temp dir
    pub cache_dir: Option<PathBuf>,
    /// Bytes kept in the in-memory hot tier, 0 disables it
    pub memory_budget: usize,
    /// Bytes kept on disk before evicting by last access, `None` is unbounded
    pub disk_budget: Option<u64>,
    /// Worker pool size, `None` for `min(32, cores + 4)`
    pub workers: Option<usize>,
    pub max_file_size: u64,
    pub open_exr: bool,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 200,
            thumbnail_quality: 85,
            full_image_max_size: 2048,
            full_image_quality: 95,
            gamma: tonemap::DEFAULT_GAMMA,
            cache_dir: None,
            memory_budget: 64 * 1024 * 1024, // 64MB
            disk_budget: None,
            workers: None,
            max_file_size: 512 * 1024 * 1024, // 512MB
            open_exr: true,
        }
    }
}

impl ThumbnailConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            bail!("gamma must be a positive number, got {}", self.gamma);
        }
        for (name, quality) in [
            ("thumbnail_quality", self.thumbnail_quality),
            ("full_image_quality", self.full_image_quality),
        ] {
            if !(1..=100).contains(&quality) {
                bail!("{} must be between 1 and 100, got {}", name, quality);
            }
        }
        if self.workers == Some(0) {
            bail!("workers must be at least 1");
        }
        Ok(())
    }

    pub fn decoder_config(&self) -> NativeDecoderConfig {
        NativeDecoderConfig {
            open_exr: self.open_exr,
            max_file_size: self.max_file_size,
        }
    }
}

/// Content address of a cached thumbnail.
///
/// Derived from the absolute source path, the requested size and the source
/// modification time, so editing the source produces a new key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Key for `path` at `size`, reading the modification time from disk.
    /// When the file cannot be stat'ed the key covers path and size only.
    pub fn for_file(path: &Path, size: u32) -> Self {
        let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok());
        Self::from_parts(&absolute, size, modified)
    }

    pub fn from_parts(path: &Path, size: u32, modified: Option<Duration>) -> Self {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_le_bytes());
        if let Some(modified) = modified {
            hasher.update([1u8]);
            hasher.update(modified.as_nanos().to_le_bytes());
        }

        let digest = hasher.finalize();
        let mut key = [0u8; 16];
        // First 16 bytes (32 hex chars) keep file names short
        key.copy_from_slice(&digest[..16]);
        Self(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut key = [0u8; 16];
        hex::decode_to_slice(s, &mut key).ok()?;
        Some(Self(key))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}
