//! The thumbnail service: codec, cache store and worker pool behind one handle
//!
//! A single `ThumbnailService` is built at start-up and shared (behind an
//! `Arc`) by every request. Tests build their own with an isolated cache dir.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheStats, CacheStore};
use crate::decode::Codec;
use crate::dispatch::{timed_batch, BatchReport, JobResult, Progress, WorkerPool};
use crate::error::PipelineError;
use crate::generate::{build, BuildOptions, OutputKind, Thumbnail};
use crate::{CacheKey, ThumbnailConfig};

/// Decoded image properties, without producing a thumbnail
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: String,
    pub size_bytes: u64,
    pub is_hdr: bool,
    pub decoder: String,
}

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub workers: usize,
    pub decoders: Vec<&'static str>,
    pub cache: CacheStats,
    pub thumbnails_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
}

impl ServiceStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

pub struct ThumbnailService {
    config: ThumbnailConfig,
    codec: Codec,
    cache: CacheStore,
    pool: WorkerPool,
    counters: Counters,
}

impl ThumbnailService {
    pub fn new(config: ThumbnailConfig) -> Result<Self> {
        let codec = Codec::with_config(config.decoder_config());
        Self::with_codec(config, codec)
    }

    /// Build a service around a custom decoder chain
    pub fn with_codec(config: ThumbnailConfig, codec: Codec) -> Result<Self> {
        config.validate().context("Invalid thumbnail configuration")?;

        let cache = match &config.cache_dir {
            Some(dir) => CacheStore::open(dir, config.memory_budget, config.disk_budget)?,
            None => CacheStore::open_default(config.memory_budget, config.disk_budget)?,
        };
        let pool = WorkerPool::new(config.workers.unwrap_or_else(WorkerPool::default_size))?;

        info!(
            cache_dir = %cache.cache_dir().display(),
            workers = pool.size(),
            decoders = ?codec.decoder_names(),
            "thumbnail service ready"
        );

        Ok(Self {
            config,
            codec,
            cache,
            pool,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    fn build_options(&self, kind: OutputKind, target_size: u32) -> BuildOptions {
        let quality = match kind {
            OutputKind::Thumbnail => self.config.thumbnail_quality,
            OutputKind::FullImage => self.config.full_image_quality,
        };
        BuildOptions { target_size, quality, gamma: self.config.gamma }
    }

    /// Get a thumbnail, generating and caching it on a miss. Blocking; call it
    /// from the worker pool.
    pub fn thumbnail(&self, path: &Path, size: u32) -> Result<Thumbnail, PipelineError> {
        let result = self.thumbnail_inner(path, size);
        match &result {
            Ok(_) => self.counters.served.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn thumbnail_inner(&self, path: &Path, size: u32) -> Result<Thumbnail, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::NotFound(path.to_path_buf()));
        }

        let key = CacheKey::for_file(path, size);
        if let Some(data) = self.cache.get(&key) {
            if let Some(thumbnail) = Thumbnail::from_cached(data) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(thumbnail);
            }
            debug!(key = %key, "cached entry unreadable, rebuilding");
            self.cache.invalidate(&key);
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let decoded = self.codec.decode(path)?;
        let thumbnail = build(decoded.buffer, &self.build_options(OutputKind::Thumbnail, size))?;
        debug!(
            path = %path.display(),
            decoder = decoded.decoder,
            width = thumbnail.width,
            height = thumbnail.height,
            "thumbnail generated"
        );

        self.cache.put(&key, &thumbnail.bytes);
        Ok(thumbnail)
    }

    /// Export the full image, or a capped version when `max_size` is non-zero.
    /// Exports are not cached.
    pub fn full_image(&self, path: &Path, max_size: u32) -> Result<Thumbnail, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::NotFound(path.to_path_buf()));
        }
        let decoded = self.codec.decode(path)?;
        build(decoded.buffer, &self.build_options(OutputKind::FullImage, max_size))
    }

    pub fn image_info(&self, path: &Path) -> Result<ImageInfo, PipelineError> {
        let metadata = std::fs::metadata(path).map_err(|_| PipelineError::NotFound(path.to_path_buf()))?;
        let decoded = self.codec.decode(path)?;

        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        Ok(ImageInfo {
            width: decoded.buffer.width(),
            height: decoded.buffer.height(),
            channels: decoded.buffer.channels(),
            format,
            size_bytes: metadata.len(),
            is_hdr: decoded.buffer.kind().is_hdr(),
            decoder: decoded.decoder.to_string(),
        })
    }

    /// Generate thumbnails for many files in parallel on the pool
    pub fn generate_batch(&self, paths: &[PathBuf], size: u32, cancel: &CancellationToken) -> BatchReport {
        self.generate_batch_with_progress(paths, size, cancel, |_, _| {})
    }

    /// Like [`generate_batch`](Self::generate_batch), calling `progress(done, total)`
    /// as each item finishes
    pub fn generate_batch_with_progress<F>(
        &self,
        paths: &[PathBuf],
        size: u32,
        cancel: &CancellationToken,
        progress: F,
    ) -> BatchReport
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let total = paths.len();
        let completed = Progress::default();

        let report = timed_batch(|| {
            let outcomes = self.pool.run_batch(paths, cancel, |path| {
                let outcome = self.thumbnail(path, size);
                progress(completed.record(), total);
                outcome
            });
            paths
                .iter()
                .zip(outcomes)
                .map(|(path, outcome)| JobResult {
                    path: path.clone(),
                    outcome: outcome.map_err(PipelineError::from).and_then(|inner| inner),
                })
                .collect()
        });

        info!(
            total = report.total(),
            succeeded = report.succeeded,
            cache_hits = report.cache_hits,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
        report
    }

    /// Generate thumbnails one after another on the calling thread
    pub fn generate_sequential(&self, paths: &[PathBuf], size: u32, cancel: &CancellationToken) -> BatchReport {
        timed_batch(|| {
            paths
                .iter()
                .map(|path| {
                    let outcome = if cancel.is_cancelled() {
                        Err(PipelineError::Cancelled)
                    } else {
                        self.thumbnail(path, size)
                    };
                    JobResult { path: path.clone(), outcome }
                })
                .collect()
        })
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            workers: self.pool.size(),
            decoders: self.codec.decoder_names(),
            cache: self.cache.stats(),
            thumbnails_served: self.counters.served.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) -> Result<usize> {
        self.cache.clear()
    }
}

impl std::fmt::Debug for ThumbnailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailService")
            .field("codec", &self.codec)
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{write_exr, RejectingDecoder};
    use crate::decode::GenericDecoder;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::{tempdir, TempDir};

    fn service(temp_dir: &TempDir) -> Result<ThumbnailService> {
        ThumbnailService::new(test_config(temp_dir))
    }

    fn test_config(temp_dir: &TempDir) -> ThumbnailConfig {
        ThumbnailConfig {
            cache_dir: Some(temp_dir.path().join("cache")),
            workers: Some(4),
            ..Default::default()
        }
    }

    fn write_png(path: &Path, width: u32, height: u32, color: [u8; 3]) -> Result<()> {
        RgbImage::from_pixel(width, height, Rgb(color)).save(path)?;
        Ok(())
    }

    #[test]
    fn test_large_png_thumbnail() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("wide.png");
        write_png(&path, 4000, 2000, [200, 30, 30])?;

        let thumb = service(&temp_dir)?.thumbnail(&path, 200)?;
        assert_eq!((thumb.width, thumb.height), (200, 100));
        assert!(!thumb.from_cache);
        assert_eq!(&thumb.bytes[..3], &[0xFF, 0xD8, 0xFF]);
        Ok(())
    }

    #[test]
    fn test_second_request_hits_cache() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.png");
        write_png(&path, 300, 150, [1, 2, 3])?;
        let service = service(&temp_dir)?;

        let first = service.thumbnail(&path, 100)?;
        let second = service.thumbnail(&path, 100)?;
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!((second.width, second.height), (100, 50));

        // A different size is a different entry
        assert!(!service.thumbnail(&path, 50)?.from_cache);

        let stats = service.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.thumbnails_served, 3);
        assert_eq!(stats.cache.disk_entries, 2);
        Ok(())
    }

    #[test]
    fn test_cache_survives_service_restart() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.png");
        write_png(&path, 64, 64, [9, 9, 9])?;

        assert!(!service(&temp_dir)?.thumbnail(&path, 32)?.from_cache);
        assert!(service(&temp_dir)?.thumbnail(&path, 32)?.from_cache);
        Ok(())
    }

    #[test]
    fn test_modified_source_is_not_served_stale() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("edit.png");
        let service = service(&temp_dir)?;

        write_png(&path, 200, 100, [0, 0, 0])?;
        let before = service.thumbnail(&path, 100)?;

        write_png(&path, 100, 200, [255, 255, 255])?;
        let later = SystemTime::now() + Duration::from_secs(10);
        fs::File::options().write(true).open(&path)?.set_modified(later)?;

        let after = service.thumbnail(&path, 100)?;
        assert!(!after.from_cache);
        assert_ne!(after.bytes, before.bytes);
        assert_eq!((after.width, after.height), (50, 100));
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_entry_is_rebuilt() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("photo.png");
        write_png(&path, 120, 60, [40, 80, 120])?;
        // Disk tier only, so the second request has to read the file
        let config = ThumbnailConfig { memory_budget: 0, ..test_config(&temp_dir) };
        let service = ThumbnailService::new(config)?;

        assert!(!service.thumbnail(&path, 60)?.from_cache);
        let entry = service.cache().entry_path(&CacheKey::for_file(&path, 60));
        fs::write(&entry, b"not a jpeg at all")?;

        let rebuilt = service.thumbnail(&path, 60)?;
        assert!(!rebuilt.from_cache);
        assert_eq!((rebuilt.width, rebuilt.height), (60, 30));

        let on_disk = fs::read(&entry)?;
        assert_eq!(on_disk, rebuilt.bytes);
        assert_eq!(image::load_from_memory(&on_disk)?.width(), 60);
        assert!(service.thumbnail(&path, 60)?.from_cache);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_not_found() -> Result<()> {
        let temp_dir = tempdir()?;
        let err = service(&temp_dir)?.thumbnail(&temp_dir.path().join("nope.png"), 200).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        assert!(err.to_string().contains("not found"));
        Ok(())
    }

    #[test]
    fn test_fallback_decoder_result_is_cached() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("plain.png");
        write_png(&path, 40, 20, [5, 6, 7])?;

        let codec = Codec::new(vec![Box::new(RejectingDecoder), Box::new(GenericDecoder::default())]);
        let service = ThumbnailService::with_codec(test_config(&temp_dir), codec)?;

        let first = service.thumbnail(&path, 20)?;
        assert!(!first.from_cache);
        assert_eq!((first.width, first.height), (20, 10));
        assert!(service.thumbnail(&path, 20)?.from_cache);
        Ok(())
    }

    #[test]
    fn test_exr_thumbnail_is_tone_mapped() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("render.exr");
        write_exr(&path, 64, 32)?;

        let service = service(&temp_dir)?;
        let thumb = service.thumbnail(&path, 16)?;
        assert_eq!((thumb.width, thumb.height), (16, 8));

        let info = service.image_info(&path)?;
        assert!(info.is_hdr);
        assert_eq!(info.format, "EXR");
        assert_eq!((info.width, info.height, info.channels), (64, 32, 3));
        assert_eq!(info.decoder, "native");
        Ok(())
    }

    #[test]
    fn test_transparent_png_is_flattened() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("logo.png");
        RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 0])).save(&path)?;

        let thumb = service(&temp_dir)?.thumbnail(&path, 10)?;
        let decoded = image::load_from_memory(&thumb.bytes)?.to_rgb8();
        assert!(decoded.pixels().all(|p| p.0.iter().all(|&c| c > 245)));
        Ok(())
    }

    #[test]
    fn test_full_image_export() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("big.png");
        write_png(&path, 300, 120, [10, 100, 200])?;
        let service = service(&temp_dir)?;

        let uncapped = service.full_image(&path, 0)?;
        assert_eq!((uncapped.width, uncapped.height), (300, 120));
        let capped = service.full_image(&path, 150)?;
        assert_eq!((capped.width, capped.height), (150, 60));

        // Exports stay out of the cache
        assert_eq!(service.stats().cache.disk_entries, 0);
        Ok(())
    }

    #[test]
    fn test_image_info() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("photo.png");
        write_png(&path, 30, 20, [1, 1, 1])?;

        let info = service(&temp_dir)?.image_info(&path)?;
        assert_eq!((info.width, info.height, info.channels), (30, 20, 3));
        assert_eq!(info.format, "PNG");
        assert_eq!(info.size_bytes, fs::metadata(&path)?.len());
        assert!(!info.is_hdr);
        Ok(())
    }

    #[test]
    fn test_batch_isolates_failures() -> Result<()> {
        let temp_dir = tempdir()?;
        let mut paths = Vec::new();
        for (i, (w, h)) in [(100, 50), (50, 100), (80, 80)].into_iter().enumerate() {
            let path = temp_dir.path().join(format!("img{}.png", i));
            write_png(&path, w, h, [i as u8, 0, 0])?;
            paths.push(path);
        }
        paths.insert(1, temp_dir.path().join("missing.png"));

        let service = service(&temp_dir)?;
        let report = service.generate_batch(&paths, 40, &CancellationToken::new());

        assert_eq!(report.total(), 4);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cache_hits, 0);
        for (result, path) in report.results.iter().zip(&paths) {
            assert_eq!(&result.path, path);
        }
        assert!(matches!(report.results[1].outcome, Err(PipelineError::NotFound(_))));

        let dims: Vec<(u32, u32)> = report
            .results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(|t| (t.width, t.height))
            .collect();
        assert_eq!(dims, vec![(40, 20), (20, 40), (40, 40)]);

        // Re-running hits the cache for every valid item
        let again = service.generate_batch(&paths, 40, &CancellationToken::new());
        assert_eq!(again.cache_hits, 3);
        Ok(())
    }

    #[test]
    fn test_batch_reports_progress() -> Result<()> {
        let temp_dir = tempdir()?;
        let paths: Vec<PathBuf> = (0..5).map(|i| temp_dir.path().join(format!("{}.png", i))).collect();
        for path in &paths {
            write_png(path, 8, 8, [0, 0, 0])?;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let report = service(&temp_dir)?.generate_batch_with_progress(
            &paths,
            4,
            &CancellationToken::new(),
            move |done, total| {
                assert!(done <= total);
                seen.fetch_add(1, Ordering::Relaxed);
            },
        );

        assert_eq!(report.succeeded, 5);
        assert_eq!(calls.load(Ordering::Relaxed), 5);
        Ok(())
    }

    #[test]
    fn test_sequential_batch_and_cancellation() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.png");
        write_png(&path, 10, 10, [0, 0, 0])?;
        let paths = vec![path.clone(), temp_dir.path().join("b.png")];
        let service = service(&temp_dir)?;

        let report = service.generate_sequential(&paths, 5, &CancellationToken::new());
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = service.generate_batch(&paths, 5, &cancel);
        assert!(cancelled
            .results
            .iter()
            .all(|r| matches!(r.outcome, Err(PipelineError::Cancelled))));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_through_async_boundary() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.png");
        write_png(&path, 64, 32, [0, 0, 0])?;
        let service = Arc::new(service(&temp_dir)?);

        let worker = Arc::clone(&service);
        let paths = vec![path];
        let report = service
            .pool()
            .spawn(CancellationToken::new(), move |token| worker.generate_batch(&paths, 16, token))
            .await?;
        assert_eq!(report.succeeded, 1);
        Ok(())
    }

    #[test]
    fn test_clear_cache() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("a.png");
        write_png(&path, 10, 10, [0, 0, 0])?;
        let service = service(&temp_dir)?;

        service.thumbnail(&path, 5)?;
        assert_eq!(service.clear_cache()?, 1);
        assert!(!service.thumbnail(&path, 5)?.from_cache);
        Ok(())
    }
}
