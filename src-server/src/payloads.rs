//! Request and response bodies of the JSON API

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thumbnail_cache::{BatchReport, ImageHandle, ImageInfo, JobResult, PipelineError, Thumbnail};

// -- Requests --

#[derive(Debug, Deserialize)]
pub struct ScanFolderRequest {
    pub folder_path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

/// `size` falls back to the configured thumbnail size
#[derive(Debug, Deserialize)]
pub struct ThumbnailRequest {
    pub image_path: PathBuf,
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BatchThumbnailRequest {
    pub image_paths: Vec<PathBuf>,
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ImageInfoRequest {
    pub image_path: PathBuf,
}

/// `max_size` of 0 exports at full resolution
#[derive(Debug, Deserialize)]
pub struct FullImageRequest {
    pub image_path: PathBuf,
    pub max_size: Option<u32>,
}

// -- Responses --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: String) -> Self {
        Self { success: false, error }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageFilePayload {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub extension: String,
    pub is_supported: bool,
}

#[derive(Debug, Serialize)]
pub struct ScanResult {
    pub success: bool,
    pub images: Vec<ImageFilePayload>,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ThumbnailResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-path results; the parallel variant fills in the timing fields
#[derive(Debug, Serialize)]
pub struct BatchThumbnailResult {
    pub success: bool,
    pub thumbnails: BTreeMap<String, ThumbnailResult>,
    pub total_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hits: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ImageInfoResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hdr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub decoders: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct PerformanceStats {
    pub workers: usize,
    pub decoders: Vec<&'static str>,
    pub cache_dir: String,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_budget: Option<u64>,
    pub memory_items: usize,
    pub memory_bytes: usize,
    pub memory_usage_percent: f64,
    pub thumbnails_served: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub hit_rate: f64,
    pub started_at: String,
    pub uptime_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResult {
    pub success: bool,
    pub removed: usize,
}

// -- Conversions --

pub fn data_url(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
}

impl From<&ImageHandle> for ImageFilePayload {
    fn from(handle: &ImageHandle) -> Self {
        Self {
            path: handle.path.display().to_string(),
            name: handle.name.clone(),
            size: handle.size,
            extension: handle.extension.clone(),
            is_supported: handle.is_supported,
        }
    }
}

impl ScanResult {
    pub fn from_handles(handles: &[ImageHandle]) -> Self {
        Self {
            success: true,
            images: handles.iter().map(ImageFilePayload::from).collect(),
            total_count: handles.len(),
            error: None,
        }
    }
}

impl ThumbnailResult {
    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            data_url: None,
            width: None,
            height: None,
            from_cache: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<&Thumbnail> for ThumbnailResult {
    fn from(thumbnail: &Thumbnail) -> Self {
        Self {
            success: true,
            data_url: Some(data_url(&thumbnail.bytes)),
            width: Some(thumbnail.width),
            height: Some(thumbnail.height),
            from_cache: Some(thumbnail.from_cache),
            error: None,
        }
    }
}

impl From<&Result<Thumbnail, PipelineError>> for ThumbnailResult {
    fn from(outcome: &Result<Thumbnail, PipelineError>) -> Self {
        match outcome {
            Ok(thumbnail) => thumbnail.into(),
            Err(e) => ThumbnailResult::failure(e),
        }
    }
}

impl BatchThumbnailResult {
    /// Every requested path gets an entry. The batch as a whole only fails when
    /// none of its paths exist.
    pub fn from_report(report: &BatchReport, with_timing: bool) -> Self {
        let thumbnails: BTreeMap<String, ThumbnailResult> = report
            .results
            .iter()
            .map(|JobResult { path, outcome }| (path.display().to_string(), ThumbnailResult::from(outcome)))
            .collect();

        let all_missing = report
            .results
            .iter()
            .all(|r| matches!(r.outcome, Err(PipelineError::NotFound(_))));

        Self {
            success: !all_missing,
            thumbnails,
            total_processed: report.succeeded,
            cache_hits: with_timing.then_some(report.cache_hits),
            processing_time: with_timing.then(|| report.elapsed.as_secs_f64()),
            throughput: with_timing.then(|| report.throughput()),
            error: all_missing.then(|| "None of the requested images exist".to_string()),
        }
    }

    pub fn empty_request() -> Self {
        Self {
            success: false,
            thumbnails: BTreeMap::new(),
            total_processed: 0,
            cache_hits: None,
            processing_time: None,
            throughput: None,
            error: Some("No image paths provided".to_string()),
        }
    }
}

impl From<ImageInfo> for ImageInfoResult {
    fn from(info: ImageInfo) -> Self {
        Self {
            success: true,
            width: Some(info.width),
            height: Some(info.height),
            channels: Some(info.channels),
            format: Some(info.format),
            size_bytes: Some(info.size_bytes),
            is_hdr: Some(info.is_hdr),
            decoder: Some(info.decoder),
            error: None,
        }
    }
}

impl ImageInfoResult {
    pub fn failure(error: impl ToString) -> Self {
        Self { success: false, error: Some(error.to_string()), ..Default::default() }
    }
}
