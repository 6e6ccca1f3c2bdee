use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use thumbnail_cache::{scan_folder as scan, CancellationToken, PipelineError, Thumbnail, ThumbnailService};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::payloads::*;

// -- State --

#[derive(Clone)]
pub struct AppState {
    service: Arc<ThumbnailService>,
    started_at: DateTime<Utc>,
    /// Cancel pool work when the client goes away before the response is sent
    cancel_on_disconnect: bool,
}

impl AppState {
    pub fn new(service: Arc<ThumbnailService>, cancel_on_disconnect: bool) -> Self {
        Self { service, started_at: Utc::now(), cancel_on_disconnect }
    }

    /// Run blocking work on the shared pool without holding up the runtime.
    /// Axum drops the handler future on disconnect, which fires the token
    /// through the drop guard when cancellation is enabled.
    async fn run<F, R>(&self, job: F) -> Result<R, ApiError>
    where
        F: FnOnce(&ThumbnailService, &CancellationToken) -> R + Send + 'static,
        R: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let _guard = self.cancel_on_disconnect.then(|| cancel.clone().drop_guard());

        let service = Arc::clone(&self.service);
        let result = self
            .service
            .pool()
            .spawn(cancel, move |token| job(&*service, token))
            .await?;
        Ok(result)
    }
}

// -- Router --

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/performance-stats", get(performance_stats))
        .route("/scan-folder", post(scan_folder))
        .route("/thumbnail", post(thumbnail))
        .route("/thumbnail-binary", post(thumbnail_binary))
        .route("/batch-thumbnails", post(batch_thumbnails))
        .route("/batch-thumbnails-parallel", post(batch_thumbnails_parallel))
        .route("/image-info", post(image_info))
        .route("/full-image", post(full_image))
        .route("/full-image-binary", post(full_image_binary))
        .route("/clear-cache", post(clear_cache))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// -- Handlers --

async fn root() -> Json<Value> {
    Json(json!({ "message": "Image Viewer Pro Backend", "status": "running" }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        decoders: state.service.codec().decoder_names(),
    })
}

async fn performance_stats(State(state): State<AppState>) -> Result<Json<PerformanceStats>, ApiError> {
    // The disk figures come from a directory scan
    let stats = state.run(|service, _| service.stats()).await?;
    let now = Utc::now();

    Ok(Json(PerformanceStats {
        workers: stats.workers,
        decoders: stats.decoders.clone(),
        cache_dir: stats.cache.cache_dir.display().to_string(),
        disk_entries: stats.cache.disk_entries,
        disk_bytes: stats.cache.disk_bytes,
        disk_budget: stats.cache.disk_budget,
        memory_items: stats.cache.memory_items,
        memory_bytes: stats.cache.memory_bytes,
        memory_usage_percent: stats.cache.memory_usage_percent(),
        thumbnails_served: stats.thumbnails_served,
        cache_hits: stats.cache_hits,
        cache_misses: stats.cache_misses,
        failures: stats.failures,
        hit_rate: stats.hit_rate(),
        started_at: state.started_at.to_rfc3339(),
        uptime_seconds: (now - state.started_at).num_seconds(),
    }))
}

/// List the supported images in a folder
async fn scan_folder(
    State(state): State<AppState>,
    Json(request): Json<ScanFolderRequest>,
) -> Result<Json<ScanResult>, ApiError> {
    let ScanFolderRequest { folder_path, recursive } = request;
    let handles = state.run(move |_, _| scan(&folder_path, recursive)).await??;
    Ok(Json(ScanResult::from_handles(&handles)))
}

/// Thumbnail as a base64 data URL. Decode failures are reported in the body
/// so the client can show a placeholder; only a missing file is a hard error.
async fn thumbnail(
    State(state): State<AppState>,
    Json(request): Json<ThumbnailRequest>,
) -> Result<Json<ThumbnailResult>, ApiError> {
    let size = request.size.unwrap_or(state.service.config().thumbnail_size);
    let path = request.image_path;
    let outcome = state.run(move |service, _| service.thumbnail(&path, size)).await?;
    soft_failure(outcome.map(|t| ThumbnailResult::from(&t)), ThumbnailResult::failure).map(Json)
}

async fn thumbnail_binary(
    State(state): State<AppState>,
    Json(request): Json<ThumbnailRequest>,
) -> Result<Response, ApiError> {
    let size = request.size.unwrap_or(state.service.config().thumbnail_size);
    let path = request.image_path;
    let thumbnail = state.run(move |service, _| service.thumbnail(&path, size)).await??;
    Ok(jpeg_response(thumbnail))
}

/// Generate thumbnails one after another
async fn batch_thumbnails(
    State(state): State<AppState>,
    Json(request): Json<BatchThumbnailRequest>,
) -> Result<Json<BatchThumbnailResult>, ApiError> {
    if request.image_paths.is_empty() {
        return Ok(Json(BatchThumbnailResult::empty_request()));
    }
    let size = request.size.unwrap_or(state.service.config().thumbnail_size);
    let paths = request.image_paths;
    let report = state
        .run(move |service, token| service.generate_sequential(&paths, size, token))
        .await?;
    Ok(Json(BatchThumbnailResult::from_report(&report, false)))
}

/// Fan the batch out over the worker pool and report timing
async fn batch_thumbnails_parallel(
    State(state): State<AppState>,
    Json(request): Json<BatchThumbnailRequest>,
) -> Result<Json<BatchThumbnailResult>, ApiError> {
    if request.image_paths.is_empty() {
        return Ok(Json(BatchThumbnailResult::empty_request()));
    }
    let size = request.size.unwrap_or(state.service.config().thumbnail_size);
    let paths = request.image_paths;
    let report = state
        .run(move |service, token| service.generate_batch(&paths, size, token))
        .await?;
    Ok(Json(BatchThumbnailResult::from_report(&report, true)))
}

async fn image_info(
    State(state): State<AppState>,
    Json(request): Json<ImageInfoRequest>,
) -> Result<Json<ImageInfoResult>, ApiError> {
    let path = request.image_path;
    let outcome = state.run(move |service, _| service.image_info(&path)).await?;
    soft_failure(outcome.map(ImageInfoResult::from), ImageInfoResult::failure).map(Json)
}

async fn full_image(
    State(state): State<AppState>,
    Json(request): Json<FullImageRequest>,
) -> Result<Json<ThumbnailResult>, ApiError> {
    let max_size = request.max_size.unwrap_or(state.service.config().full_image_max_size);
    let path = request.image_path;
    let outcome = state.run(move |service, _| service.full_image(&path, max_size)).await?;
    soft_failure(outcome.map(|t| ThumbnailResult::from(&t)), ThumbnailResult::failure).map(Json)
}

async fn full_image_binary(
    State(state): State<AppState>,
    Json(request): Json<FullImageRequest>,
) -> Result<Response, ApiError> {
    let max_size = request.max_size.unwrap_or(state.service.config().full_image_max_size);
    let path = request.image_path;
    let image = state.run(move |service, _| service.full_image(&path, max_size)).await??;
    Ok(jpeg_response(image))
}

async fn clear_cache(State(state): State<AppState>) -> Result<Json<ClearCacheResult>, ApiError> {
    let removed = state.run(|service, _| service.clear_cache()).await??;
    tracing::info!(removed, "cache cleared");
    Ok(Json(ClearCacheResult { success: true, removed }))
}

// -- Helpers --

/// Missing files stay hard errors; any other pipeline failure becomes a
/// `success: false` body.
fn soft_failure<T>(
    outcome: Result<T, PipelineError>,
    failure: impl FnOnce(PipelineError) -> T,
) -> Result<T, ApiError> {
    match outcome {
        Ok(body) => Ok(body),
        Err(e @ PipelineError::NotFound(_)) => Err(e.into()),
        Err(e) if e.is_client_error() => Ok(failure(e)),
        Err(e) => Err(e.into()),
    }
}

fn jpeg_response(image: Thumbnail) -> Response {
    let headers = [
        (header::CONTENT_TYPE, "image/jpeg".to_string()),
        (HeaderName::from_static("x-image-width"), image.width.to_string()),
        (HeaderName::from_static("x-image-height"), image.height.to_string()),
        (HeaderName::from_static("x-cache-hit"), image.from_cache.to_string()),
    ];
    (StatusCode::OK, headers, image.bytes).into_response()
}
