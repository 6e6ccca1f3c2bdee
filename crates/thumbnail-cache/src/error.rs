//! Error types for the thumbnail pipeline
//!
//! Per-item failures are values, not panics: every stage returns one of these
//! so a batch can report a failed item and carry on with its siblings.

use std::path::PathBuf;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::dispatch::DispatchError;

/// Failure of a single pipeline run (one image).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Image file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to decode {}: {}", path.display(), attempts.join("; "))]
    NotDecodable { path: PathBuf, attempts: Vec<String> },

    #[error("Unsupported image shape: {channels} channels")]
    UnsupportedShape { channels: u8 },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Cancelled before completion")]
    Cancelled,
}

impl PipelineError {
    /// Whether the failure comes from the input rather than from the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::NotFound(_)
                | PipelineError::NotDecodable { .. }
                | PipelineError::UnsupportedShape { .. }
        )
    }
}

impl From<DispatchError> for PipelineError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Worker(other.to_string()),
        }
    }
}

/// Failure of one decoder. The codec collects these and moves on to the next decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Image(#[from] image::ImageError),

    #[error("unrecognised image format")]
    UnknownFormat,

    #[error("{0} decoding is disabled")]
    Disabled(&'static str),

    #[error("file is {size} bytes, over the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Failure of a folder scan. Only the root path can fail a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Folder not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}
