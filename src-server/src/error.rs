use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use thumbnail_cache::{DispatchError, PipelineError, ScanError};

use crate::payloads::ErrorBody;

/// Hard failure of a request, mapped onto an HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Pipeline(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::NotFound(_)) | ApiError::Scan(ScanError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Scan(ScanError::NotADirectory(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::NotDecodable { .. })
            | ApiError::Pipeline(PipelineError::UnsupportedShape { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_status_mapping() {
        let missing = PathBuf::from("/nope.png");
        assert_eq!(ApiError::from(PipelineError::NotFound(missing.clone())).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(ScanError::NotFound(missing.clone())).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(ScanError::NotADirectory(missing.clone())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(PipelineError::NotDecodable { path: missing, attempts: vec![] }).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(PipelineError::UnsupportedShape { channels: 2 }).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(DispatchError::Panicked("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
