//! 上传流水线错误类型与 HTTP 响应转换。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io;
use thiserror::Error;
use tracing::{error, warn};

use crate::logging::Category;
use crate::storage::StorageError;

/// 上传流水线各阶段的失败原因。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No files were sent to the server")]
    NoFilesProvided,
    #[error("File type not supported: {0}")]
    FileTypeNotSupported(String),
    #[error("File too large (limit is {limit} bytes)")]
    FileTooLarge { limit: u64 },
    #[error("Too many files (limit is {limit})")]
    TooManyFiles { limit: usize },
    #[error("Unexpected field: {0}")]
    UnexpectedField(String),
    #[error("Malformed multipart request: {0}")]
    MalformedRequest(String),
    #[error("Invalid destination folder")]
    InvalidDestination,
    #[error("Invalid file name")]
    InvalidFileName,
    #[error("Upload destination could not be created")]
    DirectoryCreateFailed(#[source] io::Error),
    #[error("File could not be uploaded")]
    StorageWriteFailed(#[source] io::Error),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::DirectoryCreateFailed(_) | UploadError::StorageWriteFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UploadError::InvalidDestination,
            StorageError::Io(err) => UploadError::DirectoryCreateFailed(err),
        }
    }
}

/// 对外的 API 错误，响应体统一为 `{ "message": ... }`。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal { message: String, detail: String },
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => {
                warn!(category = %Category::Error, status = 400, reason = %message, "bad request");
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::NotFound(message) => {
                warn!(category = %Category::Error, status = 404, reason = %message, "not found");
                (StatusCode::NOT_FOUND, message)
            }
            ApiError::Internal { message, detail } => {
                error!(
                    category = %Category::Error,
                    status = 500,
                    reason = %message,
                    detail,
                    "internal server error"
                );
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        if error.status().is_server_error() {
            let detail = std::error::Error::source(&error)
                .map(ToString::to_string)
                .unwrap_or_default();
            ApiError::Internal {
                message: error.to_string(),
                detail,
            }
        } else {
            ApiError::BadRequest(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    const NO_FILES_MESSAGE: &str = "No files were sent to the server";
    const WRITE_FAILED_MESSAGE: &str = "File could not be uploaded";

    async fn body_message(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        value["message"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn write_failure_hides_io_detail() {
        let err = UploadError::StorageWriteFailed(io::Error::other("disk on fire"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_message(response).await, WRITE_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let response = ApiError::from(UploadError::NoFilesProvided).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_message(response).await, NO_FILES_MESSAGE);

        let err = UploadError::FileTypeNotSupported("application/pdf".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("application/pdf"));
    }

    #[test]
    fn storage_errors_map_to_upload_errors() {
        assert!(matches!(
            UploadError::from(StorageError::InvalidPath),
            UploadError::InvalidDestination
        ));
        assert!(matches!(
            UploadError::from(StorageError::Io(io::Error::other("denied"))),
            UploadError::DirectoryCreateFailed(_)
        ));
    }
}
