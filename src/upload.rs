//! 上传处理器：解析 → 目标目录 → 文件名 → 落盘 → 响应。

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Extension, Multipart};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::UploadConfig;
use crate::error::{ApiError, UploadError};
use crate::finalize::{StoredFile, UrlContext, finalize};
use crate::http::{extract_forwarded_ip, request_base_url};
use crate::ingest::{UploadRequest, drain, ingest};
use crate::logging::Category;
use crate::naming::stored_file_name;
use crate::storage::Storage;

const SUCCESS_MESSAGE: &str = "File uploaded successfully";

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum UploadedPath {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    message: &'static str,
    path: UploadedPath,
}

impl UploadResponse {
    fn from_stored(stored: Vec<StoredFile>) -> Self {
        let mut urls = stored
            .into_iter()
            .map(|file| file.public_url)
            .collect::<Vec<_>>();
        let path = if urls.len() == 1 {
            UploadedPath::Single(urls.remove(0))
        } else {
            UploadedPath::Many(urls)
        };
        Self {
            message: SUCCESS_MESSAGE,
            path,
        }
    }
}

/// 接收 multipart 上传并保存到上传目录。
pub async fn upload_files(
    headers: HeaderMap,
    Extension(config): Extension<Arc<UploadConfig>>,
    Extension(storage): Extension<Arc<Storage>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    info!(
        category = %Category::UploadController,
        client_ip = extract_forwarded_ip(&headers).unwrap_or_default(),
        "upload request received"
    );

    // 非 multipart 请求体等同于没有上传文件。
    let Ok(mut multipart) = multipart else {
        return Err(UploadError::NoFilesProvided.into());
    };

    let request = match ingest(&mut multipart, &config).await {
        Ok(request) => request,
        Err(err) => {
            drain(&mut multipart, &config).await;
            return Err(err.into());
        }
    };

    let base_url = config
        .public_base_url
        .clone()
        .or_else(|| request_base_url(&headers))
        .unwrap_or_default();
    let url = UrlContext {
        base_url: &base_url,
        public_path: &config.public_path,
    };
    let stored = store(request, &storage, url).await?;

    info!(
        category = %Category::Response,
        count = stored.len(),
        "file uploaded successfully"
    );
    Ok(JsonResponse(UploadResponse::from_stored(stored)))
}

/// 在解析成功后依次解析目录、计算文件名并落盘。
///
/// 所有文件名在任何写入前校验完毕；中途失败时尚未移动的临时文件随之清理。
async fn store(
    request: UploadRequest,
    storage: &Storage,
    url: UrlContext<'_>,
) -> Result<Vec<StoredFile>, UploadError> {
    let UploadRequest {
        files,
        folder,
        desired_name,
    } = request;
    if files.is_empty() {
        return Err(UploadError::NoFilesProvided);
    }

    let names = files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            // 调用方指定名称时，后续文件追加序号，避免同一批次互相覆盖。
            let suffix = if desired_name.is_some() { index } else { 0 };
            stored_file_name(desired_name.as_deref(), &file.original_name, suffix)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let directory = storage.ensure_destination(folder.as_deref()).await?;

    let mut stored = Vec::with_capacity(files.len());
    for (file, name) in files.into_iter().zip(names) {
        debug!(
            category = %Category::Uploader,
            original = file.original_name,
            mime = file.mime_type,
            size = file.size,
            stored_as = name,
            "finalizing upload"
        );
        let file = finalize(file, &directory, &name, storage, url).await?;
        info!(
            category = %Category::Uploader,
            path = ?file.absolute_path,
            url = file.public_url,
            "file stored"
        );
        stored.push(file);
    }
    Ok(stored)
}
