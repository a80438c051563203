//! 上传临时目录的定期清理任务。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::config::{UPLOAD_CLEAN_INTERVAL_SECS, UploadConfig};
use crate::logging::Category;

/// 启动后台任务（清理进程崩溃等情况遗留的临时文件）。
pub fn spawn_background_tasks(upload: Arc<UploadConfig>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_upload_temp(&upload).await {
                warn!(category = %Category::Uploader, error = %err, "upload temp cleanup failed");
            }
        }
    });
}

/// 删除临时目录中超过 TTL 的文件，返回删除数量。
pub async fn cleanup_upload_temp(upload: &UploadConfig) -> Result<usize, std::io::Error> {
    if upload.temp_ttl.is_zero() {
        return Ok(0);
    }
    if fs::metadata(&upload.temp_dir).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut dir = fs::read_dir(&upload.temp_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age >= upload.temp_ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(category = %Category::Uploader, path = ?path, error = %err, "failed to remove stale upload temp file");
            } else {
                info!(category = %Category::Uploader, path = ?path, "removed stale upload temp file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}
