//! 上传落盘：把临时文件移动到最终位置，并生成对外访问 URL。

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::UploadError;
use crate::ingest::ParsedFile;
use crate::logging::Category;
use crate::storage::Storage;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[cfg(unix)]
const STORED_FILE_MODE: u32 = 0o644;

/// 已持久化的上传结果。
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub absolute_path: PathBuf,
    pub public_url: String,
}

/// 生成对外 URL 所需的上下文：`<base_url><public_path>/<相对路径>`。
#[derive(Debug, Clone, Copy)]
pub struct UrlContext<'a> {
    pub base_url: &'a str,
    pub public_path: &'a str,
}

/// 将临时文件移动到 `<directory>/<file_name>`，同名文件被覆盖。
pub async fn finalize(
    file: ParsedFile,
    directory: &Path,
    file_name: &str,
    storage: &Storage,
    url: UrlContext<'_>,
) -> Result<StoredFile, UploadError> {
    let target = directory.join(file_name);
    move_into_place(file.temp.path(), &target)
        .await
        .map_err(UploadError::StorageWriteFailed)?;
    file.temp.disarm();

    let public_url = public_url(storage, &target, url).ok_or(UploadError::InvalidDestination)?;
    Ok(StoredFile {
        absolute_path: target,
        public_url,
    })
}

/// 优先单次 rename；跨文件系统时退化为复制后删除源文件。
///
/// 两条路径最终都把文件权限设为 `0o644`，不沿用临时文件的 `0o600`。
async fn move_into_place(source: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(source, target).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            debug!(category = %Category::Uploader, "rename crosses devices, copying");
            copy_then_remove(source, target).await?;
        }
        Err(err) => return Err(err),
    }
    set_file_mode(target).await
}

#[cfg(unix)]
async fn set_file_mode(target: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(target, std::fs::Permissions::from_mode(STORED_FILE_MODE)).await
}

#[cfg(not(unix))]
async fn set_file_mode(_target: &Path) -> io::Result<()> {
    Ok(())
}

/// 先复制到目标目录内的 `.part` 文件再 rename 覆盖，失败时已有目标文件保持不变。
pub async fn copy_then_remove(source: &Path, target: &Path) -> io::Result<()> {
    let staging = staging_path(target)?;
    let copied = async {
        let mut reader = File::open(source).await?;
        let mut writer = File::create_new(&staging).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_all().await?;
        drop(writer);
        fs::rename(&staging, target).await
    }
    .await;
    if let Err(err) = copied {
        let _ = fs::remove_file(&staging).await;
        return Err(err);
    }

    if let Err(err) = fs::remove_file(source).await {
        warn!(category = %Category::Uploader, path = ?source, error = %err, "temp file not removed");
    }
    Ok(())
}

fn staging_path(target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "target has no parent"))?;
    // 不拼接目标文件名，避免接近 255 字节的名称超出文件系统上限。
    Ok(parent.join(format!(".{}.part", Uuid::new_v4())))
}

fn public_url(storage: &Storage, absolute: &Path, url: UrlContext<'_>) -> Option<String> {
    let segments = storage.relative_segments(absolute)?;
    let encoded = segments
        .iter()
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/");
    Some(format!("{}{}/{}", url.base_url, url.public_path, encoded))
}
