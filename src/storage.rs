//! 上传根目录与目标目录解析：拒绝路径穿越，按需创建目录。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{debug, info};

use crate::logging::Category;

const MAX_SEGMENT_BYTES: usize = 255;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 解析并确保目标目录存在，返回绝对路径。
    ///
    /// `folder` 来自请求，不可信：`..`、盘符及穿过符号链接的路径都会被拒绝，
    /// 目录已存在（包括并发请求刚刚创建）视为成功。
    pub async fn ensure_destination(&self, folder: Option<&str>) -> Result<PathBuf, StorageError> {
        let target = self.resolve(folder)?;
        self.ensure_no_symlink_components(&target, true).await?;

        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => {
                debug!(category = %Category::Uploader, path = ?target, "upload storage exists");
                return Ok(target);
            }
            Ok(_) => return Err(StorageError::InvalidPath),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        match create_dir_all(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !fs::metadata(&target).await?.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        info!(category = %Category::Uploader, path = ?target, "upload storage created");
        Ok(target)
    }

    /// 返回相对上传根目录、以 `/` 分隔的各级路径段。
    pub fn relative_segments(&self, absolute: &Path) -> Option<Vec<String>> {
        let relative = absolute.strip_prefix(&self.root).ok()?;
        relative
            .components()
            .map(|component| match component {
                Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    fn resolve(&self, relative: Option<&str>) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();

        if let Some(value) = relative {
            let unified = value.trim().replace('\\', "/");
            let trimmed = unified.trim_start_matches('/');
            for component in Path::new(trimmed).components() {
                match component {
                    Component::Normal(segment) => {
                        if !is_valid_segment(&segment.to_string_lossy()) {
                            return Err(StorageError::InvalidPath);
                        }
                        normalized.push(segment)
                    }
                    Component::CurDir => continue,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(StorageError::InvalidPath);
                    }
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }
}

/// 单级目录名：不超过文件系统的名称上限，不含 `:` 与控制字符。
fn is_valid_segment(segment: &str) -> bool {
    segment.len() <= MAX_SEGMENT_BYTES
        && !segment.chars().any(|ch| ch == ':' || ch.is_control())
}

async fn create_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(path).await
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
