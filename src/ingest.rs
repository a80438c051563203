//! multipart 请求解析：按配置校验类型、大小与数量，并把文件流式写入临时目录。

use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use futures_util::stream::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::{MAX_TEXT_FIELD_SIZE, UploadConfig};
use crate::error::UploadError;
use crate::logging::Category;

const FOLDER_FIELD: &str = "folder";
const NAME_FIELD: &str = "name";

/// 请求私有的临时文件；未被移走时在 drop 时删除。
///
/// 客户端断开导致处理 future 被丢弃时，同样依赖 drop 完成清理。
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件已被移走，不再需要清理。
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 解析完成、等待落盘的单个文件。
#[derive(Debug)]
pub struct ParsedFile {
    pub temp: TempFile,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
}

/// 一次上传请求解析后的结果。
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub files: Vec<ParsedFile>,
    pub folder: Option<String>,
    pub desired_name: Option<String>,
}

/// 解析 multipart 请求体。
///
/// 任一文件不符合策略即整体失败；已写入临时目录的文件随 `UploadRequest` 一起被丢弃。
pub async fn ingest(
    multipart: &mut Multipart,
    config: &UploadConfig,
) -> Result<UploadRequest, UploadError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.is_empty());

        let Some(original_name) = file_name else {
            match field_name.as_str() {
                FOLDER_FIELD => request.folder = read_text(field).await?,
                NAME_FIELD => request.desired_name = read_text(field).await?,
                _ => {
                    debug!(category = %Category::MultipartParser, field = field_name, "ignored field");
                }
            }
            continue;
        };

        if field_name != config.file_field_name {
            return Err(UploadError::UnexpectedField(field_name));
        }
        if let Some(limit) = config.max_file_count
            && request.files.len() >= limit
        {
            return Err(UploadError::TooManyFiles { limit });
        }

        let mime_type = detect_mime(field.content_type(), &original_name);
        if !config.accepts(&mime_type) {
            return Err(UploadError::FileTypeNotSupported(mime_type));
        }

        let (temp, size) = spool(field, &config.temp_dir, config.max_file_size).await?;
        debug!(
            category = %Category::MultipartParser,
            name = original_name,
            mime = mime_type,
            size,
            "file received"
        );
        request.files.push(ParsedFile {
            temp,
            original_name,
            mime_type,
            size,
        });
    }

    Ok(request)
}

/// 丢弃剩余的请求体，使客户端能收到错误响应而不是连接重置。
///
/// 最多读取 `max_file_size` 字节、耗时不超过 `drain_timeout`，超出即放弃。
pub async fn drain(multipart: &mut Multipart, config: &UploadConfig) {
    let budget = config.max_file_size;
    let drained = tokio::time::timeout(config.drain_timeout, async {
        let mut read: u64 = 0;
        while let Ok(Some(mut field)) = multipart.next_field().await {
            while let Ok(Some(chunk)) = field.chunk().await {
                read += chunk.len() as u64;
                if read > budget {
                    return false;
                }
            }
        }
        true
    })
    .await;
    if !matches!(drained, Ok(true)) {
        debug!(category = %Category::MultipartParser, "request body drain abandoned");
    }
}

/// 优先使用声明的 Content-Type，缺失时按文件名推断。
fn detect_mime(declared: Option<&str>, file_name: &str) -> String {
    let essence = declared
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());
    match essence {
        Some(value) => value,
        None => mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// 把文件字段写入临时文件，超过大小限制立即失败。
async fn spool(
    mut field: Field<'_>,
    temp_dir: &Path,
    max_size: u64,
) -> Result<(TempFile, u64), UploadError> {
    let temp = TempFile::new(temp_dir.join(Uuid::new_v4().to_string()));
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(temp.path())
        .await
        .map_err(UploadError::StorageWriteFailed)?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(malformed)?;
        if chunk.is_empty() {
            continue;
        }
        written += chunk.len() as u64;
        if written > max_size {
            return Err(UploadError::FileTooLarge { limit: max_size });
        }
        file.write_all(&chunk)
            .await
            .map_err(UploadError::StorageWriteFailed)?;
    }
    file.flush().await.map_err(UploadError::StorageWriteFailed)?;

    Ok((temp, written))
}

async fn read_text(mut field: Field<'_>) -> Result<Option<String>, UploadError> {
    let name = field.name().unwrap_or_default().to_string();
    let mut buffer = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        if buffer.len() + chunk.len() > MAX_TEXT_FIELD_SIZE {
            return Err(UploadError::MalformedRequest(format!(
                "field \"{name}\" is too long"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    let text = String::from_utf8(buffer).map_err(|_| {
        UploadError::MalformedRequest(format!("field \"{name}\" is not valid UTF-8"))
    })?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

fn malformed(err: MultipartError) -> UploadError {
    UploadError::MalformedRequest(err.body_text())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::extract::FromRequest;
    use axum::http::Request;
    use futures_util::stream;
    use std::io;
    use tempfile::tempdir;

    use crate::config::test_config;

    pub(crate) const BOUNDARY: &str = "----upload-depot-boundary";

    /// 测试用 multipart 部件：`(字段名, 可选文件名与类型, 内容)`。
    pub(crate) enum Part<'a> {
        Text(&'a str, &'a str),
        File {
            field: &'a str,
            file_name: &'a str,
            content_type: Option<&'a str>,
            data: &'a [u8],
        },
    }

    pub(crate) fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File {
                    field,
                    file_name,
                    content_type,
                    data,
                } => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n"
                        )
                        .as_bytes(),
                    );
                    if let Some(content_type) = content_type {
                        body.extend_from_slice(
                            format!("Content-Type: {content_type}\r\n").as_bytes(),
                        );
                    }
                    body.extend_from_slice(b"\r\n");
                    body.extend_from_slice(data);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn multipart_from(parts: &[Part<'_>]) -> Multipart {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extractor failed"))
    }

    fn temp_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|dir| dir.count()).unwrap_or(0)
    }

    fn png(data: &[u8]) -> Part<'_> {
        Part::File {
            field: "files",
            file_name: "image.png",
            content_type: Some("image/png"),
            data,
        }
    }

    #[tokio::test]
    async fn files_and_text_fields_are_collected() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[
            Part::Text("folder", " avatars "),
            Part::Text("name", "profile"),
            png(b"first"),
            png(b"second!"),
        ])
        .await;

        let request = ingest(&mut multipart, &config).await.expect("ingest");
        assert_eq!(request.folder.as_deref(), Some("avatars"));
        assert_eq!(request.desired_name.as_deref(), Some("profile"));
        assert_eq!(request.files.len(), 2);
        assert_eq!(request.files[1].size, 7);
        assert_eq!(request.files[0].mime_type, "image/png");
        assert_eq!(
            std::fs::read(request.files[0].temp.path()).expect("read temp"),
            b"first"
        );

        drop(request);
        assert_eq!(temp_entries(&config.temp_dir), 0);
    }

    #[tokio::test]
    async fn rejected_type_cleans_earlier_files() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[
            png(b"ok"),
            Part::File {
                field: "files",
                file_name: "doc.pdf",
                content_type: Some("application/pdf"),
                data: b"%PDF",
            },
        ])
        .await;

        let result = ingest(&mut multipart, &config).await;
        assert!(matches!(
            result,
            Err(UploadError::FileTypeNotSupported(ref mime)) if mime == "application/pdf"
        ));
        assert_eq!(temp_entries(&config.temp_dir), 0);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.max_file_size = 4;
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[png(b"too large")]).await;

        let result = ingest(&mut multipart, &config).await;
        assert!(matches!(result, Err(UploadError::FileTooLarge { limit: 4 })));
        assert_eq!(temp_entries(&config.temp_dir), 0);
    }

    #[tokio::test]
    async fn file_count_limit_is_enforced() {
        let temp = tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.max_file_count = Some(1);
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[png(b"a"), png(b"b")]).await;

        let result = ingest(&mut multipart, &config).await;
        assert!(matches!(result, Err(UploadError::TooManyFiles { limit: 1 })));
        assert_eq!(temp_entries(&config.temp_dir), 0);
    }

    #[tokio::test]
    async fn file_under_other_field_is_unexpected() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[Part::File {
            field: "avatar",
            file_name: "a.png",
            content_type: Some("image/png"),
            data: b"a",
        }])
        .await;

        let result = ingest(&mut multipart, &config).await;
        assert!(matches!(result, Err(UploadError::UnexpectedField(ref name)) if name == "avatar"));
    }

    #[tokio::test]
    async fn empty_file_input_is_ignored() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let mut multipart = multipart_from(&[Part::File {
            field: "files",
            file_name: "",
            content_type: Some("application/octet-stream"),
            data: b"",
        }])
        .await;

        let request = ingest(&mut multipart, &config).await.expect("ingest");
        assert!(request.files.is_empty());
    }

    #[test]
    fn mime_detection_prefers_declared_type() {
        assert_eq!(detect_mime(Some("Image/PNG; q=1"), "a.gif"), "image/png");
        assert_eq!(detect_mime(None, "a.gif"), "image/gif");
        assert_eq!(detect_mime(None, "blob"), "application/octet-stream");
    }

    #[tokio::test]
    async fn body_cut_mid_file_leaves_no_temp_file() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");
        let head = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"cut.png\"\r\nContent-Type: image/png\r\n\r\n"
        );

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "client went away");
        let bodies: [Vec<Result<Bytes, io::Error>>; 2] = [
            vec![
                Ok(Bytes::from(head.clone())),
                Ok(Bytes::from(vec![1u8; 8 * 1024])),
                Err(reset),
            ],
            vec![Ok(Bytes::from(head)), Ok(Bytes::from(vec![2u8; 8 * 1024]))],
        ];
        for chunks in bodies {
            let request = Request::builder()
                .method("POST")
                .uri("/upload")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from_stream(stream::iter(chunks)))
                .expect("request");
            let mut multipart = Multipart::from_request(request, &())
                .await
                .unwrap_or_else(|_| panic!("multipart extractor failed"));

            let result = ingest(&mut multipart, &config).await;
            assert!(matches!(result, Err(UploadError::MalformedRequest(_))));
            assert_eq!(temp_entries(&config.temp_dir), 0);
        }
    }

    #[tokio::test]
    async fn text_fields_are_capped() {
        let temp = tempdir().expect("tempdir");
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.temp_dir).expect("temp dir");

        let exact = "f".repeat(MAX_TEXT_FIELD_SIZE);
        let mut multipart = multipart_from(&[Part::Text("folder", &exact), png(b"x")]).await;
        let request = ingest(&mut multipart, &config).await.expect("ingest");
        assert_eq!(request.folder.as_ref().map(String::len), Some(MAX_TEXT_FIELD_SIZE));
        drop(request);

        let long = "f".repeat(MAX_TEXT_FIELD_SIZE + 1);
        let mut multipart = multipart_from(&[Part::Text("name", &long), png(b"x")]).await;
        let result = ingest(&mut multipart, &config).await;
        assert!(matches!(
            result,
            Err(UploadError::MalformedRequest(ref message)) if message.contains("too long")
        ));
        assert_eq!(temp_entries(&config.temp_dir), 0);
    }
}
