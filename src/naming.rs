//! 文件名清洗：把不可信的文件名转换为安全的单级路径名。

use crate::error::UploadError;

/// 常见文件系统的单级名称上限（字节）。
const MAX_FILE_NAME_BYTES: usize = 255;

/// 空白替换为 `-`，再去掉 `[A-Za-z0-9-]` 以外的字符。
pub fn sanitize_base(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_whitespace() { '-' } else { ch })
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
        .collect()
}

/// 去掉客户端可能携带的目录部分，只保留最后一段。
fn leaf_name(original: &str) -> &str {
    original
        .rsplit(|ch: char| ch == '/' || ch == '\\')
        .next()
        .unwrap_or(original)
}

/// 取最后一个 `.` 之后的扩展名，仅保留 ASCII 字母数字。
pub fn extension_of(original: &str) -> Option<String> {
    let (_, extension) = leaf_name(original).rsplit_once('.')?;
    let extension: String = extension
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    (!extension.is_empty()).then_some(extension)
}

/// 计算最终落盘的文件名 `<base>.<ext>`。
///
/// 调用方提供的名称整体清洗；未提供时使用原始文件名去掉扩展名后的部分。
/// `index` 大于 0 时追加 `-<index>`，用于同一请求中的后续文件。
/// 结果超过 255 字节时截断基础名，保留序号与扩展名。
pub fn stored_file_name(
    desired: Option<&str>,
    original: &str,
    index: usize,
) -> Result<String, UploadError> {
    let mut base = match desired.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => sanitize_base(name),
        None => {
            let leaf = leaf_name(original);
            let stem = match leaf.rsplit_once('.') {
                Some((stem, _)) => stem,
                None => leaf,
            };
            sanitize_base(stem)
        }
    };
    if base.is_empty() {
        return Err(UploadError::InvalidFileName);
    }

    let suffix = if index > 0 {
        format!("-{index}")
    } else {
        String::new()
    };
    let extension = extension_of(original)
        .map(|extension| format!(".{extension}"))
        .unwrap_or_default();
    // 清洗后只剩 ASCII，按字节截断不会切断字符。
    let budget = MAX_FILE_NAME_BYTES
        .checked_sub(suffix.len() + extension.len())
        .filter(|budget| *budget > 0)
        .ok_or(UploadError::InvalidFileName)?;
    base.truncate(budget);
    Ok(format!("{base}{suffix}{extension}"))
}
