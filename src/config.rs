//! CLI arguments, environment selection and the immutable upload configuration.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_UPLOAD_DIRECTORY: &str = "uploads";
pub const DEFAULT_TMP_DIRECTORY: &str = "tmp";
pub const DEFAULT_FILES_FIELD_NAME: &str = "files";
pub const DEFAULT_ACCEPTED_FILE_TYPES: [&str; 5] = [
    "image/png",
    "image/jpg",
    "image/jpeg",
    "image/gif",
    "image/webp",
];
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_UPLOADS_PUBLIC_PATH: &str = "/uploads";
pub const DEFAULT_CORS_ORIGIN: &str = "*";
pub const DEFAULT_CORS_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept, Authorization";
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_REQUEST_BODY_TIMEOUT_SECS: u64 = 300;
pub const MAX_TEXT_FIELD_SIZE: usize = 4 * 1024;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;
pub const DRAIN_TIMEOUT_SECS: u64 = 10;
pub const APP_ENV_VAR: &str = "APP_ENV";

/// Deployment environment; selects the dotenv file and logging defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Reads `APP_ENV` before argument parsing so the right dotenv file can be loaded.
    pub fn detect() -> Self {
        std::env::var(APP_ENV_VAR)
            .ok()
            .and_then(|value| Self::from_str(value.trim(), true).ok())
            .unwrap_or_default()
    }

    pub fn env_file(self) -> &'static str {
        match self {
            Environment::Development => ".env",
            Environment::Production => ".env.prod",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "upload-depot", version = VERSION_INFO, about = "File upload server")]
pub struct Args {
    #[arg(
        short = 'e',
        long = "env",
        env = APP_ENV_VAR,
        value_enum,
        default_value_t = Environment::Development,
        help = "Deployment environment"
    )]
    pub environment: Environment,
    #[arg(
        short = 'b',
        long,
        env = "SERVER_HOST",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SERVER_PORT",
        default_value_t = DEFAULT_SERVER_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'u',
        long,
        env = "UPLOAD_DIRECTORY",
        help = "Upload root directory (required in production)"
    )]
    pub upload_directory: Option<String>,
    #[arg(
        long,
        env = "UPLOAD_TMP_DIRECTORY",
        help = "Directory for in-flight upload data"
    )]
    pub upload_tmp_directory: Option<String>,
    #[arg(
        long,
        env = "FILES_FIELD_NAME",
        default_value = DEFAULT_FILES_FIELD_NAME,
        help = "Multipart field carrying the files"
    )]
    pub files_field_name: String,
    #[arg(
        long,
        env = "ACCEPTED_FILE_TYPES",
        value_delimiter = ',',
        default_values_t = DEFAULT_ACCEPTED_FILE_TYPES.map(String::from),
        help = "Comma separated list of accepted MIME types"
    )]
    pub accepted_file_types: Vec<String>,
    #[arg(
        long,
        env = "MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single file in bytes"
    )]
    pub max_file_size: u64,
    #[arg(long, env = "MAX_FILES", help = "Max files per request (unbounded if unset)")]
    pub max_files: Option<usize>,
    #[arg(
        long,
        env = "UPLOADS_PUBLIC_PATH",
        default_value = DEFAULT_UPLOADS_PUBLIC_PATH,
        help = "URL path the upload tree is served under"
    )]
    pub uploads_public_path: String,
    #[arg(
        long,
        env = "PUBLIC_BASE_URL",
        help = "Scheme and host used in returned URLs (defaults to the request Host)"
    )]
    pub public_base_url: Option<String>,
    #[arg(
        long,
        env = "PUBLIC_DIRECTORY",
        default_value = "public",
        help = "Static files served at the root path"
    )]
    pub public_directory: String,
    #[arg(
        long,
        env = "CORS_ORIGIN",
        default_value = DEFAULT_CORS_ORIGIN,
        help = "Allowed CORS origin(s), comma separated, * for any"
    )]
    pub cors_origin: String,
    #[arg(
        long,
        env = "CORS_HEADERS",
        default_value = DEFAULT_CORS_HEADERS,
        help = "Allowed CORS request headers"
    )]
    pub cors_headers: String,
    #[arg(
        long,
        env = "LOG_DIRECTORY",
        default_value = "logs",
        help = "Directory for daily log files"
    )]
    pub log_directory: String,
    #[arg(long, help = "Disable writing log files")]
    pub no_log_file: bool,
    #[arg(
        long,
        env = "UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Age after which stray temp files are removed (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
    #[arg(
        long,
        env = "REQUEST_BODY_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_BODY_TIMEOUT_SECS,
        help = "Timeout for reading a request body in seconds"
    )]
    pub request_body_timeout_secs: u64,
}

impl Args {
    pub fn log_directory(&self) -> Option<&Path> {
        if self.no_log_file || self.log_directory.trim().is_empty() {
            None
        } else {
            Some(Path::new(&self.log_directory))
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Upload directory is not set. Please set the UPLOAD_DIRECTORY environment variable.")]
    UploadDirectoryNotSet,
    #[error("Config key \"{key}\" has wrong value \"{value}\".")]
    WrongValue { key: &'static str, value: String },
}

/// Upload settings shared read-only by every request.
#[derive(Debug)]
pub struct UploadConfig {
    pub upload_root: PathBuf,
    pub temp_dir: PathBuf,
    pub accepted_mime_types: Vec<String>,
    pub max_file_size: u64,
    pub max_file_count: Option<usize>,
    pub file_field_name: String,
    pub public_path: String,
    pub public_base_url: Option<String>,
    pub temp_ttl: Duration,
    /// Upper bound for discarding the rest of a rejected request body.
    pub drain_timeout: Duration,
}

impl UploadConfig {
    /// Builds the configuration, resolving relative directories against `cwd`.
    pub fn from_args(args: &Args, cwd: &Path) -> Result<Self, ConfigError> {
        let upload_directory = match (&args.upload_directory, args.environment) {
            (Some(dir), _) if !dir.trim().is_empty() => dir.trim().to_string(),
            (_, Environment::Production) => return Err(ConfigError::UploadDirectoryNotSet),
            (_, Environment::Development) => DEFAULT_UPLOAD_DIRECTORY.to_string(),
        };
        let temp_directory = args
            .upload_tmp_directory
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .unwrap_or(DEFAULT_TMP_DIRECTORY);

        let file_field_name = args.files_field_name.trim().to_string();
        if file_field_name.is_empty() {
            return Err(ConfigError::WrongValue {
                key: "FILES_FIELD_NAME",
                value: args.files_field_name.clone(),
            });
        }
        if args.max_file_size == 0 {
            return Err(ConfigError::WrongValue {
                key: "MAX_FILE_SIZE",
                value: "0".into(),
            });
        }
        if args.max_files == Some(0) {
            return Err(ConfigError::WrongValue {
                key: "MAX_FILES",
                value: "0".into(),
            });
        }

        let accepted_mime_types = args
            .accepted_file_types
            .iter()
            .map(|mime| mime.trim().to_ascii_lowercase())
            .filter(|mime| !mime.is_empty())
            .collect::<Vec<_>>();
        if accepted_mime_types.is_empty() {
            return Err(ConfigError::WrongValue {
                key: "ACCEPTED_FILE_TYPES",
                value: args.accepted_file_types.join(","),
            });
        }

        let public_path = normalize_public_path(&args.uploads_public_path).ok_or_else(|| {
            ConfigError::WrongValue {
                key: "UPLOADS_PUBLIC_PATH",
                value: args.uploads_public_path.clone(),
            }
        })?;
        let public_base_url = args
            .public_base_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(Self {
            upload_root: cwd.join(upload_directory),
            temp_dir: cwd.join(temp_directory),
            accepted_mime_types,
            max_file_size: args.max_file_size,
            max_file_count: args.max_files,
            file_field_name,
            public_path,
            public_base_url,
            temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
            drain_timeout: Duration::from_secs(DRAIN_TIMEOUT_SECS),
        })
    }

    /// Checks a MIME essence (lowercase, no parameters) against the allow list.
    pub fn accepts(&self, mime: &str) -> bool {
        self.accepted_mime_types
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(mime))
    }
}

/// Normalizes to `/segment[/segment]` without a trailing slash; the root path is refused.
fn normalize_public_path(value: &str) -> Option<String> {
    let segments = value
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    if segments.is_empty() || segments.iter().any(|segment| *segment == "..") {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

#[cfg(test)]
pub(crate) fn test_config(root: &Path) -> UploadConfig {
    UploadConfig {
        upload_root: root.join("uploads"),
        temp_dir: root.join("tmp"),
        accepted_mime_types: DEFAULT_ACCEPTED_FILE_TYPES.map(String::from).to_vec(),
        max_file_size: DEFAULT_MAX_FILE_SIZE,
        max_file_count: None,
        file_field_name: DEFAULT_FILES_FIELD_NAME.to_string(),
        public_path: DEFAULT_UPLOADS_PUBLIC_PATH.to_string(),
        public_base_url: None,
        temp_ttl: Duration::from_secs(DEFAULT_UPLOAD_TEMP_TTL_SECS),
        drain_timeout: Duration::from_secs(DRAIN_TIMEOUT_SECS),
    }
}
