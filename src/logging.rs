//! 日志初始化：控制台输出、按日期写入日志文件，以及日志分类标签。

use std::fmt;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt as log_fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Environment;

/// 日志分类，作为每条日志的 `category` 字段输出。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Config,
    Server,
    Router,
    Cors,
    StaticFiles,
    MultipartParser,
    Uploader,
    UploadController,
    Response,
    Error,
}

impl Category {
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Config => "CONFIG",
            Category::Server => "SERVER",
            Category::Router => "ROUTER",
            Category::Cors => "CORS",
            Category::StaticFiles => "STATIC_FILES",
            Category::MultipartParser => "MULTIPART_PARSER",
            Category::Uploader => "UPLOADER",
            Category::UploadController => "UPLOAD_CONTROLLER",
            Category::Response => "RESPONSE",
            Category::Error => "ERROR",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 初始化 tracing 日志订阅与默认过滤规则。
///
/// 生产环境默认不输出 debug 日志；`RUST_LOG` 可覆盖默认值。
/// 返回的 guard 需要保持到进程退出，否则文件日志可能丢失尾部内容。
pub fn init_logging(environment: Environment, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_filter = match environment {
        Environment::Development => "debug",
        Environment::Production => "info",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_writer, open_error) = match log_dir.map(daily_appender) {
        Some(Ok(appender)) => (Some(tracing_appender::non_blocking(appender)), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    let (file_layer, guard) = match file_writer {
        Some((writer, guard)) => (
            Some(log_fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_fmt::layer())
        .with(file_layer)
        .init();

    if let Some(err) = open_error {
        warn!(category = %Category::Server, error = %err, "log file disabled");
    }
    guard
}

/// 按天滚动的日志文件 `<dir>/<YYYY-MM-DD>.log`，跨过零点自动切换到新文件。
fn daily_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_suffix("log")
        .build(dir)
}
