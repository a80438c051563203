//! 路由组装：上传接口、静态文件、中间件与共享配置。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::handler::HandlerWithoutStateExt;
use axum::http::Request;
use axum::routing::post;
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::UploadConfig;
use crate::error::ApiError;
use crate::http::{self, extract_forwarded_ip};
use crate::logging::Category;
use crate::storage::Storage;
use crate::upload;

/// 构建应用路由。
pub fn build_router(
    config: Arc<UploadConfig>,
    storage: Arc<Storage>,
    public_dir: &Path,
    body_timeout: Duration,
) -> Router {
    let uploads = ServeDir::new(storage.root_path());
    let public = ServeDir::new(public_dir).not_found_service(route_not_found.into_service());
    info!(
        category = %Category::StaticFiles,
        public = ?public_dir,
        uploads = ?storage.root_path(),
        mount = config.public_path,
        "static files mounted"
    );

    let router = Router::new()
        .route(
            "/upload",
            post(upload::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .nest_service(&config.public_path, uploads)
        .fallback_service(public)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(RequestBodyTimeoutLayer::new(body_timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string());
                    let client_ip = extract_forwarded_ip(request.headers())
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                // 错误响应已由 ApiError 记录一次。
                .on_failure(DefaultOnFailure::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(config));
    info!(category = %Category::Router, "routes registered");
    router
}

async fn route_not_found() -> ApiError {
    ApiError::NotFound("Route not found".into())
}
