//! HTTP 辅助工具：CORS、安全头、客户端 IP 与对外访问地址。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::logging::Category;

/// 构建 CORS Layer：`*` 表示任意来源，否则为逗号分隔的来源列表。
pub fn build_cors_layer(cors_origin: &str, cors_headers: &str) -> Option<CorsLayer> {
    let allow_origin = if cors_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origins = cors_origin
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(category = %Category::Cors, origin, "invalid cors origin");
                    None
                }
            })
            .collect::<Vec<_>>();
        if origins.is_empty() {
            return None;
        }
        AllowOrigin::list(origins)
    };

    let headers = cors_headers
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match HeaderName::from_bytes(name.as_bytes()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(category = %Category::Cors, header = name, "invalid cors header");
                None
            }
        })
        .collect::<Vec<_>>();
    let allow_headers = if headers.is_empty() {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(headers)
    };

    info!(category = %Category::Cors, origin = cors_origin.trim(), "allowed origins");
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(allow_headers),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// 返回请求对外可见的 `scheme://host`（支持反向代理头）。
pub fn request_base_url(headers: &HeaderMap) -> Option<String> {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or("").trim())
        .filter(|value| value.eq_ignore_ascii_case("https"))
        .map_or("http", |_| "https");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or("").trim())
        .filter(|value| !value.is_empty() && !value.contains(['/', '\\', '@']))?;
    Some(format!("{scheme}://{host}"))
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
