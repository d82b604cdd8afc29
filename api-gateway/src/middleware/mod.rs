mod request_logger;
mod security_headers;

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use common::configs::CorsConfig;

pub use request_logger::{RequestLogger, RequestLoggerLayer};
pub use security_headers::security_headers;

/// 根据配置创建CORS中间件
///
/// 未配置来源时允许任意来源，此时不允许携带凭证
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "忽略无效的CORS来源");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::USER_AGENT,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-tenant-id"),
            header::HeaderName::from_static("x-app-platform"),
            header::HeaderName::from_static("x-request-id"),
        ])
        .max_age(Duration::from_secs(config.max_age_secs));

    if origins.is_empty() {
        layer.allow_origin(AllowOrigin::any())
    } else {
        layer
            .allow_origin(origins)
            .allow_credentials(config.allow_credentials)
    }
}
