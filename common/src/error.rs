use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// 网关错误
///
/// 按处理方式分为四类：
/// * 客户端错误（4xx，网关不重试）
/// * 策略拒绝（限流 / 熔断 / RBAC，属于预期行为，info级别日志）
/// * 上游失败（后端5xx、传输错误、超时，计入熔断失败）
/// * 基础设施错误（共享存储不可用等，调用方需要放行而不是中断流量）
#[derive(Debug, Error)]
pub enum Error {
    #[error("内部服务错误: {0}")]
    Internal(String),

    #[error("请求无效: {0}")]
    BadRequest(String),

    #[error("请求体过大: {0}")]
    PayloadTooLarge(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("租户不存在: {0}")]
    TenantNotFound(String),

    #[error("未找到认证凭证")]
    CredentialsNotFound,

    #[error("认证凭证无效: {0}")]
    InvalidCredentials(String),

    #[error("认证凭证已过期")]
    CredentialsExpired,

    #[error("不支持的认证类型: {0}")]
    UnsupportedAuthType(String),

    #[error("没有足够的权限: {0}")]
    Forbidden(String),

    #[error("请求过于频繁，请稍后重试")]
    RateLimited { retry_after: Option<Duration> },

    #[error("服务熔断中: {0}")]
    CircuitOpen(String),

    #[error("上游服务不可用: {0}")]
    BadGateway(String),

    #[error("上游服务响应超时: {0}")]
    GatewayTimeout(String),

    #[error("上游服务错误: {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("服务配置无效: {0}")]
    InvalidConfig(String),

    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Redis错误: {0}")]
    Redis(String),

    #[error("IO错误: {0}")]
    IO(#[from] std::io::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gRPC传输错误: {0}")]
    Tonic(#[from] tonic::transport::Error),
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Internal(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Internal(err.to_string())
    }
}

// Redis错误转换实现
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Error::CredentialsExpired,
            _ => Error::InvalidCredentials(err.to_string()),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: status.message().to_string(),
            details: None,
        }
    }
}

impl Error {
    /// 对应的HTTP状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::InvalidConfig(_) | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotFound(_) | Error::TenantNotFound(_) => StatusCode::NOT_FOUND,
            Error::CredentialsNotFound
            | Error::InvalidCredentials(_)
            | Error::CredentialsExpired
            | Error::UnsupportedAuthType(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadGateway(_) | Error::Tonic(_) => StatusCode::BAD_GATEWAY,
            Error::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream { status, .. } => *status,
            Error::Internal(_)
            | Error::Config(_)
            | Error::Redis(_)
            | Error::IO(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Error::Internal(_) | Error::Config(_) | Error::IO(_) => "internal_error",
            Error::BadRequest(_) | Error::Json(_) => "bad_request",
            Error::PayloadTooLarge(_) => "payload_too_large",
            Error::NotFound(_) => "not_found",
            Error::TenantNotFound(_) => "tenant_not_found",
            Error::CredentialsNotFound => "credentials_not_found",
            Error::InvalidCredentials(_) => "invalid_credentials",
            Error::CredentialsExpired => "credentials_expired",
            Error::UnsupportedAuthType(_) => "unsupported_auth_type",
            Error::Forbidden(_) => "forbidden",
            Error::RateLimited { .. } => "rate_limited",
            Error::CircuitOpen(_) => "circuit_open",
            Error::BadGateway(_) | Error::Tonic(_) => "bad_gateway",
            Error::GatewayTimeout(_) => "gateway_timeout",
            Error::Upstream { .. } => "upstream_error",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Redis(_) => "store_unavailable",
        }
    }

    /// 是否属于策略拒绝（限流、熔断、权限）
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::CircuitOpen(_) | Error::Forbidden(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "code": self.code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });

        let mut retry_after_secs = None;
        match &self {
            Error::RateLimited { retry_after } => {
                // 向上取整，避免客户端提前重试
                let secs = retry_after
                    .map(|d| (d.as_secs_f64().ceil() as u64).max(1))
                    .unwrap_or(1);
                body["retry_after"] = json!(secs);
                retry_after_secs = Some(secs);
            }
            Error::Upstream {
                message,
                details: Some(details),
                ..
            } => {
                body["message"] = json!(message);
                body["details"] = details.clone();
            }
            Error::Upstream { message, .. } => {
                body["message"] = json!(message);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from(secs));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_distinct() {
        assert_eq!(Error::CredentialsNotFound.code(), "credentials_not_found");
        assert_eq!(
            Error::InvalidCredentials("bad".into()).code(),
            "invalid_credentials"
        );
        assert_eq!(Error::CredentialsExpired.code(), "credentials_expired");
        assert_eq!(
            Error::UnsupportedAuthType("digest".into()).code(),
            "unsupported_auth_type"
        );
        for err in [
            Error::CredentialsNotFound,
            Error::CredentialsExpired,
            Error::InvalidCredentials("x".into()),
        ] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = Error::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "3");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let response = Error::RateLimited {
            retry_after: Some(Duration::from_millis(1900)),
        }
        .into_response();
        assert_eq!(response.headers().get("Retry-After").unwrap(), "2");

        let response = Error::RateLimited {
            retry_after: Some(Duration::from_millis(10)),
        }
        .into_response();
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
    }

    #[test]
    fn test_payload_too_large() {
        let err = Error::PayloadTooLarge("gzip".into());
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), "payload_too_large");
    }

    #[test]
    fn test_policy_rejection() {
        assert!(Error::CircuitOpen("user".into()).is_policy_rejection());
        assert!(!Error::GatewayTimeout("user".into()).is_policy_rejection());
    }
}
