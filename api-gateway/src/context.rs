use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};

use crate::auth::AuthUser;
use crate::tenant::Platform;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_PLATFORM: &str = "x-app-platform";
pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USERNAME: &str = "x-username";
pub const HEADER_USER_ROLE: &str = "x-user-role";

/// 请求上下文
///
/// 由租户解析阶段创建并放入请求扩展，后续阶段按需读取或补充（认证阶段写入用户）
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: Option<String>,
    pub platform: Platform,
    pub client_ip: String,
    pub user: Option<AuthUser>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: None,
            platform: Platform::Web,
            client_ip: client_ip.into(),
            user: None,
        }
    }

    /// 用户所属租户优先于请求解析出的租户
    pub fn effective_tenant(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.tenant_id.as_str())
            .filter(|t| !t.is_empty())
            .or(self.tenant_id.as_deref())
    }
}

/// 从请求中获取客户端IP
///
/// 只有直连的对端属于 `trusted_proxies` 时才采信 X-Forwarded-For / X-Real-IP，
/// 否则使用连接的对端地址，客户端无法通过伪造请求头改变自己的IP
pub fn client_ip<B>(request: &Request<B>, trusted_proxies: &[IpAddr]) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0.ip());

    match peer {
        Some(peer) if trusted_proxies.contains(&peer) => {
            forwarded_ip(request.headers(), trusted_proxies).unwrap_or_else(|| peer.to_string())
        }
        Some(peer) => peer.to_string(),
        None => "unknown".to_string(),
    }
}

/// 从右往左跳过可信代理，第一个不可信的地址即为客户端
fn forwarded_ip(headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> Option<String> {
    let chain: Vec<&str> = headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    if !chain.is_empty() {
        let client = chain
            .iter()
            .rev()
            .find(|hop| {
                hop.parse::<IpAddr>()
                    .map_or(true, |ip| !trusted_proxies.contains(&ip))
            })
            .or(chain.first());
        return client.map(|s| s.to_string());
    }

    headers
        .get("X-Real-IP")
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
