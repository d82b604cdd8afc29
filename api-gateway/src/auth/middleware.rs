use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use tracing::debug;

use common::configs::{RouteConfig, ServiceConfig};
use common::error::Error;

use super::rbac::{authorize, PermissionChecker};
use super::{AuthManager, AuthUser};
use crate::context::{HEADER_TENANT_ID, HEADER_USERNAME, HEADER_USER_ID, HEADER_USER_ROLE};

/// 认证与授权阶段
///
/// 服务不要求认证时返回 `None`；否则认证失败或授权失败都会中断请求
pub async fn authenticate_request(
    auth: &AuthManager,
    permissions: &dyn PermissionChecker,
    parts: &Parts,
    service: &ServiceConfig,
    route: &RouteConfig,
) -> Result<Option<AuthUser>, Error> {
    if !service.authentication {
        return Ok(None);
    }

    let user = auth.authenticate(parts).await?;
    authorize(&user, route, permissions)?;
    debug!(user_id = %user.id, service = %service.name, route = %route.path, "授权通过");
    Ok(Some(user))
}

/// 写入转发给后端的用户身份请求头
///
/// 客户端自带的身份头一律移除，避免伪造
pub fn forward_identity(headers: &mut HeaderMap, user: Option<&AuthUser>) {
    for name in [HEADER_USER_ID, HEADER_USERNAME, HEADER_USER_ROLE] {
        headers.remove(name);
    }
    let Some(user) = user else {
        return;
    };

    let values = [
        (HEADER_USER_ID, user.id.as_str()),
        (HEADER_USERNAME, user.username.as_str()),
        (HEADER_USER_ROLE, user.role.as_str()),
        (HEADER_TENANT_ID, user.tenant_id.as_str()),
    ];
    for (name, value) in values {
        if value.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}
