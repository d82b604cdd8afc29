use tracing::info;

use common::configs::{PermissionPolicy, PermissionRequirement, RouteConfig};
use common::error::Error;

use super::AuthUser;

/// 角色检查：路由未要求角色时放行，否则用户角色必须在列表中
pub fn check_roles(user: &AuthUser, required: &[String]) -> bool {
    required.is_empty() || required.iter().any(|role| role == &user.role)
}

/// 资源级权限检查
pub trait PermissionChecker: Send + Sync {
    fn check(&self, subject: &str, resource: &str, action: &str) -> bool;
}

/// 基于策略列表的权限检查
///
/// `subject` 匹配角色或用户ID；字段为 `*` 时匹配任意值，以 `*` 结尾时按前缀匹配
#[derive(Debug, Clone, Default)]
pub struct PolicyPermissionChecker {
    policies: Vec<PermissionPolicy>,
}

impl PolicyPermissionChecker {
    pub fn new(policies: Vec<PermissionPolicy>) -> Self {
        Self { policies }
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

impl PermissionChecker for PolicyPermissionChecker {
    fn check(&self, subject: &str, resource: &str, action: &str) -> bool {
        self.policies.iter().any(|p| {
            pattern_matches(&p.subject, subject)
                && pattern_matches(&p.resource, resource)
                && pattern_matches(&p.action, action)
        })
    }
}

/// 对认证通过的用户执行路由的授权要求
pub fn authorize(
    user: &AuthUser,
    route: &RouteConfig,
    checker: &dyn PermissionChecker,
) -> Result<(), Error> {
    if !check_roles(user, &route.roles) {
        info!(user_id = %user.id, role = %user.role, required = ?route.roles, "角色不满足路由要求");
        return Err(Error::Forbidden(format!("角色 {} 无权访问", user.role)));
    }

    if let Some(PermissionRequirement { resource, action }) = &route.permission {
        // 角色或用户ID任一满足即可
        let allowed = (!user.role.is_empty() && checker.check(&user.role, resource, action))
            || checker.check(&user.id, resource, action);
        if !allowed {
            info!(user_id = %user.id, resource = %resource, action = %action, "资源权限不足");
            return Err(Error::Forbidden(format!("无权对 {} 执行 {}", resource, action)));
        }
    }
    Ok(())
}
