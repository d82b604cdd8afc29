use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::configs::rate_limit_config::RateLimitRule;
use crate::error::Error;

/// 后端服务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Http,
    Grpc,
}

/// 单条路由配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// 服务前缀之后的路径，支持 `{param}` 与 `{*rest}`
    pub path: String,
    /// HTTP方法，`*` 或 `ANY` 表示任意方法
    #[serde(default = "default_method")]
    pub method: String,
    /// 覆盖服务级别的目标地址
    #[serde(default)]
    pub target: Option<String>,
    /// 转发前是否去掉服务前缀
    #[serde(default)]
    pub strip_path: bool,
    /// 额外注入的请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 额外注入的查询参数
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    /// 允许访问的角色，为空表示不限制角色
    #[serde(default)]
    pub roles: Vec<String>,
    /// 资源级权限检查 (resource, action)
    #[serde(default)]
    pub permission: Option<PermissionRequirement>,
    /// 对应的gRPC方法名（仅gRPC服务）
    #[serde(default)]
    pub grpc_method: Option<String>,
}

/// 资源权限要求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionRequirement {
    pub resource: String,
    pub action: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            target: None,
            strip_path: false,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            roles: Vec::new(),
            permission: None,
            grpc_method: None,
        }
    }

    /// 规范化后的方法名
    pub fn normalized_method(&self) -> String {
        let method = self.method.trim().to_ascii_uppercase();
        if method == "ANY" {
            "*".to_string()
        } else {
            method
        }
    }
}

/// gRPC方法配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrpcMethodConfig {
    /// gRPC方法名，例如 `GetUser`
    pub name: String,
    /// 映射的HTTP路径，默认为 `/{name}`
    #[serde(default)]
    pub path: Option<String>,
    /// 映射的HTTP方法，默认为POST
    #[serde(default = "default_grpc_http_method")]
    pub http_method: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_grpc_http_method() -> String {
    "POST".to_string()
}

/// gRPC服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrpcServiceConfig {
    /// proto包名
    #[serde(default)]
    pub package: Option<String>,
    /// proto服务名，缺省时使用服务名
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub methods: Vec<GrpcMethodConfig>,
    /// 最大请求消息大小（字节）
    #[serde(default = "default_message_size")]
    pub max_request_size: usize,
    /// 最大响应消息大小（字节）
    #[serde(default = "default_message_size")]
    pub max_response_size: usize,
}

fn default_message_size() -> usize {
    4 * 1024 * 1024
}

impl Default for GrpcServiceConfig {
    fn default() -> Self {
        Self {
            package: None,
            service_name: None,
            methods: Vec::new(),
            max_request_size: default_message_size(),
            max_response_size: default_message_size(),
        }
    }
}

/// 熔断参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSettings {
    /// 连续失败达到该值时熔断
    #[serde(default = "default_max_failures")]
    pub max_requests: u32,
    /// 关闭状态下统计窗口（秒），0表示不按时间重置
    #[serde(default)]
    pub interval_secs: u64,
    /// 打开状态持续时间（秒），之后进入半开状态
    #[serde(default = "default_open_timeout")]
    pub timeout_secs: u64,
    /// 半开状态允许的试探请求数，成功这么多次后关闭熔断
    #[serde(default = "default_half_open_requests")]
    pub half_open_max_requests: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    60
}

fn default_half_open_requests() -> u32 {
    1
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_failures(),
            interval_secs: 0,
            timeout_secs: default_open_timeout(),
            half_open_max_requests: default_half_open_requests(),
        }
    }
}

/// 后端服务注册配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// 服务名称，全局唯一
    pub name: String,
    /// URL挂载前缀，全局唯一
    pub prefix: String,
    /// 目标地址（HTTP为base URL，gRPC为host:port）
    pub target: String,
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    /// 是否需要认证
    #[serde(default)]
    pub authentication: bool,
    /// 请求超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// 熔断参数，缺省时使用网关默认值
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    /// 服务级别限流规则，缺省时使用全局规则
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    pub grpc: Option<GrpcServiceConfig>,
}

fn default_timeout() -> u64 {
    30
}

impl ServiceConfig {
    /// 校验服务配置
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("服务名称不能为空".to_string()));
        }
        if !self.prefix.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "服务 {} 的前缀必须以 / 开头: {}",
                self.name, self.prefix
            )));
        }
        if self.target.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "服务 {} 缺少目标地址",
                self.name
            )));
        }
        if self.service_type == ServiceType::Http
            && !(self.target.starts_with("http://") || self.target.starts_with("https://"))
        {
            return Err(Error::InvalidConfig(format!(
                "HTTP服务 {} 的目标地址必须是URL: {}",
                self.name, self.target
            )));
        }
        if self.service_type == ServiceType::Grpc
            && self.grpc.as_ref().map_or(true, |g| g.methods.is_empty())
            && self.routes.iter().all(|r| r.grpc_method.is_none())
        {
            return Err(Error::InvalidConfig(format!(
                "gRPC服务 {} 未配置任何方法",
                self.name
            )));
        }

        if self.service_type == ServiceType::Grpc {
            if let Some(route) = self.routes.iter().find(|r| r.grpc_method.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "gRPC服务 {} 的路由 {} {} 缺少grpc_method",
                    self.name, route.method, route.path
                )));
            }
        }

        let mut seen = HashSet::new();
        for route in self.effective_routes() {
            if !route.path.is_empty() && !route.path.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "服务 {} 的路由路径必须以 / 开头: {}",
                    self.name, route.path
                )));
            }
            if !seen.insert((route.path.clone(), route.normalized_method())) {
                return Err(Error::InvalidConfig(format!(
                    "服务 {} 存在重复路由: {} {}",
                    self.name, route.method, route.path
                )));
            }
        }
        Ok(())
    }

    /// 规范化后的前缀（去掉结尾的 /）
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// 展开后的全部路由：显式路由 + 由gRPC方法生成的路由
    pub fn effective_routes(&self) -> Vec<RouteConfig> {
        let mut routes = self.routes.clone();
        if let Some(grpc) = &self.grpc {
            for method in &grpc.methods {
                let mut route = RouteConfig::new(
                    method
                        .path
                        .clone()
                        .unwrap_or_else(|| format!("/{}", method.name)),
                    method.http_method.clone(),
                );
                route.grpc_method = Some(method.name.clone());
                route.roles = method.roles.clone();
                routes.push(route);
            }
        }
        routes
    }

    pub fn timeout(&self) -> std::time::Duration {
        let secs = if self.timeout == 0 { default_timeout() } else { self.timeout };
        std::time::Duration::from_secs(secs)
    }
}
