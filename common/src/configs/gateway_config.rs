use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::configs::auth_config::AuthConfig;
use crate::configs::rate_limit_config::RateLimitConfig;
use crate::configs::routes_config::{CircuitBreakerSettings, ServiceConfig};

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 启动时注册的后端服务
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 认证配置
    #[serde(default)]
    pub auth: AuthConfig,
    /// 租户解析配置
    #[serde(default)]
    pub tenant: TenantConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    /// 默认熔断参数
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Metrics暴露端点
    #[serde(default = "default_metrics_endpoint")]
    pub metrics_endpoint: String,
    /// 可信的前置代理，只有来自这些地址的连接才采信 X-Forwarded-For
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            tenant: TenantConfig::default(),
            cors: CorsConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            admin: AdminConfig::default(),
            metrics_endpoint: default_metrics_endpoint(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// 租户解析配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// 主域名，主域名本身不解析子域名租户
    #[serde(default)]
    pub main_domain: String,
    /// 查询参数名
    #[serde(default = "default_tenant_query")]
    pub query_param: String,
    /// 是否通过租户目录校验租户
    #[serde(default)]
    pub validate: bool,
    /// 静态租户目录
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
}

fn default_tenant_query() -> String {
    "tenant_id".to_string()
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            main_domain: String::new(),
            query_param: default_tenant_query(),
            validate: false,
            tenants: Vec::new(),
        }
    }
}

/// 租户目录条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantEntry {
    pub id: String,
    pub subdomain: String,
    #[serde(default)]
    pub name: String,
}

/// 跨域配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            allow_credentials: true,
            max_age_secs: default_max_age(),
        }
    }
}

/// 管理接口配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// 设置后需要在 X-Admin-Token 中携带
    #[serde(default)]
    pub token: Option<String>,
}
