use serde::{Deserialize, Serialize};

/// 限流键策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    #[default]
    Ip,
    User,
    Tenant,
    Path,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::Ip => "ip",
            RateLimitStrategy::User => "user",
            RateLimitStrategy::Tenant => "tenant",
            RateLimitStrategy::Path => "path",
        }
    }
}

/// 限流后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    /// 进程内令牌桶
    #[default]
    Local,
    /// 基于Redis的分布式令牌桶
    Redis,
}

/// 限流规则：窗口内最多 `max_requests` 次请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitRule {
    #[serde(default)]
    pub strategy: RateLimitStrategy,
    pub max_requests: u32,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    1
}

impl RateLimitRule {
    /// 每秒补充的令牌数
    pub fn rate_per_sec(&self) -> f64 {
        self.max_requests as f64 / self.interval_secs.max(1) as f64
    }

    /// 桶容量
    pub fn burst(&self) -> u32 {
        self.max_requests.max(1)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 是否启用限流
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend: RateLimitBackend,
    /// 全局默认规则
    pub default_rule: RateLimitRule,
    /// 本地限流器空闲淘汰时间（秒）
    #[serde(default = "default_idle")]
    pub idle_eviction_secs: u64,
    /// Redis键前缀
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// 单次访问共享存储的超时（毫秒），超时按存储不可用处理并放行
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

fn default_idle() -> u64 {
    3600
}

fn default_key_prefix() -> String {
    "gateway:ratelimit".to_string()
}

fn default_store_timeout() -> u64 {
    200
}

impl RateLimitConfig {
    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: RateLimitBackend::Local,
            default_rule: RateLimitRule {
                strategy: RateLimitStrategy::Ip,
                max_requests: 100,
                interval_secs: 1,
            },
            idle_eviction_secs: default_idle(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}
