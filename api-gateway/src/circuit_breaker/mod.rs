/**
 * 熔断器注册表
 *
 * 每个逻辑目标一个熔断器，按服务名索引；没有明确服务时按路径前缀推断。
 * 熔断器在第一次请求时创建，之后在整个进程生命周期内复用。
 */
mod breaker;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use common::configs::CircuitBreakerSettings;

pub use breaker::{
    BreakerPermit, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState, Counts,
    StateChangeListener,
};

/// 路径前缀推断时使用的段数
const PREFIX_SEGMENTS: usize = 2;

pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    listener: Option<StateChangeListener>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerSettings) -> Self {
        Self {
            defaults,
            breakers: RwLock::new(HashMap::new()),
            listener: None,
        }
    }

    /// 设置状态变化回调，对之后创建的熔断器生效
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// 熔断器的键：优先使用服务名，否则取路径的前两段
    pub fn key_for(service: Option<&str>, path: &str) -> String {
        if let Some(name) = service.filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .take(PREFIX_SEGMENTS)
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// 获取或创建熔断器，`settings` 为空时使用默认参数
    pub fn get_or_create(
        &self,
        key: &str,
        settings: Option<&CircuitBreakerSettings>,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        // 拿到写锁之前可能已被其他请求创建
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let settings = BreakerSettings::from(settings.unwrap_or(&self.defaults));
                let breaker = CircuitBreaker::new(key, settings);
                Arc::new(match &self.listener {
                    Some(listener) => breaker.with_listener(listener.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).cloned()
    }

    /// 移除熔断器，服务重新注册或删除时调用
    pub fn remove(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(key)
    }

    /// 全部熔断器的快照，按名称排序
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
