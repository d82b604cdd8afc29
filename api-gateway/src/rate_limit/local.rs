use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use common::configs::RateLimitRule;
use common::error::Error;

use super::RateLimiter;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct LimiterEntry {
    limiter: DirectLimiter,
    /// 创建时的规则，规则变化后重建
    rule: (u32, u64),
    last_seen: Mutex<Instant>,
}

impl LimiterEntry {
    fn new(rule: &RateLimitRule) -> Self {
        Self {
            limiter: governor::RateLimiter::direct(quota(rule)),
            rule: (rule.max_requests, rule.interval_secs),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn matches(&self, rule: &RateLimitRule) -> bool {
        self.rule == (rule.max_requests, rule.interval_secs)
    }
}

/// 令牌桶参数：速率为 max_requests / interval，容量为 max_requests
fn quota(rule: &RateLimitRule) -> Quota {
    let burst = NonZeroU32::new(rule.burst()).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_secs_f64(1.0 / rule.rate_per_sec().max(f64::MIN_POSITIVE));
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

/// 进程内限流器，每个限流键一个令牌桶
pub struct LocalRateLimiter {
    limiters: RwLock<HashMap<String, Arc<LimiterEntry>>>,
    idle_timeout: Duration,
    clock: DefaultClock,
}

impl LocalRateLimiter {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            idle_timeout,
            clock: DefaultClock::default(),
        }
    }

    fn entry(&self, key: &str, rule: &RateLimitRule) -> Arc<LimiterEntry> {
        if let Some(entry) = self.limiters.read().get(key) {
            if entry.matches(rule) {
                return entry.clone();
            }
        }

        let mut limiters = self.limiters.write();
        match limiters.get(key) {
            Some(entry) if entry.matches(rule) => entry.clone(),
            _ => {
                let entry = Arc::new(LimiterEntry::new(rule));
                limiters.insert(key.to_string(), entry.clone());
                entry
            }
        }
    }

    /// 清理空闲超过阈值的限流器，返回清理数量
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut limiters = self.limiters.write();
        let before = limiters.len();
        limiters.retain(|_, entry| now.duration_since(*entry.last_seen.lock()) < self.idle_timeout);
        before - limiters.len()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动后台清理任务，限流器被释放后任务自动结束
    pub fn spawn_eviction_task(self: &Arc<Self>) -> JoinHandle<()> {
        let period = (self.idle_timeout / 4).max(Duration::from_secs(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = limiter.len(), "已清理空闲限流器");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> Result<(), Error> {
        let entry = self.entry(key, rule);
        *entry.last_seen.lock() = Instant::now();

        entry.limiter.check().map_err(|not_until| Error::RateLimited {
            retry_after: Some(not_until.wait_time_from(self.clock.now())),
        })
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::configs::RateLimitStrategy;

    fn rule(max_requests: u32, interval_secs: u64) -> RateLimitRule {
        RateLimitRule {
            strategy: RateLimitStrategy::Ip,
            max_requests,
            interval_secs,
        }
    }

    #[tokio::test]
    async fn test_burst_then_single_refill() {
        let limiter = LocalRateLimiter::new(Duration::from_secs(3600));
        // 容量5，速率5/s
        let rule = rule(5, 1);
        for _ in 0..5 {
            assert!(limiter.check("ip:1.1.1.1", &rule).await.is_ok());
        }
        let err = limiter.check("ip:1.1.1.1", &rule).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after: Some(_) }));

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert!(limiter.check("ip:1.1.1.1", &rule).await.is_ok());
        assert!(limiter.check("ip:1.1.1.1", &rule).await.is_err());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = LocalRateLimiter::new(Duration::from_secs(3600));
        let rule = rule(1, 60);
        assert!(limiter.check("ip:a", &rule).await.is_ok());
        assert!(limiter.check("ip:a", &rule).await.is_err());
        assert!(limiter.check("ip:b", &rule).await.is_ok());
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test]
    async fn test_rule_change_rebuilds_bucket() {
        let limiter = LocalRateLimiter::new(Duration::from_secs(3600));
        assert!(limiter.check("k", &rule(1, 60)).await.is_ok());
        assert!(limiter.check("k", &rule(1, 60)).await.is_err());
        assert!(limiter.check("k", &rule(2, 60)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let limiter = LocalRateLimiter::new(Duration::from_secs(60));
        limiter.check("old", &rule(10, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        limiter.check("fresh", &rule(10, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_runs_periodically() {
        let limiter = Arc::new(LocalRateLimiter::new(Duration::from_secs(8)));
        limiter.check("k", &rule(10, 1)).await.unwrap();
        let handle = limiter.spawn_eviction_task();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(limiter.is_empty());

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.is_finished());
    }
}
