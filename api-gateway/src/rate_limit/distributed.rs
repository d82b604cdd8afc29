use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use cache::{BucketSpec, TokenBucketStore};
use common::configs::RateLimitRule;
use common::error::Error;

use super::RateLimiter;

/// 分布式限流器
///
/// 令牌桶状态保存在共享存储中，补充与扣减由存储端原子完成，网关侧不加锁。
/// 存储不可用或在 `timeout` 内没有响应时放行请求并记录错误。
pub struct DistributedRateLimiter {
    store: Arc<dyn TokenBucketStore>,
    timeout: Duration,
}

impl DistributedRateLimiter {
    pub fn new(store: Arc<dyn TokenBucketStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn spec(rule: &RateLimitRule) -> BucketSpec {
        BucketSpec {
            rate: rule.rate_per_sec(),
            burst: rule.burst(),
            ttl_secs: rule.interval_secs.max(1),
        }
    }
}

#[async_trait]
impl RateLimiter for DistributedRateLimiter {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> Result<(), Error> {
        let spec = Self::spec(rule);
        let result = tokio::time::timeout(self.timeout, self.store.take(key, &spec))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Redis(format!(
                    "限流存储响应超时 ({}ms)",
                    self.timeout.as_millis()
                )))
            });
        match result {
            Ok(outcome) if outcome.allowed => Ok(()),
            Ok(outcome) => {
                // 攒够一个令牌需要的时间
                let missing = (1.0 - outcome.remaining).max(0.0);
                let wait = if spec.rate > 0.0 { missing / spec.rate } else { 1.0 };
                Err(Error::RateLimited {
                    retry_after: Some(Duration::from_secs_f64(wait)),
                })
            }
            Err(e) => {
                error!(key = %key, "限流存储不可用，放行请求: {}", e);
                Ok(())
            }
        }
    }

    fn backend(&self) -> &'static str {
        "distributed"
    }
}
