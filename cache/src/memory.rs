use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use common::error::Error;

use crate::{refill_and_take, BucketSpec, BucketState, TakeOutcome, TokenBucketStore};

/// 进程内令牌桶存储
///
/// 单把互斥锁保护整张表，等价于Redis单线程执行Lua脚本的原子语义
#[derive(Debug)]
pub struct MemoryTokenBucketStore {
    /// 时间基准，所有时间戳都是相对它的毫秒数
    epoch: Instant,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryTokenBucketStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// 当前保存的桶数量
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

impl Default for MemoryTokenBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenBucketStore for MemoryTokenBucketStore {
    async fn take(&self, key: &str, spec: &BucketSpec) -> Result<TakeOutcome, Error> {
        let now_ms = self.now_ms();
        let ttl_ms = spec.ttl_secs.saturating_mul(1000);

        let mut buckets = self.buckets.lock();
        // 超过TTL未访问的桶视为已过期，与Redis的EXPIRE行为一致
        let previous = buckets
            .get(key)
            .copied()
            .filter(|state| now_ms.saturating_sub(state.last_refill_ms) <= ttl_ms);
        let (state, outcome) = refill_and_take(previous, now_ms, spec);
        buckets.insert(key.to_string(), state);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> BucketSpec {
        BucketSpec {
            rate: 1.0,
            burst: 2,
            ttl_secs: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_until_empty_then_refill() {
        let store = MemoryTokenBucketStore::new();
        assert!(store.take("ip:1", &spec()).await.unwrap().allowed);
        assert!(store.take("ip:1", &spec()).await.unwrap().allowed);
        assert!(!store.take("ip:1", &spec()).await.unwrap().allowed);

        // 其他键互不影响
        assert!(store.take("ip:2", &spec()).await.unwrap().allowed);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(store.take("ip:1", &spec()).await.unwrap().allowed);
        assert!(!store.take("ip:1", &spec()).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_bucket_starts_full() {
        let store = MemoryTokenBucketStore::new();
        let spec = BucketSpec {
            rate: 0.001,
            burst: 1,
            ttl_secs: 5,
        };
        assert!(store.take("user:7", &spec).await.unwrap().allowed);
        assert!(!store.take("user:7", &spec).await.unwrap().allowed);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.take("user:7", &spec).await.unwrap().allowed);
        assert_eq!(store.len(), 1);
    }
}
