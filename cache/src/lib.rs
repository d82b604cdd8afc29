/**
 * 共享存储模块
 *
 * 本模块为分布式限流提供令牌桶存储接口及实现：
 * 1. Redis实现 - 通过Lua脚本在服务端原子地完成"补充令牌 + 扣减令牌"
 * 2. 内存实现 - 与Lua脚本算法一致，用于单实例部署和测试
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use common::config::RedisConfig;
use common::error::Error;

mod memory;
mod redis;

pub use self::memory::MemoryTokenBucketStore;
pub use self::redis::RedisTokenBucketStore;

/// 令牌桶参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// 每秒补充的令牌数
    pub rate: f64,
    /// 桶容量
    pub burst: u32,
    /// 存储条目的过期时间（秒），等于限流窗口
    pub ttl_secs: u64,
}

/// 一次取令牌的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeOutcome {
    pub allowed: bool,
    /// 扣减后剩余的令牌数
    pub remaining: f64,
}

/// 令牌桶的持久化状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// 上次补充时间（毫秒）
    pub last_refill_ms: u64,
}

/// 补充并尝试扣减一个令牌
///
/// Redis端的Lua脚本执行完全相同的计算；`state` 为 `None` 表示桶不存在，按满桶处理。
/// 时间回拨时不补充令牌，且上次补充时间不会倒退。
pub fn refill_and_take(state: Option<BucketState>, now_ms: u64, spec: &BucketSpec) -> (BucketState, TakeOutcome) {
    let burst = spec.burst as f64;
    let (tokens, last) = match state {
        Some(s) => (s.tokens, s.last_refill_ms),
        None => (burst, now_ms),
    };

    let elapsed_ms = now_ms.saturating_sub(last);
    let mut tokens = (tokens + elapsed_ms as f64 / 1000.0 * spec.rate).min(burst);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    (
        BucketState {
            tokens,
            last_refill_ms: now_ms.max(last),
        },
        TakeOutcome {
            allowed,
            remaining: tokens,
        },
    )
}

/// 令牌桶存储特征
///
/// 实现必须保证单个键上的"补充 + 扣减"是原子的
#[async_trait]
pub trait TokenBucketStore: Sync + Send + Debug {
    /// 对 `key` 对应的桶执行一次取令牌
    async fn take(&self, key: &str, spec: &BucketSpec) -> Result<TakeOutcome, Error>;
}

/// 根据配置创建Redis存储，`key_prefix` 用于隔离共用同一个Redis的多套部署
pub async fn redis_store(
    config: &RedisConfig,
    key_prefix: &str,
) -> Result<Arc<dyn TokenBucketStore>, Error> {
    Ok(Arc::new(
        RedisTokenBucketStore::from_config(config)
            .await?
            .with_key_prefix(key_prefix),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rate: f64, burst: u32) -> BucketSpec {
        BucketSpec {
            rate,
            burst,
            ttl_secs: 60,
        }
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let (state, outcome) = refill_and_take(None, 1_000, &spec(1.0, 3));
        assert!(outcome.allowed);
        assert_eq!(state.tokens, 2.0);
        assert_eq!(state.last_refill_ms, 1_000);
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let state = BucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        };
        let (state, outcome) = refill_and_take(Some(state), 3_600_000, &spec(10.0, 5));
        assert!(outcome.allowed);
        assert_eq!(state.tokens, 4.0);
    }

    #[test]
    fn test_empty_bucket_rejects_until_refilled() {
        let empty = BucketState {
            tokens: 0.0,
            last_refill_ms: 10_000,
        };
        // 速率 2/s，250ms 只补充半个令牌
        let (state, outcome) = refill_and_take(Some(empty), 10_250, &spec(2.0, 2));
        assert!(!outcome.allowed);
        assert!((state.tokens - 0.5).abs() < 1e-9);

        let (_, outcome) = refill_and_take(Some(state), 10_500, &spec(2.0, 2));
        assert!(outcome.allowed);
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let state = BucketState {
            tokens: 0.0,
            last_refill_ms: 5_000,
        };
        let (state, outcome) = refill_and_take(Some(state), 4_000, &spec(100.0, 10));
        assert!(!outcome.allowed);
        assert_eq!(state.last_refill_ms, 5_000);
        assert_eq!(state.tokens, 0.0);
    }
}
