/**
 * Redis令牌桶实现
 *
 * 每个限流键在Redis中对应两个条目：剩余令牌数与上次补充时间戳，
 * 二者的TTL等于限流窗口。补充与扣减在同一个Lua脚本里完成，
 * 多个网关实例并发访问同一个键时由Redis保证原子性，网关侧不加锁。
 */
use crate::{BucketSpec, TakeOutcome, TokenBucketStore};
use async_trait::async_trait;
use common::config::RedisConfig;
use common::error::Error;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 默认键前缀
const DEFAULT_KEY_PREFIX: &str = "gateway:ratelimit";

/// 补充并扣减令牌的Lua脚本
///
/// KEYS[1] 令牌数，KEYS[2] 上次补充时间（毫秒）
/// ARGV[1] 每秒速率，ARGV[2] 桶容量，ARGV[3] TTL（秒），ARGV[4] 当前时间（毫秒）
const TOKEN_BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local tokens = tonumber(redis.call('GET', KEYS[1]))
local last = tonumber(redis.call('GET', KEYS[2]))
if tokens == nil then
    tokens = burst
end
if last == nil then
    last = now
end

local elapsed = now - last
if elapsed < 0 then
    elapsed = 0
end
tokens = math.min(burst, tokens + elapsed / 1000 * rate)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('SET', KEYS[1], tostring(tokens), 'EX', ttl)
redis.call('SET', KEYS[2], tostring(math.max(now, last)), 'EX', ttl)
return {allowed, tostring(tokens)}
"#;

/// 生成令牌数和时间戳两个键，使用hash tag保证集群模式下落在同一槽位
fn bucket_keys(prefix: &str, key: &str) -> (String, String) {
    (
        format!("{}:{{{}}}:tokens", prefix, key),
        format!("{}:{{{}}}:ts", prefix, key),
    )
}

/// Redis令牌桶存储
pub struct RedisTokenBucketStore {
    /// Redis客户端
    client: Client,
    /// 自动重连的连接管理器
    connection: ConnectionManager,
    /// 令牌桶脚本，调用时使用EVALSHA，脚本缓存丢失时自动回退EVAL
    script: Script,
    key_prefix: String,
}

/// 为RedisTokenBucketStore实现Debug特征
impl Debug for RedisTokenBucketStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTokenBucketStore")
            .field("client", &self.client)
            .field("script", &self.script.get_hash())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisTokenBucketStore {
    /// 通过Redis客户端创建存储
    pub async fn new(client: Client, key_prefix: impl Into<String>) -> Result<Self, Error> {
        let connection = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            key_prefix: key_prefix.into(),
        })
    }

    /// 从配置创建存储
    pub async fn from_config(config: &RedisConfig) -> Result<Self, Error> {
        let client = Client::open(config.url())?;
        let connect = Self::new(client, DEFAULT_KEY_PREFIX);
        match config.connection_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), connect)
                .await
                .map_err(|_| Error::Redis(format!("连接Redis超时: {}", config.url())))?,
            None => connect.await,
        }
    }

    /// 使用自定义前缀
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    fn keys(&self, key: &str) -> (String, String) {
        bucket_keys(&self.key_prefix, key)
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

#[async_trait]
impl TokenBucketStore for RedisTokenBucketStore {
    async fn take(&self, key: &str, spec: &BucketSpec) -> Result<TakeOutcome, Error> {
        let (tokens_key, ts_key) = self.keys(key);
        let mut conn = self.connection.clone();

        let (allowed, remaining): (i64, String) = self
            .script
            .key(&tokens_key)
            .key(&ts_key)
            .arg(spec.rate)
            .arg(spec.burst)
            .arg(spec.ttl_secs.max(1))
            .arg(Self::now_ms())
            .invoke_async(&mut conn)
            .await?;

        Ok(TakeOutcome {
            allowed: allowed == 1,
            remaining: remaining.parse().unwrap_or(0.0),
        })
    }
}
