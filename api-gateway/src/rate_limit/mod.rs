/**
 * 限流
 *
 * 两种可互换的实现：进程内令牌桶（governor）和基于共享存储的分布式令牌桶。
 * 限流键为 `策略:值`，首选属性缺失时回退为客户端IP。
 * 超限请求立即拒绝，不排队。
 */
mod distributed;
mod local;

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::info;

use common::configs::{RateLimitRule, RateLimitStrategy};
use common::error::Error;

use crate::context::RequestContext;
use crate::gateway::GatewayState;

pub use distributed::DistributedRateLimiter;
pub use local::LocalRateLimiter;

/// 限流器
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// 对 `key` 取一个令牌，超限时返回 `RateLimited`
    async fn check(&self, key: &str, rule: &RateLimitRule) -> Result<(), Error>;

    /// 实现名称，用于日志
    fn backend(&self) -> &'static str;
}

/// 根据策略生成限流键
///
/// 用户、租户缺失时回退为 `ip:<客户端IP>`
pub fn limiter_key(strategy: RateLimitStrategy, context: &RequestContext, path: &str) -> String {
    let ip_key = || format!("ip:{}", context.client_ip);
    match strategy {
        RateLimitStrategy::Ip => ip_key(),
        RateLimitStrategy::User => context
            .user
            .as_ref()
            .map(|user| format!("user:{}", user.id))
            .unwrap_or_else(ip_key),
        RateLimitStrategy::Tenant => context
            .tenant_id
            .as_ref()
            .map(|tenant| format!("tenant:{}", tenant))
            .unwrap_or_else(ip_key),
        RateLimitStrategy::Path => format!("path:{}", path),
    }
}

/// 限流中间件
#[derive(Clone)]
pub struct RateLimitLayer {
    state: GatewayState,
}

impl RateLimitLayer {
    pub fn new(state: GatewayState) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// 限流服务
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: GatewayState,
}

/// 一次限流检查所需的数据，与请求体解耦以便跨await持有
struct LimitCheck {
    key: String,
    rule: RateLimitRule,
    request_id: String,
    path: String,
}

impl<S> RateLimitService<S> {
    /// 确定请求适用的规则和限流键
    ///
    /// 服务配置了独立规则时，限流键带上服务名，避免与全局规则共用令牌桶
    fn plan(state: &GatewayState, request: &Request<Body>) -> Option<LimitCheck> {
        let config = &state.config.gateway.rate_limit;
        if !config.enabled {
            return None;
        }

        let path = request.uri().path();
        let service = state.routes.match_service(path);
        let (rule, scope) = match service
            .as_ref()
            .and_then(|s| s.rate_limit.as_ref().map(|r| (r, s)))
        {
            Some((rule, service)) => (rule.clone(), Some(service.name.clone())),
            None => (config.default_rule.clone(), None),
        };

        let fallback;
        let context = match request.extensions().get::<RequestContext>() {
            Some(context) => context,
            None => {
                fallback = RequestContext::new(
                    "-",
                    crate::context::client_ip(request, &state.config.gateway.trusted_proxies),
                );
                &fallback
            }
        };

        let key = limiter_key(rule.strategy, context, path);
        let key = match scope {
            Some(service) => format!("{}:{}", service, key),
            None => key,
        };

        Some(LimitCheck {
            key,
            rule,
            request_id: context.request_id.clone(),
            path: path.to_string(),
        })
    }

    async fn check(state: &GatewayState, plan: LimitCheck) -> Result<(), Error> {
        state
            .rate_limiter
            .check(&plan.key, &plan.rule)
            .await
            .inspect_err(|_| {
                state.metrics.rate_limited(plan.rule.strategy.as_str());
                info!(
                    key = %plan.key,
                    backend = state.rate_limiter.backend(),
                    request_id = %plan.request_id,
                    "请求被限流: 路径={}",
                    plan.path
                );
            })
    }
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // 使用已就绪的实例处理本次请求
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();

        let plan = Self::plan(&state, &request);

        Box::pin(async move {
            if let Some(plan) = plan {
                if let Err(e) = Self::check(&state, plan).await {
                    return Ok(e.into_response());
                }
            }
            inner.call(request).await
        })
    }
}

/// 根据配置创建限流器
pub fn build_rate_limiter(
    config: &common::configs::RateLimitConfig,
    store: Option<Arc<dyn cache::TokenBucketStore>>,
) -> (Arc<dyn RateLimiter>, Option<Arc<LocalRateLimiter>>) {
    use common::configs::RateLimitBackend;

    match (config.backend, store) {
        (RateLimitBackend::Redis, Some(store)) => {
            (
                Arc::new(DistributedRateLimiter::new(store, config.store_timeout())),
                None,
            )
        }
        _ => {
            let local = Arc::new(LocalRateLimiter::new(std::time::Duration::from_secs(
                config.idle_eviction_secs.max(1),
            )));
            (local.clone(), Some(local))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUser;

    #[test]
    fn test_limiter_key_fallbacks() {
        let mut context = RequestContext::new("r-1", "10.1.1.1");
        assert_eq!(limiter_key(RateLimitStrategy::Ip, &context, "/a"), "ip:10.1.1.1");
        assert_eq!(limiter_key(RateLimitStrategy::User, &context, "/a"), "ip:10.1.1.1");
        assert_eq!(limiter_key(RateLimitStrategy::Tenant, &context, "/a"), "ip:10.1.1.1");
        assert_eq!(limiter_key(RateLimitStrategy::Path, &context, "/a/b"), "path:/a/b");

        context.tenant_id = Some("t-9".to_string());
        context.user = Some(AuthUser {
            id: "u-1".to_string(),
            ..Default::default()
        });
        assert_eq!(limiter_key(RateLimitStrategy::User, &context, "/a"), "user:u-1");
        assert_eq!(limiter_key(RateLimitStrategy::Tenant, &context, "/a"), "tenant:t-9");
    }
}
