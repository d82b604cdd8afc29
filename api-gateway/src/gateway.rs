/**
 * 网关组装
 *
 * `GatewayState` 持有全部共享组件，由各中间件和处理函数共享；
 * `build_router` 按固定顺序组装中间件链：
 * panic恢复 -> 访问日志 -> CORS -> 安全头 -> 租户/平台解析 -> 限流 -> 分发（熔断、认证、超时、转发）
 */
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, warn};

use common::config::AppConfig;
use common::configs::{ServiceConfig, ServiceType};
use common::error::Error;

use crate::admin;
use crate::auth::controller::issue_credentials;
use crate::auth::{AuthManager, PermissionChecker, PolicyPermissionChecker};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::metrics::{get_metrics_handler, GatewayMetrics};
use crate::middleware::{cors_layer, security_headers, RequestLoggerLayer};
use crate::pipeline;
use crate::proxy::ServiceProxy;
use crate::rate_limit::{RateLimitLayer, RateLimiter};
use crate::router::RouteTable;
use crate::tenant::{self, TenantResolver};

/// 网关共享状态
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<AppConfig>,
    pub routes: Arc<RouteTable>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub auth: Arc<AuthManager>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub tenants: Arc<TenantResolver>,
    pub proxy: Arc<ServiceProxy>,
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayState {
    /// 创建网关状态并挂载配置中的服务
    ///
    /// 单个服务挂载失败只记录错误，不影响其它服务
    pub fn new(config: Arc<AppConfig>, rate_limiter: Arc<dyn RateLimiter>) -> Result<Self, Error> {
        let gateway = &config.gateway;

        let metrics = Arc::new(
            GatewayMetrics::new().map_err(|e| Error::Internal(format!("初始化指标失败: {}", e)))?,
        );
        let listener_metrics = metrics.clone();
        let breakers = CircuitBreakerRegistry::new(gateway.circuit_breaker.clone()).with_listener(
            Arc::new(move |name: &str, from: CircuitState, to: CircuitState| {
                listener_metrics.breaker_state_changed(name, from, to)
            }),
        );

        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Internal(format!("创建HTTP客户端失败: {}", e)))?;

        let auth = AuthManager::from_config(&gateway.auth, http_client.clone())?;
        let permissions = PolicyPermissionChecker::new(gateway.auth.policies.clone());

        let state = Self {
            routes: Arc::new(RouteTable::new()),
            breakers: Arc::new(breakers),
            rate_limiter,
            auth: Arc::new(auth),
            permissions: Arc::new(permissions),
            tenants: Arc::new(TenantResolver::from_config(&gateway.tenant)),
            proxy: Arc::new(ServiceProxy::new(http_client)),
            metrics,
            config: config.clone(),
        };

        for service in &gateway.services {
            if let Err(e) = state.register_service(service.clone()) {
                error!(service = %service.name, "服务挂载失败: {}", e);
            }
        }
        info!(services = state.routes.get_services().len(), "网关状态初始化完成");
        Ok(state)
    }

    /// 注册或替换服务，替换时重置该服务的熔断器
    pub fn register_service(&self, config: ServiceConfig) -> Result<Option<Arc<ServiceConfig>>, Error> {
        let proxy = self.proxy.clone();
        let previous = self
            .routes
            .register_service(config, |service, route| proxy.bind(service, route))?;
        if let Some(previous) = &previous {
            self.release(previous);
        }
        Ok(previous)
    }

    /// 删除服务
    pub fn deregister_service(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        let removed = self.routes.deregister_service(name)?;
        self.release(&removed);
        Some(removed)
    }

    fn release(&self, service: &ServiceConfig) {
        self.breakers.remove(&service.name);
        if service.service_type == ServiceType::Grpc {
            self.proxy.grpc().evict(&service.target);
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown");
    error!("请求处理发生panic: {}", detail);
    Error::Internal("请求处理发生内部错误".to_string()).into_response()
}

/// 组装网关路由和中间件链
pub fn build_router(state: GatewayState) -> Router {
    let gateway = &state.config.gateway;
    let metrics_endpoint = if gateway.metrics_endpoint.starts_with('/') {
        gateway.metrics_endpoint.clone()
    } else {
        warn!(endpoint = %gateway.metrics_endpoint, "指标端点必须以 / 开头，使用 /metrics");
        "/metrics".to_string()
    };

    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(RequestLoggerLayer::new(&gateway.trusted_proxies))
        .layer(cors_layer(&gateway.cors))
        .layer(axum::middleware::from_fn(security_headers))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            tenant::resolve_context,
        ))
        .layer(RateLimitLayer::new(state.clone()));

    Router::new()
        .route("/health", get(health))
        .route(&metrics_endpoint, get(get_metrics_handler))
        .route("/auth/token", post(issue_credentials))
        .nest("/admin", admin::routes(state.clone()))
        .fallback(pipeline::dispatch)
        .layer(middleware)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthUser, JwtProvider};
    use crate::rate_limit::build_rate_limiter;
    use crate::router::RouteHandler;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::configs::{ApiKeyEntry, AuthType, RateLimitRule, RateLimitStrategy, RouteConfig};
    use futures::FutureExt;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn state_with(config: AppConfig) -> GatewayState {
        let (limiter, _) = build_rate_limiter(&config.gateway.rate_limit, None);
        GatewayState::new(Arc::new(config), limiter).unwrap()
    }

    fn service(name: &str, prefix: &str, target: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            prefix: prefix.to_string(),
            target: target.to_string(),
            service_type: ServiceType::Http,
            authentication: false,
            timeout: 5,
            routes: vec![],
            circuit_breaker: None,
            rate_limit: None,
            grpc: None,
        }
    }

    /// 用固定处理函数挂载服务，统计调用次数
    fn mount_fixed(state: &GatewayState, config: ServiceConfig, status: StatusCode) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: RouteHandler = Arc::new(move |_request: Request<Body>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok((status, "fixed").into_response()) }.boxed()
        });
        state
            .routes
            .register_service(config, |_, _| handler.clone())
            .unwrap();
        calls
    }

    /// 模拟来自指定套接字地址的连接
    fn from_peer(builder: axum::http::request::Builder, peer: &str) -> Request<Body> {
        let peer: std::net::SocketAddr = peer.parse().unwrap();
        builder
            .extension(axum::extract::ConnectInfo(peer))
            .body(Body::empty())
            .unwrap()
    }

    async fn send(state: &GatewayState, request: Request<Body>) -> Response {
        build_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn echo_backend() -> String {
        async fn echo(headers: axum::http::HeaderMap, uri: axum::http::Uri) -> Json<Value> {
            let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
            Json(json!({
                "path": uri.path(),
                "tenant": header("x-tenant-id"),
                "platform": header("x-app-platform"),
                "request_id": header("x-request-id"),
                "user_id": header("x-user-id"),
            }))
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_and_security_headers() {
        let state = state_with(AppConfig::default());
        let response = send(&state, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let state = state_with(AppConfig::default());
        let response = send(
            &state,
            Request::get("/nowhere")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-request-id"], "req-42");
        assert_eq!(json_body(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn test_proxy_forwards_context_headers() {
        let mut config = AppConfig::default();
        config.gateway.services = vec![service("content", "/api/content", &echo_backend().await)];
        let state = state_with(config);

        let response = send(
            &state,
            Request::get("/api/content/articles/1")
                .header("x-tenant-id", "t-header")
                .header("host", "acme.example.com")
                .header("user-agent", "Mozilla/5.0 (iPhone)")
                .header("x-user-id", "spoofed")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response.headers()["x-request-id"].to_str().unwrap().to_string();
        let body = json_body(response).await;
        assert_eq!(body["path"], "/api/content/articles/1");
        assert_eq!(body["tenant"], "t-header");
        assert_eq!(body["platform"], "mobile");
        assert_eq!(body["request_id"], request_id.as_str());
        assert_eq!(body["user_id"], Value::Null);
        assert_eq!(
            state.metrics.requests_count("content", "GET", StatusCode::OK),
            1
        );
    }

    #[tokio::test]
    async fn test_authentication_and_rbac() {
        let config = AppConfig::default();
        let jwt = JwtProvider::new(config.gateway.auth.jwt.clone());
        let state = state_with(config);

        let mut orders = service("orders", "/api/orders", "http://127.0.0.1:9");
        orders.authentication = true;
        let mut route = RouteConfig::new("/{id}", "GET");
        route.roles = vec!["admin".to_string()];
        orders.routes = vec![route];
        let calls = mount_fixed(&state, orders, StatusCode::OK);

        let response = send(&state, Request::get("/api/orders/1").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "credentials_not_found");

        let token = |role: &str| {
            jwt.issue_token(&AuthUser {
                id: "u-1".to_string(),
                username: "alice".to_string(),
                role: role.to_string(),
                ..Default::default()
            })
            .unwrap()
        };
        let request = |token: String| {
            Request::get("/api/orders/1")
                .header("authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap()
        };

        let response = send(&state, request(token("viewer"))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let response = send(&state, request(token("admin"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let response = send(&state, request("garbage".to_string())).await;
        assert_eq!(json_body(response).await["code"], "invalid_credentials");
    }

    #[tokio::test]
    async fn test_rate_limit_runs_before_auth() {
        let state = state_with(ip_limited_config(2));
        let mut secured = service("secured", "/api/secured", "http://127.0.0.1:9");
        secured.authentication = true;
        mount_fixed(&state, secured, StatusCode::OK);

        let request = || from_peer(Request::get("/api/secured/x"), "10.9.9.9:40000");
        for _ in 0..2 {
            assert_eq!(send(&state, request()).await.status(), StatusCode::UNAUTHORIZED);
        }
        let response = send(&state, request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(json_body(response).await["code"], "rate_limited");
        assert_eq!(state.metrics.rate_limited_count("ip"), 1);

        // 其它客户端不受影响
        let other = from_peer(Request::get("/api/secured/x"), "10.9.9.10:40000");
        assert_eq!(send(&state, other).await.status(), StatusCode::UNAUTHORIZED);
    }

    fn ip_limited_config(max_requests: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.gateway.rate_limit.enabled = true;
        config.gateway.rate_limit.default_rule = RateLimitRule {
            strategy: RateLimitStrategy::Ip,
            max_requests,
            interval_secs: 60,
        };
        config
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_bypass_ip_limit() {
        let state = state_with(ip_limited_config(1));
        mount_fixed(&state, service("open", "/api/open", "http://127.0.0.1:9"), StatusCode::OK);

        let mut allowed = 0;
        for i in 0..50 {
            let request = Request::get("/api/open/x").header("x-forwarded-for", format!("198.51.100.{}", i));
            if send(&state, from_peer(request, "203.0.113.7:5555")).await.status() == StatusCode::OK {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
        assert_eq!(state.metrics.rate_limited_count("ip"), 49);
    }

    #[tokio::test]
    async fn test_trusted_proxy_forwards_client_identity() {
        let mut config = ip_limited_config(1);
        config.gateway.trusted_proxies = vec!["10.0.0.254".parse().unwrap()];
        let state = state_with(config);
        mount_fixed(&state, service("open", "/api/open", "http://127.0.0.1:9"), StatusCode::OK);

        let request = |client: &str| {
            from_peer(
                Request::get("/api/open/x").header("x-forwarded-for", client),
                "10.0.0.254:443",
            )
        };
        assert_eq!(send(&state, request("198.51.100.1")).await.status(), StatusCode::OK);
        assert_eq!(send(&state, request("198.51.100.2")).await.status(), StatusCode::OK);
        assert_eq!(
            send(&state, request("198.51.100.1")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_circuit_opens_after_upstream_failures() {
        let state = state_with(AppConfig::default());
        let mut flaky = service("flaky", "/api/flaky", "http://127.0.0.1:9");
        flaky.circuit_breaker = Some(common::configs::CircuitBreakerSettings {
            max_requests: 2,
            ..Default::default()
        });
        let calls = mount_fixed(&state, flaky, StatusCode::INTERNAL_SERVER_ERROR);

        let request = || Request::get("/api/flaky/x").body(Body::empty()).unwrap();
        for _ in 0..2 {
            assert_eq!(send(&state, request()).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        let response = send(&state, request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "circuit_open");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            state.breakers.get("flaky").unwrap().state(),
            CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out() {
        let state = state_with(AppConfig::default());
        let mut slow = service("slow", "/api/slow", "http://127.0.0.1:9");
        slow.timeout = 2;
        let handler: RouteHandler = Arc::new(|_request: Request<Body>| {
            async {
                std::future::pending::<()>().await;
                Ok(StatusCode::OK.into_response())
            }
            .boxed()
        });
        state
            .routes
            .register_service(slow, |_, _| handler.clone())
            .unwrap();

        let started = tokio::time::Instant::now();
        let response = send(&state, Request::get("/api/slow/x").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(
            state.breakers.get("slow").unwrap().counts().total_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_issue_jwt_for_api_key_caller() {
        let mut config = AppConfig::default();
        config.gateway.auth.providers = vec![AuthType::Jwt, AuthType::ApiKey];
        config.gateway.auth.api_key.keys = vec![ApiKeyEntry {
            key: "k-1".to_string(),
            user_id: "svc-1".to_string(),
            username: "billing".to_string(),
            role: "service".to_string(),
            tenant_id: String::new(),
        }];
        let state = state_with(config);

        let response = send(
            &state,
            Request::post("/auth/token?type=jwt")
                .header("x-api-key", "k-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["type"], "jwt");
        let user = JwtProvider::new(state.config.gateway.auth.jwt.clone())
            .verify_token(body["token"].as_str().unwrap())
            .unwrap();
        assert_eq!(user.id, "svc-1");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state_with(AppConfig::default());
        mount_fixed(&state, service("m", "/api/m", "http://127.0.0.1:9"), StatusCode::OK);
        send(&state, Request::get("/api/m/x").body(Body::empty()).unwrap()).await;

        let response = send(&state, Request::get("/metrics").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("requests_total"));
    }
}
