/**
 * 请求分发
 *
 * 外层中间件（panic恢复、访问日志、CORS、安全头、租户解析、限流）之后的阶段：
 * 路由解析 -> 熔断 -> 认证/授权（服务要求时）-> dispatch span -> 超时控制 -> 转发。
 * 任一阶段失败都直接写回错误响应，后续阶段不再执行。
 */
use std::future::Future;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, info_span, warn, Instrument};

use common::error::Error;

use crate::auth::middleware::{authenticate_request, forward_identity};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::context::RequestContext;
use crate::gateway::GatewayState;

/// 在超时时间内执行转发，超时后丢弃转发任务
pub async fn with_timeout<F>(service: &str, timeout: Duration, future: F) -> Result<Response, Error>
where
    F: Future<Output = Result<Response, Error>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(service = %service, timeout_ms = timeout.as_millis() as u64, "后端响应超时");
            Err(Error::GatewayTimeout(format!(
                "服务 {} 在 {}ms 内未响应",
                service,
                timeout.as_millis()
            )))
        }
    }
}

fn log_rejection(service: &str, request_id: &str, err: &Error) {
    let status = err.status_code();
    if err.is_policy_rejection() || status.is_client_error() {
        info!(service = %service, request_id = %request_id, code = err.code(), "请求被拒绝: {}", err);
    } else {
        error!(service = %service, request_id = %request_id, code = err.code(), "请求处理失败: {}", err);
    }
}

/// 网关的兜底处理函数，所有未被内置接口匹配的请求都从这里分发
pub async fn dispatch(State(state): State<GatewayState>, request: Request<Body>) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.request_id.clone())
        .unwrap_or_else(|| "-".to_string());

    let resolved = match state.routes.resolve(&method, &path) {
        Ok(resolved) => resolved,
        Err(e) => {
            info!(request_id = %request_id, "路由未命中: {} {}", method, path);
            return e.into_response();
        }
    };
    let service = resolved.service.clone();
    let finish = |response: Response| {
        state
            .metrics
            .observe_request(&service.name, method.as_str(), response.status(), started.elapsed());
        response
    };

    // 熔断
    let breaker_key = CircuitBreakerRegistry::key_for(Some(&service.name), &path);
    let breaker = state
        .breakers
        .get_or_create(&breaker_key, service.circuit_breaker.as_ref());
    let permit = match breaker.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            log_rejection(&service.name, &request_id, &e);
            return finish(e.into_response());
        }
    };

    // 认证与授权，被拒绝的请求不计入熔断统计
    let (mut parts, body) = request.into_parts();
    let user = match authenticate_request(
        &state.auth,
        state.permissions.as_ref(),
        &parts,
        &service,
        &resolved.route,
    )
    .await
    {
        Ok(user) => user,
        Err(e) => {
            log_rejection(&service.name, &request_id, &e);
            drop(permit);
            return finish(e.into_response());
        }
    };

    forward_identity(&mut parts.headers, user.as_ref());
    let tenant = match parts.extensions.get_mut::<RequestContext>() {
        Some(context) => {
            context.user = user;
            context.effective_tenant().unwrap_or_default().to_string()
        }
        None => String::new(),
    };
    parts.extensions.insert(resolved.params.clone());
    let request = Request::from_parts(parts, body);

    let span = info_span!(
        "gateway.dispatch",
        service = %service.name,
        route = %resolved.route.path,
        method = %method,
        tenant = %tenant,
        request_id = %request_id,
    );
    let result = with_timeout(&service.name, service.timeout(), (resolved.handler)(request))
        .instrument(span)
        .await;

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            log_rejection(&service.name, &request_id, &e);
            e.into_response()
        }
    };
    permit.record_status(response.status());
    finish(response)
}
