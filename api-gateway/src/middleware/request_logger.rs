use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{error, info, warn};

use crate::context::{client_ip, HEADER_REQUEST_ID};

/// 访问日志中间件
#[derive(Clone)]
pub struct RequestLoggerLayer {
    trusted_proxies: Arc<[IpAddr]>,
}

impl RequestLoggerLayer {
    pub fn new(trusted_proxies: &[IpAddr]) -> Self {
        Self {
            trusted_proxies: trusted_proxies.into(),
        }
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLogger<S>;

    fn layer(&self, service: S) -> Self::Service {
        RequestLogger {
            inner: service,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestLogger<S> {
    inner: S,
    trusted_proxies: Arc<[IpAddr]>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RequestLogger<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let client_ip = client_ip(&req, &self.trusted_proxies);
        let start_time = Instant::now();

        let future = inner.call(req);

        Box::pin(async move {
            let result = future.await;
            let duration_ms = start_time.elapsed().as_millis();

            match &result {
                Ok(response) => {
                    // 请求ID在租户解析阶段生成，从响应头读取
                    let request_id = response
                        .headers()
                        .get(HEADER_REQUEST_ID)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    let status = response.status();

                    match status {
                        http::StatusCode::BAD_GATEWAY
                        | http::StatusCode::GATEWAY_TIMEOUT
                        | http::StatusCode::INTERNAL_SERVER_ERROR => error!(
                            method = %method,
                            path = %path,
                            status = status.as_u16(),
                            duration_ms = %duration_ms,
                            request_id = %request_id,
                            client_ip = %client_ip,
                            "HTTP请求处理失败"
                        ),
                        _ => info!(
                            method = %method,
                            path = %path,
                            status = status.as_u16(),
                            duration_ms = %duration_ms,
                            request_id = %request_id,
                            client_ip = %client_ip,
                            "HTTP请求处理完成"
                        ),
                    }
                }
                Err(_) => warn!(
                    method = %method,
                    path = %path,
                    duration_ms = %duration_ms,
                    client_ip = %client_ip,
                    "HTTP请求处理异常"
                ),
            }

            result
        })
    }
}
