use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::Response;
use futures::FutureExt;
use reqwest::Client;
use tracing::{debug, error};

use common::configs::{RouteConfig, ServiceConfig, ServiceType};
use common::error::Error;

use super::grpc_client::GrpcBridge;
use super::utils::{is_hop_by_hop, join_url, merge_query, process_request_body};
use crate::context::RequestContext;
use crate::router::{strip_prefix, RouteHandler};

/// 请求体大小上限
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// 服务代理 - 按服务类型把请求转发到HTTP后端或gRPC后端
pub struct ServiceProxy {
    http_client: Client,
    grpc: GrpcBridge,
}

impl ServiceProxy {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            grpc: GrpcBridge::new(),
        }
    }

    pub fn grpc(&self) -> &GrpcBridge {
        &self.grpc
    }

    /// 为路由生成处理函数
    pub fn bind(self: &Arc<Self>, service: &Arc<ServiceConfig>, route: &Arc<RouteConfig>) -> RouteHandler {
        let proxy = self.clone();
        let service = service.clone();
        let route = route.clone();
        Arc::new(move |request| {
            let proxy = proxy.clone();
            let service = service.clone();
            let route = route.clone();
            async move { proxy.dispatch(request, &service, &route).await }.boxed()
        })
    }

    /// 转发请求到后端服务
    pub async fn dispatch(
        &self,
        request: Request<Body>,
        service: &ServiceConfig,
        route: &RouteConfig,
    ) -> Result<Response, Error> {
        match service.service_type {
            ServiceType::Http => self.forward_http(request, service, route).await,
            ServiceType::Grpc => self.grpc.invoke(request, service, route).await,
        }
    }

    /// 转发HTTP请求
    async fn forward_http(
        &self,
        request: Request<Body>,
        service: &ServiceConfig,
        route: &RouteConfig,
    ) -> Result<Response, Error> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path();

        let forward_path = if route.strip_path {
            match strip_prefix(path, &service.normalized_prefix()) {
                Some("") | None => "/",
                Some(rest) => rest,
            }
        } else {
            path
        };

        let base = route.target.as_deref().unwrap_or(&service.target);
        let mut target_url = join_url(base, forward_path);
        if let Some(query) = merge_query(parts.uri.query(), &route.query_params) {
            target_url.push('?');
            target_url.push_str(&query);
        }
        debug!("转发HTTP请求: {} -> {}", path, target_url);

        let body_bytes = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| Error::BadRequest(format!("无法读取请求体: {}", e)))?;

        // 如果是GZIP压缩的JSON则自动解压
        let header_str = |name| parts.headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());
        let (processed_body, decompressed) = process_request_body(
            &body_bytes,
            header_str(CONTENT_TYPE),
            header_str(CONTENT_ENCODING),
            MAX_BODY_SIZE,
        )?;

        let mut headers = HeaderMap::with_capacity(parts.headers.len() + route.headers.len() + 4);
        for (name, value) in &parts.headers {
            if name == HOST || name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
                continue;
            }
            // 已经解压过的数据不再转发content-encoding头
            if decompressed && name == CONTENT_ENCODING {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &route.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %name, "忽略无效的路由请求头"),
            }
        }
        if let Some(context) = parts.extensions.get::<RequestContext>() {
            if let Ok(ip) = HeaderValue::from_str(&context.client_ip) {
                headers.append("x-forwarded-for", ip);
            }
        }
        if let Some(host) = parts.headers.get(HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        if let Ok(original) = HeaderValue::from_str(path) {
            headers.insert("x-original-path", original);
        }
        headers.insert(
            "x-original-method",
            HeaderValue::from_str(parts.method.as_str()).unwrap_or(HeaderValue::from_static("GET")),
        );

        let response = self
            .http_client
            .request(parts.method.clone(), &target_url)
            .headers(headers)
            .body(processed_body)
            .send()
            .await
            .map_err(|e| {
                error!(service = %service.name, "转发HTTP请求失败: {}", e);
                if e.is_timeout() {
                    Error::GatewayTimeout(service.name.clone())
                } else {
                    Error::BadGateway(format!("无法转发请求到后端服务 {}: {}", service.name, e))
                }
            })?;

        let status = response.status();
        let mut upstream_headers = HeaderMap::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            if name == CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
                continue;
            }
            upstream_headers.append(name.clone(), value.clone());
        }
        let body = response.bytes().await.map_err(|e| {
            error!(service = %service.name, "读取后端响应失败: {}", e);
            Error::BadGateway(format!("读取后端响应失败: {}", e))
        })?;

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(upstream_headers);
        }
        builder
            .body(Body::from(body))
            .map_err(|e| Error::Internal(format!("无法构建响应: {}", e)))
    }
}
