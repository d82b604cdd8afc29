/**
 * HTTP -> gRPC 协议桥接
 *
 * 1. 读取HTTP请求体（GET或空请求体按 `{}` 处理）
 * 2. 请求头、查询参数（`query-` 前缀）、路径参数（`param-` 前缀）和请求上下文写入gRPC元数据
 * 3. 调用 `/<package>.<service>/<method>`，超时取服务配置
 * 4. 成功时响应元数据写回HTTP响应头，响应体按JSON返回，非JSON内容包装为 `{"data": ...}`
 * 5. 失败时按固定映射表转换状态码，并返回状态消息和结构化错误详情
 */
use std::collections::HashMap;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use prost::Message;
use serde_json::{json, Value};
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info};

use common::configs::{RouteConfig, ServiceConfig};
use common::error::Error;

use super::codec::RawCodec;
use super::utils::{is_hop_by_hop, query_pairs};
use crate::context::{
    RequestContext, HEADER_PLATFORM, HEADER_REQUEST_ID, HEADER_TENANT_ID, HEADER_USERNAME,
    HEADER_USER_ID, HEADER_USER_ROLE,
};
use crate::router::RouteParams;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// google.rpc.Status，用于解析 `grpc-status-details-bin`
#[derive(Clone, PartialEq, Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// gRPC状态码到HTTP状态码的映射
pub fn status_to_http(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 后端方法的完整路径
pub fn method_path(service: &ServiceConfig, route: &RouteConfig) -> Result<String, Error> {
    let method = route.grpc_method.as_deref().ok_or_else(|| {
        Error::InvalidConfig(format!("路由 {} 未配置gRPC方法", route.path))
    })?;
    let grpc = service.grpc.as_ref();
    let service_name = grpc
        .and_then(|g| g.service_name.as_deref())
        .unwrap_or(&service.name);

    Ok(match grpc.and_then(|g| g.package.as_deref()) {
        Some(package) if !package.is_empty() => {
            format!("/{}.{}/{}", package, service_name, method)
        }
        _ => format!("/{}/{}", service_name, method),
    })
}

fn insert_metadata(metadata: &mut MetadataMap, key: &str, value: &str) {
    let (Ok(key), Ok(value)) = (
        key.to_ascii_lowercase().parse::<AsciiMetadataKey>(),
        AsciiMetadataValue::try_from(value),
    ) else {
        return;
    };
    metadata.insert(key, value);
}

/// 构建出站元数据
pub fn build_metadata(
    headers: &HeaderMap,
    query: Option<&str>,
    params: Option<&RouteParams>,
    context: Option<&RequestContext>,
) -> MetadataMap {
    let mut metadata = MetadataMap::new();

    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name) || name == "host" || name == "content-length" {
            continue;
        }
        let (Ok(key), Ok(value)) = (
            name.parse::<AsciiMetadataKey>(),
            value.to_str().map(AsciiMetadataValue::try_from),
        ) else {
            continue;
        };
        if let Ok(value) = value {
            metadata.append(key, value);
        }
    }

    for (key, value) in query_pairs(query) {
        insert_metadata(&mut metadata, &format!("query-{}", key), &value);
    }

    if let Some(params) = params {
        for (key, value) in params.iter() {
            insert_metadata(&mut metadata, &format!("param-{}", key), value);
        }
    }

    if let Some(context) = context {
        insert_metadata(&mut metadata, HEADER_REQUEST_ID, &context.request_id);
        insert_metadata(&mut metadata, HEADER_PLATFORM, context.platform.as_str());
        if let Some(tenant) = context.effective_tenant() {
            insert_metadata(&mut metadata, HEADER_TENANT_ID, tenant);
        }
        if let Some(user) = &context.user {
            insert_metadata(&mut metadata, HEADER_USER_ID, &user.id);
            insert_metadata(&mut metadata, HEADER_USERNAME, &user.username);
            insert_metadata(&mut metadata, HEADER_USER_ROLE, &user.role);
        }
    }

    metadata
}

/// 响应体：JSON原样返回，其它内容包装为 `{"data": ...}`
pub fn response_body(message: &[u8]) -> Value {
    if message.is_empty() {
        return json!({});
    }
    if let Ok(value) = serde_json::from_slice::<Value>(message) {
        return value;
    }
    match std::str::from_utf8(message) {
        Ok(text) => json!({ "data": text }),
        Err(_) => json!({ "data": STANDARD.encode(message) }),
    }
}

fn status_details(status: &Status) -> Option<Value> {
    let raw = status.details();
    if raw.is_empty() {
        return None;
    }
    match RpcStatus::decode(raw) {
        Ok(rpc) => Some(Value::Array(
            rpc.details
                .iter()
                .map(|any| {
                    json!({
                        "type_url": any.type_url,
                        "value": STANDARD.encode(&any.value),
                    })
                })
                .collect(),
        )),
        Err(_) => Some(json!(STANDARD.encode(raw))),
    }
}

/// gRPC调用失败转换为网关错误
pub fn error_from_status(status: &Status) -> Error {
    let message = if status.message().is_empty() {
        status.code().description().to_string()
    } else {
        status.message().to_string()
    };
    Error::Upstream {
        status: status_to_http(status.code()),
        message,
        details: status_details(status),
    }
}

fn copy_response_metadata(metadata: &MetadataMap, headers: &mut HeaderMap) {
    for entry in metadata.iter() {
        let KeyAndValueRef::Ascii(key, value) = entry else {
            continue;
        };
        let key = key.as_str();
        if key.starts_with("grpc-")
            || key == "content-type"
            || key == "content-length"
            || is_hop_by_hop(key)
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            value.to_str().map(HeaderValue::from_str),
        ) else {
            continue;
        };
        if let Ok(value) = value {
            headers.append(name, value);
        }
    }
}

/// HTTP到gRPC的桥接器，按目标地址缓存连接
#[derive(Default)]
pub struct GrpcBridge {
    channels: RwLock<HashMap<String, Channel>>,
}

impl GrpcBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, target: &str) -> Result<Channel, Error> {
        if let Some(channel) = self.channels.read().get(target) {
            return Ok(channel.clone());
        }

        let uri = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("http://{}", target)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::InvalidConfig(format!("gRPC目标地址无效 {}: {}", target, e)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();

        let mut channels = self.channels.write();
        Ok(channels
            .entry(target.to_string())
            .or_insert(channel)
            .clone())
    }

    /// 丢弃目标地址的缓存连接
    pub fn evict(&self, target: &str) {
        if self.channels.write().remove(target).is_some() {
            debug!(target = %target, "已移除gRPC连接");
        }
    }

    pub async fn invoke(
        &self,
        request: Request<Body>,
        service: &ServiceConfig,
        route: &RouteConfig,
    ) -> Result<Response, Error> {
        let limits = service.grpc.clone().unwrap_or_default();
        let path = method_path(service, route)?;
        let target = route.target.as_deref().unwrap_or(&service.target);

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, limits.max_request_size)
            .await
            .map_err(|e| Error::BadRequest(format!("无法读取请求体: {}", e)))?;
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Bytes::from_static(b"{}")
        } else {
            body
        };

        let metadata = build_metadata(
            &parts.headers,
            parts.uri.query(),
            parts.extensions.get::<RouteParams>(),
            parts.extensions.get::<RequestContext>(),
        );
        let mut grpc_request = tonic::Request::new(body);
        *grpc_request.metadata_mut() = metadata;
        grpc_request.set_timeout(service.timeout());

        let path_and_query: PathAndQuery = path
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("gRPC方法路径无效 {}: {}", path, e)))?;

        let mut grpc = Grpc::new(self.channel(target)?)
            .max_decoding_message_size(limits.max_response_size)
            .max_encoding_message_size(limits.max_request_size);
        grpc.ready()
            .await
            .map_err(|e| Error::BadGateway(format!("gRPC服务 {} 不可用: {}", service.name, e)))?;

        debug!(service = %service.name, method = %path, "转发gRPC请求");
        match grpc.unary(grpc_request, path_and_query, RawCodec).await {
            Ok(response) => {
                let (metadata, message, _) = response.into_parts();
                let mut response = Json(response_body(&message)).into_response();
                copy_response_metadata(&metadata, response.headers_mut());
                Ok(response)
            }
            Err(status) => {
                info!(
                    service = %service.name,
                    method = %path,
                    code = ?status.code(),
                    "gRPC调用失败: {}",
                    status.message()
                );
                Err(error_from_status(&status))
            }
        }
    }
}
