/**
 * 管理接口
 *
 * 运行时注册、替换、删除后端服务，查看熔断器状态，吊销网关签发的凭证。
 * 配置了 `gateway.admin.token` 时需要在 X-Admin-Token 中携带。
 */
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use tracing::info;

use common::configs::{AuthType, ServiceConfig};
use common::error::Error;

use crate::gateway::GatewayState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub fn routes(state: GatewayState) -> Router<GatewayState> {
    Router::new()
        .route("/services", get(list_services).post(register_service))
        .route("/services/{name}", get(get_service).delete(delete_service))
        .route("/breakers", get(list_breakers))
        .route("/credentials/{auth_type}/{credential}", delete(revoke_credential))
        .route_layer(axum::middleware::from_fn_with_state(state, require_admin_token))
}

async fn require_admin_token(
    State(state): State<GatewayState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    if let Some(expected) = &state.config.gateway.admin.token {
        let provided = request
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::CredentialsNotFound)?;
        if provided != expected {
            return Err(Error::InvalidCredentials("管理令牌无效".to_string()));
        }
    }
    Ok(next.run(request).await)
}

async fn list_services(State(state): State<GatewayState>) -> Json<Vec<ServiceConfig>> {
    Json(
        state
            .routes
            .get_services()
            .iter()
            .map(|s| s.as_ref().clone())
            .collect(),
    )
}

async fn get_service(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceConfig>, Error> {
    state
        .routes
        .get_service(&name)
        .map(|s| Json(s.as_ref().clone()))
        .ok_or_else(|| Error::NotFound(format!("服务不存在: {}", name)))
}

async fn register_service(
    State(state): State<GatewayState>,
    Json(config): Json<ServiceConfig>,
) -> Result<Response, Error> {
    let name = config.name.clone();
    let previous = state.register_service(config.clone())?;
    info!(service = %name, replaced = previous.is_some(), "管理接口注册服务");

    let status = if previous.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(config)).into_response())
}

async fn delete_service(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<StatusCode, Error> {
    state
        .deregister_service(&name)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| Error::NotFound(format!("服务不存在: {}", name)))
}

async fn list_breakers(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.breakers.snapshots())
}

async fn revoke_credential(
    State(state): State<GatewayState>,
    Path((auth_type, credential)): Path<(String, String)>,
) -> Result<StatusCode, Error> {
    let auth_type: AuthType = auth_type
        .parse()
        .map_err(|t| Error::BadRequest(format!("未知的认证类型: {}", t)))?;
    let provider = state.auth.get_provider(auth_type)?;
    if provider.revoke_credentials(&credential).await? {
        info!(auth_type = %auth_type, "管理接口吊销凭证");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("凭证不存在".to_string()))
    }
}
