use axum::extract::{Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use common::configs::AuthType;
use common::error::Error;

use crate::gateway::GatewayState;

/// 签发凭证请求参数
#[derive(Debug, Deserialize)]
pub struct IssueQuery {
    /// 凭证类型，缺省时与调用方本次的认证方式相同
    #[serde(rename = "type")]
    pub auth_type: Option<String>,
}

/// 为已认证的调用方签发凭证
///
/// POST /auth/token?type=jwt|api_key|basic|oauth2
pub async fn issue_credentials(
    State(state): State<GatewayState>,
    Query(query): Query<IssueQuery>,
    parts: Parts,
) -> Result<impl IntoResponse, Error> {
    let user = state.auth.authenticate(&parts).await?;

    let auth_type = match query.auth_type.as_deref() {
        Some(name) => name
            .parse::<AuthType>()
            .map_err(Error::UnsupportedAuthType)?,
        None => user.auth_type.unwrap_or(AuthType::Jwt),
    };

    let provider = state.auth.get_provider(auth_type)?;
    let credentials = provider.generate_credentials(&user).await?;

    info!(user_id = %user.id, auth_type = %auth_type, "凭证签发成功");
    Ok((StatusCode::CREATED, Json(credentials)))
}
