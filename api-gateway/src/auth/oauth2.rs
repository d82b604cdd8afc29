use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use common::configs::{AuthType, OAuth2Config};
use common::error::Error;

use super::{authorization_value, random_token, AuthProvider, AuthUser, Credentials};

const STATE_LENGTH: usize = 32;

/// RFC 7662 introspection响应
#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

/// OAuth2认证
///
/// 访问令牌交给授权服务器的introspection端点校验；签发凭证即生成授权码流程的跳转地址
pub struct OAuth2Provider {
    config: OAuth2Config,
    client: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(config: OAuth2Config, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, Error> {
        let response = self
            .client
            .post(&self.config.introspection_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await
            .map_err(|e| {
                error!("OAuth2 introspection请求失败: {}", e);
                Error::BadGateway(format!("授权服务器不可用: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(Error::BadGateway(format!(
                "授权服务器返回错误状态: {}",
                response.status()
            )));
        }

        response
            .json::<IntrospectionResponse>()
            .await
            .map_err(|e| Error::BadGateway(format!("无法解析introspection响应: {}", e)))
    }
}

#[async_trait]
impl AuthProvider for OAuth2Provider {
    fn name(&self) -> AuthType {
        AuthType::OAuth2
    }

    async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error> {
        let token = authorization_value(parts, "Bearer").ok_or(Error::CredentialsNotFound)?;
        let info = self.introspect(token).await?;

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if info.exp.is_some_and(|exp| exp <= now) {
            return Err(Error::CredentialsExpired);
        }
        if !info.active {
            return Err(Error::InvalidCredentials("访问令牌无效".to_string()));
        }

        let id = info
            .sub
            .clone()
            .ok_or_else(|| Error::InvalidCredentials("访问令牌缺少sub".to_string()))?;
        debug!(user_id = %id, "OAuth2令牌校验通过");

        Ok(AuthUser {
            username: info.username.unwrap_or_else(|| id.clone()),
            id,
            role: info.role.unwrap_or_default(),
            tenant_id: info.tenant_id.unwrap_or_default(),
            claims: info.extra,
            auth_type: Some(AuthType::OAuth2),
        })
    }

    async fn generate_credentials(&self, _user: &AuthUser) -> Result<Credentials, Error> {
        let state = random_token(STATE_LENGTH);
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("state", state.as_str()),
        ];
        if !self.config.redirect_uri.is_empty() {
            params.push(("redirect_uri", self.config.redirect_uri.as_str()));
        }
        if !self.config.scope.is_empty() {
            params.push(("scope", self.config.scope.as_str()));
        }

        let url = Url::parse_with_params(&self.config.authorize_url, &params)
            .map_err(|e| Error::InvalidConfig(format!("OAuth2授权地址无效: {}", e)))?;

        Ok(Credentials::OAuth2 {
            authorize_url: url.to_string(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::parts;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use serde_json::json;

    async fn introspection_server() -> String {
        async fn introspect(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
            let now = chrono::Utc::now().timestamp();
            match form.get("token").map(String::as_str) {
                Some("good") => Json(json!({
                    "active": true,
                    "sub": "u-5",
                    "username": "carol",
                    "role": "editor",
                    "tenant_id": "t-2",
                    "scope": "read write",
                    "exp": now + 600,
                })),
                Some("expired") => Json(json!({ "active": false, "exp": now - 5 })),
                _ => Json(json!({ "active": false })),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/introspect", post(introspect)))
                .await
                .unwrap();
        });
        format!("http://{}/introspect", addr)
    }

    fn provider(introspection_url: String) -> OAuth2Provider {
        OAuth2Provider::new(
            OAuth2Config {
                introspection_url,
                authorize_url: "https://auth.example.com/authorize".to_string(),
                client_id: "gateway".to_string(),
                client_secret: "secret".to_string(),
                redirect_uri: "https://app.example.com/callback".to_string(),
                scope: "openid profile".to_string(),
            },
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_introspection_results() {
        let provider = provider(introspection_server().await);

        let user = provider
            .authenticate(&parts(&[("Authorization", "Bearer good")], "/"))
            .await
            .unwrap();
        assert_eq!(user.id, "u-5");
        assert_eq!(user.role, "editor");
        assert_eq!(user.claims.get("scope"), Some(&json!("read write")));

        assert!(matches!(
            provider
                .authenticate(&parts(&[("Authorization", "Bearer expired")], "/"))
                .await,
            Err(Error::CredentialsExpired)
        ));
        assert!(matches!(
            provider
                .authenticate(&parts(&[("Authorization", "Bearer forged")], "/"))
                .await,
            Err(Error::InvalidCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let provider = provider("http://127.0.0.1:1/introspect".to_string());
        assert!(matches!(
            provider
                .authenticate(&parts(&[("Authorization", "Bearer good")], "/"))
                .await,
            Err(Error::BadGateway(_))
        ));
    }

    #[tokio::test]
    async fn test_authorize_url() {
        let provider = provider(String::new());
        let Credentials::OAuth2 {
            authorize_url,
            state,
        } = provider
            .generate_credentials(&AuthUser::default())
            .await
            .unwrap()
        else {
            panic!("expected oauth2 credentials");
        };
        assert_eq!(state.len(), STATE_LENGTH);
        assert!(authorize_url.starts_with("https://auth.example.com/authorize?response_type=code"));
        assert!(authorize_url.contains("client_id=gateway"));
        assert!(authorize_url.contains(&format!("state={}", state)));
        assert!(authorize_url.contains("scope=openid+profile"));
    }
}
