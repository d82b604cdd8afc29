/**
 * 认证与授权
 *
 * 每种认证方式实现 `AuthProvider`，由 `AuthManager` 按类型名注册和查找。
 * 请求的认证方式按以下规则识别：
 * 1. Bearer令牌 -> JWT或OAuth2（由配置的优先级决定）
 * 2. Basic -> Basic认证
 * 3. 携带API Key请求头或查询参数 -> API Key
 * 4. 其它情况使用配置的默认方式，否则视为未携带凭证
 */
pub mod api_key;
pub mod basic;
pub mod controller;
pub mod jwt;
pub mod middleware;
pub mod oauth2;
pub mod rbac;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::Uri;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use common::configs::{AuthConfig, AuthType};
use common::error::Error;

pub use api_key::ApiKeyProvider;
pub use basic::BasicAuthProvider;
pub use jwt::JwtProvider;
pub use oauth2::OAuth2Provider;
pub use rbac::{PermissionChecker, PolicyPermissionChecker};

/// 认证通过的用户，只在单个请求内有效
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub role: String,
    pub tenant_id: String,
    /// 认证方式附带的其它声明
    #[serde(default)]
    pub claims: HashMap<String, Value>,
    /// 通过哪种方式认证
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
}

/// 签发的凭证
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Jwt {
        token: String,
        expires_in: u64,
    },
    ApiKey {
        key: String,
        header: String,
    },
    Basic {
        username: String,
        password: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        authorize_url: String,
        state: String,
    },
}

/// 认证方式
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 认证类型
    fn name(&self) -> AuthType;

    /// 从请求中认证用户
    async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error>;

    /// 为用户签发该方式的凭证
    async fn generate_credentials(&self, user: &AuthUser) -> Result<Credentials, Error>;

    /// 吊销网关保存的凭证，凭证不存在时返回 `false`
    ///
    /// 无状态的凭证（JWT、OAuth2令牌）由签发方管理，网关无法吊销
    async fn revoke_credentials(&self, _credential: &str) -> Result<bool, Error> {
        Err(Error::BadRequest(format!("{} 凭证不支持吊销", self.name())))
    }
}

/// 认证管理器
pub struct AuthManager {
    providers: HashMap<AuthType, Arc<dyn AuthProvider>>,
    bearer_priority: AuthType,
    default_type: Option<AuthType>,
    api_key_header: String,
    api_key_query: String,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            providers: HashMap::new(),
            bearer_priority: config.bearer_priority,
            default_type: config.default_type,
            api_key_header: config.api_key.header.clone(),
            api_key_query: config.api_key.query_param.clone(),
        }
    }

    /// 按配置注册启用的认证方式
    pub fn from_config(config: &AuthConfig, http_client: reqwest::Client) -> Result<Self, Error> {
        let mut manager = Self::new(config);
        for auth_type in &config.providers {
            let provider: Arc<dyn AuthProvider> = match auth_type {
                AuthType::Jwt => Arc::new(JwtProvider::new(config.jwt.clone())),
                AuthType::ApiKey => Arc::new(ApiKeyProvider::new(&config.api_key)),
                AuthType::Basic => Arc::new(BasicAuthProvider::new(&config.basic)),
                AuthType::OAuth2 => {
                    let oauth2 = config.oauth2.clone().ok_or_else(|| {
                        Error::InvalidConfig("启用了oauth2但缺少oauth2配置".to_string())
                    })?;
                    Arc::new(OAuth2Provider::new(oauth2, http_client.clone()))
                }
            };
            manager.register(provider);
        }
        info!(
            providers = ?manager.provider_types(),
            bearer = %manager.bearer_priority,
            "认证方式已注册"
        );
        Ok(manager)
    }

    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get_provider(&self, auth_type: AuthType) -> Result<Arc<dyn AuthProvider>, Error> {
        self.providers
            .get(&auth_type)
            .cloned()
            .ok_or_else(|| Error::UnsupportedAuthType(auth_type.to_string()))
    }

    pub fn provider_types(&self) -> Vec<AuthType> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// 识别请求的认证方式
    pub fn detect(&self, parts: &Parts) -> Result<AuthType, Error> {
        if let Some(value) = parts.headers.get(AUTHORIZATION) {
            let value = value
                .to_str()
                .map_err(|_| Error::InvalidCredentials("Authorization头不是合法字符".to_string()))?;
            let scheme = value.split_whitespace().next().unwrap_or_default();
            return match scheme.to_ascii_lowercase().as_str() {
                "bearer" => Ok(self.bearer_type()),
                "basic" => Ok(AuthType::Basic),
                "" => Err(Error::CredentialsNotFound),
                other => Err(Error::UnsupportedAuthType(other.to_string())),
            };
        }

        if parts.headers.contains_key(self.api_key_header.as_str())
            || query_param(&parts.uri, &self.api_key_query).is_some()
        {
            return Ok(AuthType::ApiKey);
        }

        self.default_type.ok_or(Error::CredentialsNotFound)
    }

    /// Bearer令牌的归属：配置的优先方式未启用时使用另一种
    fn bearer_type(&self) -> AuthType {
        let fallback = match self.bearer_priority {
            AuthType::OAuth2 => AuthType::Jwt,
            _ => AuthType::OAuth2,
        };
        if !self.providers.contains_key(&self.bearer_priority)
            && self.providers.contains_key(&fallback)
        {
            fallback
        } else {
            self.bearer_priority
        }
    }

    /// 识别认证方式并完成认证
    pub async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error> {
        let auth_type = self.detect(parts)?;
        let provider = self.get_provider(auth_type)?;
        let mut user = provider.authenticate(parts).await?;
        user.auth_type = Some(auth_type);
        debug!(user_id = %user.id, auth_type = %auth_type, "认证成功");
        Ok(user)
    }
}

/// 生成随机字母数字串
pub fn random_token(len: usize) -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 读取查询参数
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// 提取 `<scheme> <value>` 形式的Authorization头
pub fn authorization_value<'a>(parts: &'a Parts, scheme: &str) -> Option<&'a str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (found, rest) = value.split_once(' ')?;
    found
        .eq_ignore_ascii_case(scheme)
        .then(|| rest.trim())
        .filter(|rest| !rest.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::Request;

    pub fn parts(headers: &[(&str, &str)], uri: &str) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn manager(providers: Vec<AuthType>, bearer: AuthType, default: Option<AuthType>) -> AuthManager {
        let config = AuthConfig {
            providers,
            bearer_priority: bearer,
            default_type: default,
            oauth2: Some(common::configs::OAuth2Config {
                introspection_url: "http://127.0.0.1:9/introspect".to_string(),
                authorize_url: "http://127.0.0.1:9/authorize".to_string(),
                client_id: "gateway".to_string(),
                client_secret: "secret".to_string(),
                redirect_uri: String::new(),
                scope: String::new(),
            }),
            ..Default::default()
        };
        AuthManager::from_config(&config, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn test_bearer_resolves_to_jwt_by_default() {
        let m = manager(
            vec![AuthType::Jwt, AuthType::OAuth2, AuthType::Basic, AuthType::ApiKey],
            AuthType::Jwt,
            None,
        );
        let p = parts(&[("Authorization", "Bearer x")], "/");
        assert_eq!(m.detect(&p).unwrap(), AuthType::Jwt);
    }

    #[test]
    fn test_bearer_resolves_to_oauth2_when_prioritised() {
        let m = manager(vec![AuthType::Jwt, AuthType::OAuth2], AuthType::OAuth2, None);
        let p = parts(&[("Authorization", "Bearer x")], "/");
        assert_eq!(m.detect(&p).unwrap(), AuthType::OAuth2);

        // 优先方式未启用时使用另一种Bearer方式
        let m = manager(vec![AuthType::Jwt], AuthType::OAuth2, None);
        assert_eq!(m.detect(&p).unwrap(), AuthType::Jwt);
    }

    #[test]
    fn test_detect_basic_and_api_key() {
        let m = manager(vec![AuthType::Basic, AuthType::ApiKey], AuthType::Jwt, None);
        let p = parts(&[("Authorization", "Basic dTpw")], "/");
        assert_eq!(m.detect(&p).unwrap(), AuthType::Basic);

        let p = parts(&[("X-API-Key", "k")], "/");
        assert_eq!(m.detect(&p).unwrap(), AuthType::ApiKey);

        let p = parts(&[], "/orders?page=1&api_key=k");
        assert_eq!(m.detect(&p).unwrap(), AuthType::ApiKey);

        let p = parts(&[("Authorization", "Digest abc")], "/");
        assert!(matches!(m.detect(&p), Err(Error::UnsupportedAuthType(_))));
    }

    #[test]
    fn test_no_credentials() {
        let m = manager(vec![AuthType::Jwt], AuthType::Jwt, None);
        assert!(matches!(
            m.detect(&parts(&[], "/")),
            Err(Error::CredentialsNotFound)
        ));

        let m = manager(vec![AuthType::Jwt], AuthType::Jwt, Some(AuthType::Jwt));
        assert_eq!(m.detect(&parts(&[], "/")).unwrap(), AuthType::Jwt);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_not_invalid() {
        let m = manager(vec![AuthType::Jwt], AuthType::Jwt, Some(AuthType::Jwt));
        let err = m.authenticate(&parts(&[], "/")).await.unwrap_err();
        assert!(matches!(err, Error::CredentialsNotFound));
    }

    #[tokio::test]
    async fn test_disabled_provider_is_unsupported() {
        let m = manager(vec![AuthType::Jwt], AuthType::Jwt, None);
        let err = m
            .authenticate(&parts(&[("Authorization", "Basic dTpw")], "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAuthType(_)));
    }

    #[test]
    fn test_authorization_value() {
        let p = parts(&[("Authorization", "bearer abc.def")], "/");
        assert_eq!(authorization_value(&p, "Bearer"), Some("abc.def"));
        assert_eq!(authorization_value(&p, "Basic"), None);
    }
}
