use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;
use parking_lot::RwLock;
use tracing::info;

use common::configs::{ApiKeyConfig, AuthType};
use common::error::Error;

use super::{query_param, random_token, AuthProvider, AuthUser, Credentials};

/// 生成的API Key前缀
const KEY_PREFIX: &str = "gk_";
const KEY_LENGTH: usize = 40;

/// API Key认证，支持请求头和查询参数
pub struct ApiKeyProvider {
    header: String,
    query_param: String,
    keys: RwLock<HashMap<String, AuthUser>>,
}

impl ApiKeyProvider {
    pub fn new(config: &ApiKeyConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    AuthUser {
                        id: entry.user_id.clone(),
                        username: entry.username.clone(),
                        role: entry.role.clone(),
                        tenant_id: entry.tenant_id.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self {
            header: config.header.clone(),
            query_param: config.query_param.clone(),
            keys: RwLock::new(keys),
        }
    }

    fn extract(&self, parts: &Parts) -> Option<String> {
        parts
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| query_param(&parts.uri, &self.query_param))
    }
}

#[async_trait]
impl AuthProvider for ApiKeyProvider {
    fn name(&self) -> AuthType {
        AuthType::ApiKey
    }

    async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error> {
        let key = self.extract(parts).ok_or(Error::CredentialsNotFound)?;
        self.keys
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::InvalidCredentials("API Key无效".to_string()))
    }

    async fn generate_credentials(&self, user: &AuthUser) -> Result<Credentials, Error> {
        let key = format!("{}{}", KEY_PREFIX, random_token(KEY_LENGTH));
        let mut owner = user.clone();
        owner.auth_type = None;
        self.keys.write().insert(key.clone(), owner);
        info!(user_id = %user.id, "已签发API Key");

        Ok(Credentials::ApiKey {
            key,
            header: self.header.clone(),
        })
    }

    async fn revoke_credentials(&self, key: &str) -> Result<bool, Error> {
        let removed = self.keys.write().remove(key);
        if let Some(owner) = &removed {
            info!(user_id = %owner.id, "已吊销API Key");
        }
        Ok(removed.is_some())
    }
}
