use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::RwLock;
use tracing::info;

use common::configs::{AuthType, BasicAuthConfig};
use common::error::Error;

use super::{authorization_value, random_token, AuthProvider, AuthUser, Credentials};

const PASSWORD_LENGTH: usize = 24;

struct BasicAccount {
    password_hash: String,
    user: AuthUser,
}

/// Basic认证，密码以bcrypt哈希保存
pub struct BasicAuthProvider {
    accounts: RwLock<HashMap<String, BasicAccount>>,
    cost: u32,
}

impl BasicAuthProvider {
    pub fn new(config: &BasicAuthConfig) -> Self {
        let accounts = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    BasicAccount {
                        password_hash: u.password_hash.clone(),
                        user: AuthUser {
                            id: u.user_id.clone(),
                            username: u.username.clone(),
                            role: u.role.clone(),
                            tenant_id: u.tenant_id.clone(),
                            ..Default::default()
                        },
                    },
                )
            })
            .collect();
        Self {
            accounts: RwLock::new(accounts),
            cost: bcrypt::DEFAULT_COST,
        }
    }

    /// 设置新密码的哈希强度
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// 解析 `Basic base64(username:password)`
    fn decode(parts: &Parts) -> Result<(String, String), Error> {
        let encoded = authorization_value(parts, "Basic").ok_or(Error::CredentialsNotFound)?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| Error::InvalidCredentials("Basic凭证不是合法的base64".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidCredentials("Basic凭证不是合法的UTF-8".to_string()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::InvalidCredentials("Basic凭证格式错误".to_string()))?;
        Ok((username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl AuthProvider for BasicAuthProvider {
    fn name(&self) -> AuthType {
        AuthType::Basic
    }

    async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error> {
        let (username, password) = Self::decode(parts)?;
        let (hash, user) = {
            let accounts = self.accounts.read();
            let account = accounts
                .get(&username)
                .ok_or_else(|| Error::InvalidCredentials("用户名或密码错误".to_string()))?;
            (account.password_hash.clone(), account.user.clone())
        };

        // bcrypt校验耗CPU，放到阻塞线程池
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| Error::Internal(format!("密码校验任务失败: {}", e)))?
            .map_err(|e| Error::InvalidCredentials(format!("密码哈希无效: {}", e)))?;

        if valid {
            Ok(user)
        } else {
            Err(Error::InvalidCredentials("用户名或密码错误".to_string()))
        }
    }

    async fn generate_credentials(&self, user: &AuthUser) -> Result<Credentials, Error> {
        let username = if user.username.is_empty() {
            user.id.clone()
        } else {
            user.username.clone()
        };
        let password = random_token(PASSWORD_LENGTH);

        let cost = self.cost;
        let plain = password.clone();
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(plain, cost))
            .await
            .map_err(|e| Error::Internal(format!("密码哈希任务失败: {}", e)))?
            .map_err(|e| Error::Internal(format!("密码哈希失败: {}", e)))?;

        let mut stored = user.clone();
        stored.auth_type = None;
        self.accounts.write().insert(
            username.clone(),
            BasicAccount {
                password_hash,
                user: stored,
            },
        );
        info!(user_id = %user.id, username = %username, "已签发Basic凭证");

        Ok(Credentials::Basic { username, password })
    }
}
