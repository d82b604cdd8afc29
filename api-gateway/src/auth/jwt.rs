use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::configs::{AuthType, JwtConfig};
use common::error::Error;

use super::{authorization_value, AuthProvider, AuthUser, Credentials};

/// JWT Token中的声明信息
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// 主题 (用户ID)
    pub sub: String,
    /// 签发者
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// 过期时间
    pub exp: u64,
    /// 签发时间
    #[serde(default)]
    pub iat: u64,
    /// 用户名
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
    /// 租户ID
    #[serde(default)]
    pub tenant_id: String,
    /// 额外信息
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

/// HMAC签名的JWT认证
pub struct JwtProvider {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtProvider {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            config,
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if self.config.verify_issuer {
            if self.config.allowed_issuers.is_empty() {
                validation.set_issuer(&[self.config.issuer.as_str()]);
            } else {
                validation.set_issuer(self.config.allowed_issuers.as_slice());
            }
        }
        validation
    }

    /// 验证JWT Token
    pub fn verify_token(&self, token: &str) -> Result<AuthUser, Error> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation())?;

        // 检查token是否过期
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if token_data.claims.exp <= now {
            return Err(Error::CredentialsExpired);
        }

        let claims = token_data.claims;
        Ok(AuthUser {
            id: claims.sub,
            username: claims.username,
            role: claims.role,
            tenant_id: claims.tenant_id,
            claims: claims.extra,
            auth_type: Some(AuthType::Jwt),
        })
    }

    /// 签发Token
    pub fn issue_token(&self, user: &AuthUser) -> Result<String, Error> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: user.id.clone(),
            iss: Some(self.config.issuer.clone()),
            exp: now + self.config.expiry_seconds,
            iat: now,
            username: user.username.clone(),
            role: user.role.clone(),
            tenant_id: user.tenant_id.clone(),
            extra: user.claims.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("签发JWT失败: {}", e)))
    }
}

#[async_trait]
impl AuthProvider for JwtProvider {
    fn name(&self) -> AuthType {
        AuthType::Jwt
    }

    async fn authenticate(&self, parts: &Parts) -> Result<AuthUser, Error> {
        let token = authorization_value(parts, "Bearer").ok_or(Error::CredentialsNotFound)?;
        self.verify_token(token)
    }

    async fn generate_credentials(&self, user: &AuthUser) -> Result<Credentials, Error> {
        Ok(Credentials::Jwt {
            token: self.issue_token(user)?,
            expires_in: self.config.expiry_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::parts;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "api-gateway".to_string(),
            expiry_seconds: 3600,
            verify_issuer: true,
            allowed_issuers: vec![],
        }
    }

    fn user() -> AuthUser {
        AuthUser {
            id: "1001".to_string(),
            username: "alice".to_string(),
            role: "admin".to_string(),
            tenant_id: "t-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let provider = JwtProvider::new(config());
        let token = provider.issue_token(&user()).unwrap();
        let auth = format!("Bearer {}", token);
        let authed = provider
            .authenticate(&parts(&[("Authorization", auth.as_str())], "/"))
            .await
            .unwrap();
        assert_eq!(authed.id, "1001");
        assert_eq!(authed.role, "admin");
        assert_eq!(authed.tenant_id, "t-1");
    }

    #[test]
    fn test_expired_token() {
        let provider = JwtProvider::new(config());
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: "1".to_string(),
            iss: Some("api-gateway".to_string()),
            exp: now - 10,
            iat: now - 100,
            username: String::new(),
            role: String::new(),
            tenant_id: String::new(),
            extra: HashMap::new(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            provider.verify_token(&token),
            Err(Error::CredentialsExpired)
        ));
    }

    #[test]
    fn test_wrong_secret_and_issuer() {
        let provider = JwtProvider::new(config());
        let other = JwtProvider::new(JwtConfig {
            secret: "other".to_string(),
            ..config()
        });
        let token = other.issue_token(&user()).unwrap();
        assert!(matches!(
            provider.verify_token(&token),
            Err(Error::InvalidCredentials(_))
        ));

        let foreign = JwtProvider::new(JwtConfig {
            issuer: "someone-else".to_string(),
            ..config()
        });
        let token = foreign.issue_token(&user()).unwrap();
        assert!(matches!(
            provider.verify_token(&token),
            Err(Error::InvalidCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_bearer() {
        let provider = JwtProvider::new(config());
        assert!(matches!(
            provider.authenticate(&parts(&[], "/")).await,
            Err(Error::CredentialsNotFound)
        ));
    }
}
