use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 认证类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Jwt,
    ApiKey,
    #[serde(rename = "oauth2")]
    OAuth2,
    Basic,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Jwt => "jwt",
            AuthType::ApiKey => "api_key",
            AuthType::OAuth2 => "oauth2",
            AuthType::Basic => "basic",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jwt" => Ok(AuthType::Jwt),
            "api_key" | "apikey" | "api-key" => Ok(AuthType::ApiKey),
            "oauth2" => Ok(AuthType::OAuth2),
            "basic" => Ok(AuthType::Basic),
            other => Err(other.to_string()),
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 启用的认证方式
    #[serde(default = "default_providers")]
    pub providers: Vec<AuthType>,
    /// 无法识别认证方式时使用的默认方式
    #[serde(default)]
    pub default_type: Option<AuthType>,
    /// Bearer令牌优先交给哪种认证方式（jwt 或 oauth2）
    #[serde(default = "default_bearer")]
    pub bearer_priority: AuthType,
    /// JWT配置
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api_key: ApiKeyConfig,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
    #[serde(default)]
    pub basic: BasicAuthConfig,
    /// 资源级权限策略
    #[serde(default)]
    pub policies: Vec<PermissionPolicy>,
}

fn default_providers() -> Vec<AuthType> {
    vec![AuthType::Jwt]
}

fn default_bearer() -> AuthType {
    AuthType::Jwt
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// JWT密钥
    pub secret: String,
    /// 签发者
    pub issuer: String,
    /// 过期时间（秒）
    pub expiry_seconds: u64,
    /// 是否检查签发者
    #[serde(default)]
    pub verify_issuer: bool,
    /// 允许的签发者列表
    #[serde(default)]
    pub allowed_issuers: Vec<String>,
}

/// API Key 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default = "default_api_key_header")]
    pub header: String,
    #[serde(default = "default_api_key_query")]
    pub query_param: String,
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_api_key_query() -> String {
    "api_key".to_string()
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            header: default_api_key_header(),
            query_param: default_api_key_query(),
            keys: Vec::new(),
        }
    }
}

/// 预置的API Key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub tenant_id: String,
}

/// OAuth2配置（令牌校验走RFC 7662 introspection）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub introspection_url: String,
    pub authorize_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
}

/// Basic认证配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub users: Vec<BasicUser>,
}

/// Basic认证用户，密码以bcrypt哈希保存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicUser {
    pub username: String,
    pub password_hash: String,
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub tenant_id: String,
}

/// 权限策略：subject 可以是角色或用户ID，`*` 表示任意
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionPolicy {
    pub subject: String,
    pub resource: String,
    pub action: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            default_type: None,
            bearer_priority: default_bearer(),
            jwt: JwtConfig {
                secret: "change_this_to_a_secure_random_string".to_string(),
                issuer: "api-gateway".to_string(),
                expiry_seconds: 86400, // 24小时
                verify_issuer: false,
                allowed_issuers: vec![],
            },
            api_key: ApiKeyConfig::default(),
            oauth2: None,
            basic: BasicAuthConfig::default(),
            policies: Vec::new(),
        }
    }
}
