use config::{Config, ConfigError, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::configs::{GatewayConfig, LogConfig};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yaml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub gateway: GatewayConfig, //网关配置
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub db: Option<u8>,
    pub connection_timeout_ms: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: None,
            connection_timeout_ms: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match self.db {
            Some(db) => format!("redis://{}:{}/{}", self.host, self.port, db),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn server_url(&self) -> String {
        format!("{}:{}", &self.host, self.port)
    }
}

impl AppConfig {
    // 从多个来源加载配置
    pub fn from_file(file_path: Option<&str>) -> Result<Self, ConfigError> {
        // 开始构建配置
        let mut builder = Config::builder();

        let path = file_path.unwrap_or(DEFAULT_CONFIG_PATH);
        if Path::new(path).exists() {
            let format = if path.ends_with(".json") {
                FileFormat::Json
            } else if path.ends_with(".yaml") || path.ends_with(".yml") {
                FileFormat::Yaml
            } else {
                FileFormat::Toml
            };

            builder = builder.add_source(File::with_name(path).format(format));
        } else if file_path.is_some() {
            return Err(ConfigError::NotFound(path.to_string()));
        }

        // 读取环境变量 (最高优先级)，例如 APP__SERVER__PORT=9000
        builder = builder.add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__"),
        );

        // 构建配置
        let config = builder.build()?;

        // 转换为AppConfig结构体
        config.try_deserialize()
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 加载配置并剔除无效的服务配置
    ///
    /// 单个服务配置无效时只跳过该服务，不影响网关启动
    pub fn load(path: Option<&str>) -> Result<Arc<AppConfig>, ConfigError> {
        let mut config = AppConfig::from_file(path)?;
        info!(
            "已加载配置 {}，服务数: {}",
            path.unwrap_or(DEFAULT_CONFIG_PATH),
            config.gateway.services.len()
        );

        config.gateway.services.retain(|service| match service.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(service = %service.name, "服务配置无效，跳过挂载: {}", e);
                false
            }
        });

        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = AppConfig::from_file(Some("./does/not/exist.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379");
        redis.db = Some(9);
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/9");
    }

    #[test]
    fn test_load_skips_invalid_services() {
        let dir = std::env::temp_dir().join(format!("gateway-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  host: 127.0.0.1
  port: 9000
gateway:
  services:
    - name: ok
      prefix: /api/ok
      target: http://127.0.0.1:8081
    - name: broken
      prefix: missing-slash
      target: http://127.0.0.1:8082
"#,
        )
        .unwrap();

        let config = ConfigLoader::load(path.to_str()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.gateway.services.len(), 1);
        assert_eq!(config.gateway.services[0].name, "ok");
        std::fs::remove_dir_all(&dir).ok();
    }
}
