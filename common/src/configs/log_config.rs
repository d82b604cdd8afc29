use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub components: Option<HashMap<String, String>>, // 其他组件的日志级别
    pub format: Option<String>,                      // 日志输出格式: plain或json
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: None,
            format: None,
        }
    }
}

impl LogConfig {
    /// 过滤器字符串，例如 `info,hyper=warn`
    pub fn filter_directives(&self) -> String {
        let mut parts = vec![self.level.clone()];
        if let Some(components) = &self.components {
            let mut components: Vec<_> = components.iter().collect();
            components.sort();
            for (component, level) in components {
                parts.push(format!("{}={}", component, level));
            }
        }
        parts.join(",")
    }
}
