use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::configs::LogConfig;

// 日志输出格式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    // 普通文本格式
    Plain,
    // JSON格式，适合ELK等日志聚合系统
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// 从配置初始化日志系统
///
/// `RUST_LOG` 优先于配置文件，`RUST_LOG_<组件>` 可以单独覆盖组件级别
///
/// # 示例
/// ```no_run
/// use common::configs::LogConfig;
/// use common::logging;
///
/// fn main() -> anyhow::Result<()> {
///     logging::init_from_config(&LogConfig::default())?;
///     tracing::info!("日志系统从配置初始化成功");
///     Ok(())
/// }
/// ```
pub fn init_from_config(config: &LogConfig) -> Result<()> {
    let filter_string = config.filter_directives();

    // 检查环境变量是否有覆盖设置
    let env_filter = match env::var("RUST_LOG") {
        Ok(env_filter) => EnvFilter::try_new(env_filter)?,
        Err(_) => EnvFilter::try_new(&filter_string)?,
    };

    // 检查是否有组件特定的环境变量覆盖
    let env_filter = check_env_component_overrides(env_filter);

    // 确定日志格式
    let log_format = config
        .format
        .as_deref()
        .map(LogFormat::parse)
        .unwrap_or(LogFormat::Plain);

    // 根据配置的输出格式选择日志输出方式
    match log_format {
        LogFormat::Plain => {
            fmt()
                .with_env_filter(env_filter)
                .with_ansi(true)
                .with_thread_names(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("初始化日志失败: {}", e))?;
        }
        LogFormat::Json => {
            fmt()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_names(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("初始化日志失败: {}", e))?;
        }
    }

    info!("日志系统从配置初始化成功，过滤器: {}", filter_string);
    info!("日志格式: {:?}", log_format);

    Ok(())
}

/// 检查环境变量中是否有组件特定的日志级别覆盖
fn check_env_component_overrides(mut env_filter: EnvFilter) -> EnvFilter {
    // 常见的组件名称
    let common_components = ["tower", "hyper", "axum", "tonic", "reqwest", "redis"];

    for component in &common_components {
        let env_var_name = format!("RUST_LOG_{}", component.to_uppercase());
        if let Ok(level) = env::var(&env_var_name) {
            // 尝试添加指令，如果解析失败则忽略
            if let Ok(directive) = format!("{}={}", component, level).parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}
