use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum_server::Handle;
use clap::Parser;
use tracing::{error, info};

use api_gateway::rate_limit::build_rate_limiter;
use api_gateway::{build_router, GatewayState};
use common::config::ConfigLoader;
use common::configs::RateLimitBackend;

/// 等待处理中请求完成的最长时间
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "api-gateway", about = "API网关服务")]
struct Args {
    /// 配置文件路径，缺省为 ./config/config.yaml
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = ConfigLoader::load(args.config.as_deref()).context("加载配置失败")?;
    common::logging::init_from_config(&config.log)?;
    info!("正在启动API网关服务...");

    // 共享存储不可用时回退到本地限流
    let rate_limit = &config.gateway.rate_limit;
    let store = match rate_limit.backend {
        RateLimitBackend::Redis => match cache::redis_store(&config.redis, &rate_limit.key_prefix).await {
            Ok(store) => {
                info!(
                    key_prefix = %rate_limit.key_prefix,
                    "分布式限流已启用: {}",
                    config.redis.url()
                );
                Some(store)
            }
            Err(e) => {
                error!("连接Redis失败，回退到本地限流: {}", e);
                None
            }
        },
        RateLimitBackend::Local => None,
    };
    let (rate_limiter, local_limiter) = build_rate_limiter(rate_limit, store);
    let _eviction_task = local_limiter.as_ref().map(|limiter| limiter.spawn_eviction_task());

    let state = GatewayState::new(config.clone(), rate_limiter)?;
    let app = build_router(state);

    let addr: SocketAddr = config
        .server
        .server_url()
        .parse()
        .with_context(|| format!("监听地址无效: {}", config.server.server_url()))?;
    info!("API网关服务监听: http://{}", addr);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("API网关服务已关闭");
    Ok(())
}

/// 等待 Ctrl-C 或 SIGTERM 后优雅关闭
async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("监听Ctrl-C失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("监听SIGTERM失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("收到关闭信号，等待处理中的请求完成");
    handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
}
