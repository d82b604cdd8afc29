use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::error;

use crate::circuit_breaker::CircuitState;
use crate::gateway::GatewayState;

/// 网关指标
///
/// 指标注册在自有的Registry上，由网关状态持有
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    rate_limited_total: IntCounterVec,
    breaker_state_changes: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "网关处理的请求总数"),
            &["service", "method", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "请求处理耗时（秒）").buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["service", "method"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("rate_limited_requests_total", "被限流拒绝的请求数"),
            &["strategy"],
        )?;
        let breaker_state_changes = IntCounterVec::new(
            Opts::new("circuit_breaker_state_changes_total", "熔断器状态变化次数"),
            &["breaker", "from", "to"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(breaker_state_changes.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            rate_limited_total,
            breaker_state_changes,
        })
    }

    pub fn observe_request(&self, service: &str, method: &str, status: StatusCode, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[service, method, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[service, method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn rate_limited(&self, strategy: &str) {
        self.rate_limited_total.with_label_values(&[strategy]).inc();
    }

    pub fn breaker_state_changed(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        self.breaker_state_changes
            .with_label_values(&[breaker, from.as_str(), to.as_str()])
            .inc();
    }

    pub fn requests_count(&self, service: &str, method: &str, status: StatusCode) -> u64 {
        self.requests_total
            .with_label_values(&[service, method, status.as_str()])
            .get()
    }

    pub fn rate_limited_count(&self, strategy: &str) -> u64 {
        self.rate_limited_total.with_label_values(&[strategy]).get()
    }

    /// 文本格式输出
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Metrics端点
pub async fn get_metrics_handler(State(state): State<GatewayState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("导出指标失败: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
