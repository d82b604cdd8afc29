use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use common::configs::CircuitBreakerSettings;
use common::error::Error;

/// 按失败比例熔断所需的最少请求数
const MIN_REQUESTS_FOR_RATIO: u32 = 5;
/// 失败比例阈值
const FAILURE_RATIO: f64 = 0.5;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行，统计失败
    Closed,
    /// 直接拒绝
    Open,
    /// 放行有限的试探请求
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前代的请求统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// 状态变化回调：(熔断器名称, 原状态, 新状态)
pub type StateChangeListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// 熔断参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    /// 连续失败达到该值时熔断
    pub max_failures: u32,
    /// 关闭状态下的统计周期，`None` 表示不按时间清零
    pub interval: Option<Duration>,
    /// 打开状态的持续时间
    pub timeout: Duration,
    /// 半开状态允许的试探请求数
    pub half_open_max_requests: u32,
}

impl From<&CircuitBreakerSettings> for BreakerSettings {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            max_failures: settings.max_requests.max(1),
            interval: (settings.interval_secs > 0)
                .then(|| Duration::from_secs(settings.interval_secs)),
            timeout: Duration::from_secs(settings.timeout_secs),
            half_open_max_requests: settings.half_open_max_requests.max(1),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed状态下统计周期的结束时间，Open状态下进入半开的时间
    expiry: Option<Instant>,
    changed_at: Instant,
}

/// 熔断器快照
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
    /// 距离上次状态变化的毫秒数
    pub since_change_ms: u64,
}

/// 单个目标的熔断器
///
/// 所有访问同一目标的并发请求共享一个实例，内部状态由一把互斥锁保护。
/// 每次状态变化开启新的一代，上一代请求的结果不再计入统计。
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    listener: Option<StateChangeListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let mut inner = BreakerInner {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
            changed_at: now,
        };
        inner.expiry = settings.interval.map(|interval| now + interval);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(inner),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, now)
    }

    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            generation: inner.generation,
            counts: inner.counts,
            since_change_ms: now.duration_since(inner.changed_at).as_millis() as u64,
        }
    }

    /// 申请一次请求许可
    ///
    /// Open状态或半开试探名额用尽时返回 `CircuitOpen`
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Error> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, now);

        match state {
            CircuitState::Open => {
                return Err(Error::CircuitOpen(self.name.clone()));
            }
            CircuitState::HalfOpen
                if inner.counts.requests >= self.settings.half_open_max_requests =>
            {
                return Err(Error::CircuitOpen(self.name.clone()));
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(BreakerPermit {
            breaker: self.clone(),
            generation: inner.generation,
            finished: false,
        })
    }

    fn on_result(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    /// 许可未上报结果就被释放（请求被取消），归还名额且不计入成败
    fn on_cancel(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn on_success(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        inner.counts.on_success();
        if state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.settings.half_open_max_requests
        {
            self.set_state(inner, CircuitState::Closed, now);
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.consecutive_failures >= self.settings.max_failures {
            return true;
        }
        counts.requests >= MIN_REQUESTS_FOR_RATIO
            && counts.requests > 0
            && counts.total_failures as f64 / counts.requests as f64 >= FAILURE_RATIO
    }

    /// 处理基于时间的状态推进
    fn current_state(&self, inner: &mut BreakerInner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if let Some(expiry) = inner.expiry {
                    if expiry <= now {
                        self.new_generation(inner, now);
                    }
                }
            }
            CircuitState::Open => {
                if inner.expiry.map_or(true, |expiry| expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        inner.changed_at = now;
        self.new_generation(inner, now);

        match state {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %previous,
                "熔断器打开，暂停转发请求"
            ),
            _ => info!(
                breaker = %self.name,
                from = %previous,
                to = %state,
                "熔断器状态变化"
            ),
        }
        if let Some(listener) = &self.listener {
            listener(&self.name, previous, state);
        }
    }

    fn new_generation(&self, inner: &mut BreakerInner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => self.settings.interval.map(|interval| now + interval),
            CircuitState::Open => Some(now + self.settings.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

/// 请求许可，上报结果后失效
///
/// 未上报就被释放时视为请求取消
#[must_use = "请求结束后需要调用 success 或 failure"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    finished: bool,
}

impl BreakerPermit {
    pub fn success(mut self) {
        self.finished = true;
        self.breaker.on_result(self.generation, true);
    }

    pub fn failure(mut self) {
        self.finished = true;
        self.breaker.on_result(self.generation, false);
    }

    /// 按结果上报：状态码 >= 500 为失败，4xx不计入失败
    pub fn record_status(self, status: axum::http::StatusCode) {
        if status.is_server_error() {
            self.failure();
        } else {
            self.success();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.on_cancel(self.generation);
        }
    }
}
