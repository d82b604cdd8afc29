pub mod admin;
pub mod auth;
pub mod circuit_breaker;
pub mod context;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod tenant;

pub use gateway::{build_router, GatewayState};
