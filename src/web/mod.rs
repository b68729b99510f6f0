//! HTTP signaling surface, health checks and metrics

pub mod http_server;
pub mod metrics;
pub mod shared;

pub use http_server::{build_router, run_http_server, serve};
pub use metrics::RelayMetrics;
pub use shared::SharedState;
