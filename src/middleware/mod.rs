//! Request middleware.
//!
//! Applied outermost-first: request-ID → panic recovery → structured
//! logging → metrics → per-IP rate limiting; route-level auth runs inside
//! the matched handler. Each middleware is an `axum::middleware::from_fn`
//! function so the stack stays plain async code.

pub mod logging;
pub mod metrics;
pub mod panic_recovery;
pub mod rate_limit;
pub mod request_id;

pub use logging::{logging_middleware, RequestLogConfig};
pub use metrics::metrics_middleware;
pub use panic_recovery::panic_recovery_middleware;
pub use rate_limit::{extract_client_ip, rate_limit_middleware, IpRateLimiter};
pub use request_id::{request_id_middleware, CorrelationId, RequestId};
