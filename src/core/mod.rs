//! Core abstractions for the gateway:
//! - Error taxonomy with HTTP status mapping
//! - Circuit breaker and per-service registry
//! - Token bucket used by the per-IP rate limiter

pub mod circuit_breaker;
pub mod error;
pub mod token_bucket;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
    Counts,
};
pub use error::{GatewayError, GatewayResult};
pub use token_bucket::TokenBucket;
