//! Error types for the gateway core.
//!
//! Every recoverable error a request can hit maps to exactly one HTTP status
//! at the boundary; the circuit breaker additionally classifies errors as
//! network failures via their textual form.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Substrings (case-insensitive) whose presence marks an error as a network
/// failure for circuit-breaker accounting.
const NETWORK_ERROR_MARKERS: &[&str] = &[
    "connection refused",
    "no such host",
    "network is unreachable",
    "timeout",
    "connection reset",
    "broken pipe",
];

/// Gateway-wide error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("event source unavailable: {0}")]
    EventSource(String),

    #[error("no route matches {method} {path}")]
    NoRouteMatch { method: String, path: String },

    #[error("authorization header required")]
    AuthMissing,

    #[error("invalid token format (Bearer token expected)")]
    AuthMalformed,

    #[error("invalid or expired token: {0}")]
    AuthInvalid(String),

    #[error("too many requests")]
    RateLimited,

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("circuit breaker '{0}': too many requests in half-open state")]
    TooManyRequests(String),

    #[error("no healthy endpoints available for service '{0}'")]
    NoHealthyEndpoint(String),

    #[error("proxy error for service '{service}': {message}")]
    ProxyTransport { service: String, message: String },

    #[error("upstream timeout for service '{service}'")]
    UpstreamTimeout { service: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status this error maps to at the boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::EventSource(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoRouteMatch { .. } => StatusCode::NOT_FOUND,
            GatewayError::AuthMissing
            | GatewayError::AuthMalformed
            | GatewayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_)
            | GatewayError::TooManyRequests(_)
            | GatewayError::NoHealthyEndpoint(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProxyTransport { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether this error counts as a network failure for the circuit
    /// breaker. Classification is deliberately coarse: a case-insensitive
    /// substring match on the rendered error.
    pub fn is_network_error(&self) -> bool {
        let text = self.to_string().to_lowercase();
        NETWORK_ERROR_MARKERS.iter().any(|m| text.contains(m))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
