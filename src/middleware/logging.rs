//! Structured request logging.
//!
//! Logs a start event and a completion event per request, with sensitive
//! headers redacted and a separate warning for requests that exceed the
//! configured slow-request threshold.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use http_body::Body as HttpBody;
use tracing::{error, info, warn};

use super::{extract_client_ip, CorrelationId};
use crate::config::LoggingSettings;

/// Logging middleware configuration, derived from the gateway settings.
#[derive(Debug, Clone)]
pub struct RequestLogConfig {
    sensitive_headers: Vec<String>,
    slow_request_threshold: Duration,
}

impl RequestLogConfig {
    pub fn new(settings: &LoggingSettings) -> Self {
        Self {
            sensitive_headers: settings
                .sensitive_headers
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            slow_request_threshold: settings.slow_request_threshold(),
        }
    }
}

/// Replace sensitive header values with a redaction marker; non-sensitive
/// headers keep their first value only.
fn sanitize_headers(headers: &HeaderMap, sensitive: &[String]) -> HashMap<String, String> {
    let mut sanitized = HashMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_string();
        if sensitive.iter().any(|s| s == name.as_str()) {
            sanitized.insert(key, "[REDACTED]".to_string());
        } else if !sanitized.contains_key(&key) {
            sanitized.insert(key, value.to_str().unwrap_or("<binary>").to_string());
        }
    }
    sanitized
}

pub async fn logging_middleware(
    State(config): State<Arc<RequestLogConfig>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client_ip = extract_client_ip(req.headers(), remote.as_ref()).unwrap_or_default();
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let headers = sanitize_headers(req.headers(), &config.sensitive_headers);

    info!(
        method = %method,
        path = %path,
        query = query.as_deref().unwrap_or(""),
        client_ip = %client_ip,
        user_agent = %user_agent,
        correlation_id = %correlation_id,
        headers = ?headers,
        "request started"
    );

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status().as_u16();
    let response_size = response.body().size_hint().exact().unwrap_or(0);

    macro_rules! completion {
        ($level:ident) => {
            $level!(
                method = %method,
                path = %path,
                status = status,
                duration_ms = duration.as_millis() as u64,
                response_size = response_size,
                client_ip = %client_ip,
                user_agent = %user_agent,
                correlation_id = %correlation_id,
                "request completed"
            )
        };
    }
    if status >= 500 {
        completion!(error);
    } else if status >= 400 {
        completion!(warn);
    } else {
        completion!(info);
    }

    if duration > config.slow_request_threshold {
        warn!(
            method = %method,
            path = %path,
            duration_ms = duration.as_millis() as u64,
            threshold_ms = config.slow_request_threshold.as_millis() as u64,
            correlation_id = %correlation_id,
            "slow request detected"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_sensitive_headers_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("cookie", HeaderValue::from_static("session=abc"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let sensitive = vec!["authorization".to_string(), "cookie".to_string()];
        let sanitized = sanitize_headers(&headers, &sensitive);

        assert_eq!(sanitized["authorization"], "[REDACTED]");
        assert_eq!(sanitized["cookie"], "[REDACTED]");
        assert_eq!(sanitized["accept"], "application/json");
    }

    #[test]
    fn test_first_value_only() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let sanitized = sanitize_headers(&headers, &[]);
        assert_eq!(sanitized["accept"], "text/html");
    }
}
