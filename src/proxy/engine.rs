//! The streaming reverse proxy.

use std::{error::Error as _, time::Duration};

use axum::{
    body::Body,
    extract::Request,
    http::header::HOST,
    response::Response,
};
use reqwest::Client;
use tracing::debug;

use super::header_utils;
use crate::{
    config::ProxyConfig,
    core::{GatewayError, GatewayResult},
};

/// Forwards requests to backend endpoints over plaintext HTTP.
///
/// Request and response bodies are streamed end to end; nothing is buffered
/// beyond the transport's own frames.
pub struct ProxyEngine {
    client: Client,
}

impl ProxyEngine {
    pub fn new(config: &ProxyConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build proxy client: {}", e)))?;
        Ok(Self { client })
    }

    /// Forward `req` to `target_base` (e.g. `http://10.0.0.1:8080`),
    /// preserving method, path, query, headers and body.
    pub async fn forward(
        &self,
        req: Request,
        target_base: &str,
        service_name: &str,
        endpoint_ip: &str,
    ) -> GatewayResult<Response> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("{}{}", target_base.trim_end_matches('/'), path_and_query);

        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(
            method = %req.method(),
            url = %url,
            service = service_name,
            "proxying request to backend"
        );

        let (parts, body) = req.into_parts();

        let mut builder = self.client.request(parts.method, &url);
        for (name, value) in parts.headers.iter() {
            if header_utils::should_forward_request_header(name.as_str()) {
                builder = builder.header(name.clone(), value.clone());
            }
        }
        if let Some(host) = original_host {
            builder = builder.header("x-forwarded-host", host);
        }
        builder = builder
            .header("x-gateway-service", service_name)
            .header("x-gateway-endpoint", endpoint_ip)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        let upstream = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(e, service_name))?;

        let status = upstream.status();
        let headers = header_utils::preserve_response_headers(upstream.headers());

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Map a transport error onto the gateway taxonomy, keeping the full source
/// chain in the message so the breaker's textual classification sees the
/// underlying cause.
fn classify_transport_error(err: reqwest::Error, service_name: &str) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::UpstreamTimeout {
            service: service_name.to_string(),
        };
    }

    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }

    GatewayError::ProxyTransport {
        service: service_name.to_string(),
        message,
    }
}
