//! Panic recovery.
//!
//! Catches panics from downstream handlers, logs them with request context,
//! and turns them into a 500. Panics never cross the server boundary.

use std::{net::SocketAddr, panic::AssertUnwindSafe};

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use tracing::error;

use super::extract_client_ip;
use crate::observability::metrics::GatewayMetrics;

pub async fn panic_recovery_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
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

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            error!(
                method = %method,
                path = %path,
                client_ip = %client_ip,
                user_agent = %user_agent,
                panic = %detail,
                "panic recovered"
            );
            GatewayMetrics::record_panic();

            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}
