//! Request metrics: in-flight gauge, totals by method and status, duration
//! histogram.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};

use crate::observability::metrics::GatewayMetrics;

pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let start = Instant::now();

    GatewayMetrics::inflight_inc();
    let response = next.run(req).await;
    GatewayMetrics::inflight_dec();

    GatewayMetrics::record_request(&method, response.status().as_u16(), start.elapsed());

    response
}
