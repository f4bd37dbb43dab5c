//! HTTP server: reserved routes, middleware stack, startup and graceful
//! shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn, Level};

use crate::{
    app_context::AppContext,
    config::GatewayConfig,
    core::{GatewayError, GatewayResult},
    middleware::{
        logging_middleware, metrics_middleware, panic_recovery_middleware, rate_limit_middleware,
        request_id_middleware, RequestLogConfig,
    },
    observability::{
        logging::{init_logging, LoggingConfig},
        metrics::{init_metrics, start_sampler},
    },
    service_discovery::KubernetesEventSource,
};

const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.username != ctx.config.login.username || body.password != ctx.config.login.password {
        return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
    }

    match ctx.jwt.create_token(&body.username) {
        Ok(token) => (StatusCode::OK, token).into_response(),
        Err(e) => {
            error!(error = %e, "failed to create token");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token").into_response()
        }
    }
}

async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": "api-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn ready(State(ctx): State<Arc<AppContext>>) -> Response {
    let ready = if ctx.config.discovery.enabled {
        ctx.discovery.stats().started
    } else {
        ctx.static_table.is_some()
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not ready" },
            "timestamp": Utc::now(),
            "service": "api-gateway",
        })),
    )
        .into_response()
}

async fn metrics(State(ctx): State<Arc<AppContext>>) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        ctx.metrics_handle.render(),
    )
        .into_response()
}

async fn admin_services(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.discovery.get_discovered_services()).into_response()
}

async fn admin_routes(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.discovery.get_routes()).into_response()
}

async fn admin_discovery_stats(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.discovery.stats()).into_response()
}

async fn admin_load_balancers(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.lb_manager.all_stats()).into_response()
}

async fn admin_circuit_breakers(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.cb_registry.all_stats()).into_response()
}

async fn admin_health_overview(State(ctx): State<Arc<AppContext>>) -> Response {
    let routes = ctx.discovery.get_routes();
    let total_services = routes.len();
    let healthy_services = routes
        .values()
        .filter(|route| route.endpoints.iter().any(|e| e.ready))
        .count();
    let open_circuits = ctx.cb_registry.open_circuits();
    let health_rate = if total_services == 0 {
        100.0
    } else {
        healthy_services as f64 / total_services as f64 * 100.0
    };

    let static_targets = ctx
        .health_monitor
        .as_ref()
        .map(|monitor| monitor.overview());

    Json(json!({
        "services": routes,
        "load_balancers": ctx.lb_manager.all_stats(),
        "circuit_breakers": ctx.cb_registry.all_stats(),
        "static_targets": static_targets,
        "summary": {
            "total_services": total_services,
            "healthy_services": healthy_services,
            "unhealthy_services": total_services - healthy_services,
            "open_circuits": open_circuits,
            "service_health_rate": health_rate,
        },
    }))
    .into_response()
}

/// Everything not matched by a reserved route goes to the active route
/// table.
async fn proxy_fallback(State(ctx): State<Arc<AppContext>>, req: Request) -> Response {
    if let Some(route_manager) = &ctx.route_manager {
        route_manager.handle(req).await
    } else if let Some(static_table) = &ctx.static_table {
        static_table.handle(req).await
    } else {
        GatewayError::NoRouteMatch {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
        }
        .into_response()
    }
}

/// Build the router with the full middleware stack.
///
/// Layer order is outermost-first: request-ID → panic recovery →
/// structured logging → metrics → rate limiter; route-level auth runs
/// inside the matched handler. (The last `.layer()` call is the outermost.)
pub fn build_app(ctx: Arc<AppContext>) -> Router {
    let rate_limiter = Arc::clone(&ctx.rate_limiter);
    let log_config = Arc::new(RequestLogConfig::new(&ctx.config.logging));
    let request_timeout = Duration::from_secs(ctx.config.server.write_timeout_secs);

    Router::new()
        .route("/login", post(login))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/admin/services", get(admin_services))
        .route("/admin/routes", get(admin_routes))
        .route("/admin/discovery/stats", get(admin_discovery_stats))
        .route("/admin/load-balancers", get(admin_load_balancers))
        .route("/admin/circuit-breakers", get(admin_circuit_breakers))
        .route("/admin/health-overview", get(admin_health_overview))
        .fallback(proxy_fallback)
        .layer(tower_http::timeout::TimeoutLayer::new(request_timeout))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            MAX_PAYLOAD_SIZE,
        ))
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(axum::middleware::from_fn_with_state(
            log_config,
            logging_middleware,
        ))
        .layer(axum::middleware::from_fn(panic_recovery_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(ctx)
}

/// Run the gateway until a termination signal arrives.
pub async fn startup(config: GatewayConfig) -> GatewayResult<()> {
    let _log_guard = init_logging(LoggingConfig {
        level: config
            .logging
            .level
            .to_uppercase()
            .parse::<Level>()
            .unwrap_or(Level::INFO),
        json_format: config.logging.format == "json",
        ..Default::default()
    });

    let metrics_handle =
        init_metrics().map_err(|e| GatewayError::Config(format!("metrics init failed: {}", e)))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        discovery = config.discovery.enabled,
        namespace = %config.discovery.namespace,
        "starting API gateway"
    );

    let ctx = Arc::new(AppContext::from_config(config, metrics_handle.clone())?);

    // Background tasks all exit on the shared stop signal.
    ctx.rate_limiter.start_cleanup(ctx.shutdown_tx.subscribe());
    start_sampler(metrics_handle, ctx.shutdown_tx.subscribe());

    if ctx.config.discovery.enabled {
        let source = Box::new(KubernetesEventSource::new(ctx.config.discovery.clone()));
        match ctx.discovery.start(source).await {
            Ok(()) => info!("service discovery started"),
            Err(e) => {
                error!(error = %e, "failed to start service discovery");
                warn!("continuing without service discovery");
            }
        }
    } else if let (Some(monitor), Some(table)) = (&ctx.health_monitor, &ctx.static_table) {
        monitor.start(table.targets());
    }

    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid bind address: {}", e)))?;

    let app = build_app(Arc::clone(&ctx));

    let handle = axum_server::Handle::new();
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining in-flight requests");
        signal_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %addr, "gateway listening");
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| GatewayError::Config(format!("server error: {}", e)))?;

    // Teardown in reverse creation order.
    ctx.discovery.stop().await;
    if let Some(monitor) = &ctx.health_monitor {
        monitor.stop();
    }
    let _ = ctx.shutdown_tx.send(true);

    info!("gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("received terminate signal, starting graceful shutdown");
        },
    }
}
