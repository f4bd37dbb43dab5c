//! Shared application context.
//!
//! Owns every long-lived collaborator: the discovery manager, the
//! name-keyed load balancer and circuit breaker registries, the proxy
//! engine, token service, and the per-IP rate limiter. Built once at
//! startup and shared behind an `Arc`.

use std::{path::Path, sync::Arc};

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tracing::info;

use crate::{
    auth::{JwtService, TokenVerifier},
    balancer::LoadBalancerManager,
    config::{load_static_routes, GatewayConfig},
    core::{CircuitBreakerConfig, CircuitBreakerRegistry, GatewayResult},
    discovery::DiscoveryManager,
    health::HealthMonitor,
    middleware::IpRateLimiter,
    observability::metrics::GatewayMetrics,
    proxy::{DynamicRouteManager, ProxyEngine, StaticRouteTable},
};

pub struct AppContext {
    pub config: GatewayConfig,
    pub lb_manager: Arc<LoadBalancerManager>,
    pub cb_registry: Arc<CircuitBreakerRegistry>,
    pub discovery: Arc<DiscoveryManager>,
    /// Catch-all handler in discovery mode.
    pub route_manager: Option<Arc<DynamicRouteManager>>,
    /// Catch-all handler and health monitor in static-route mode.
    pub static_table: Option<Arc<StaticRouteTable>>,
    pub health_monitor: Option<Arc<HealthMonitor>>,
    pub jwt: Arc<JwtService>,
    pub rate_limiter: Arc<IpRateLimiter>,
    pub metrics_handle: PrometheusHandle,
    /// Broadcast stop signal for every background task.
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppContext {
    pub fn from_config(
        config: GatewayConfig,
        metrics_handle: PrometheusHandle,
    ) -> GatewayResult<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        let lb_manager = Arc::new(LoadBalancerManager::new());
        let cb_registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            on_state_change: Some(Arc::new(|name: &str, _from, to| {
                GatewayMetrics::record_cb_transition(name, to);
            })),
            ..Default::default()
        }));
        let jwt = Arc::new(JwtService::new(&config.jwt));
        let verifier: Arc<dyn TokenVerifier> = jwt.clone();
        let engine = Arc::new(ProxyEngine::new(&config.proxy)?);
        let rate_limiter = Arc::new(IpRateLimiter::new(&config.rate));

        let discovery = Arc::new(DiscoveryManager::new(
            config.discovery.enabled,
            config.discovery.namespace.clone(),
        ));

        let mut route_manager = None;
        let mut static_table = None;
        let mut health_monitor = None;

        if config.discovery.enabled {
            let manager = Arc::new(DynamicRouteManager::new(
                Arc::clone(&lb_manager),
                Arc::clone(&cb_registry),
                Arc::clone(&verifier),
                Arc::clone(&engine),
            ));
            discovery.add_event_processor(manager.clone());
            route_manager = Some(manager);
            info!("service discovery enabled, routes will be managed dynamically");
        } else {
            let file = load_static_routes(Path::new(&config.discovery.static_routes_path))?;
            info!(
                routes = file.routes.len(),
                path = %config.discovery.static_routes_path,
                "service discovery disabled, using static route configuration"
            );
            let monitor = Arc::new(HealthMonitor::new(&config.health)?);
            let table = Arc::new(StaticRouteTable::new(
                file,
                Arc::clone(&monitor),
                Arc::clone(&engine),
                Arc::clone(&verifier),
            ));
            health_monitor = Some(monitor);
            static_table = Some(table);
        }

        Ok(Self {
            config,
            lb_manager,
            cb_registry,
            discovery,
            route_manager,
            static_table,
            health_monitor,
            jwt,
            rate_limiter,
            metrics_handle,
            shutdown_tx,
        })
    }
}
