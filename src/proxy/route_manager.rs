//! Dynamic route dispatch.
//!
//! The catch-all handler for discovered routes: exact `(method, path)`
//! match, per-route bearer auth, endpoint selection and proxy dispatch
//! inside the service's circuit breaker. Route state is mirrored from the
//! discovery manager through the `EventProcessor` callback.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    auth::{check_bearer, TokenVerifier},
    balancer::LoadBalancerManager,
    core::{CircuitBreakerRegistry, GatewayError, GatewayResult},
    discovery::{DynamicRoute, EventProcessor, RouteKey},
    observability::metrics::GatewayMetrics,
    proxy::ProxyEngine,
    service_discovery::{ServiceEvent, ServiceEventType},
};

/// Per-route request statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteStats {
    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub route_requests: HashMap<String, u64>,
}

/// Serves every request not matched by a reserved route.
pub struct DynamicRouteManager {
    routes: RwLock<HashMap<RouteKey, DynamicRoute>>,
    lb_manager: Arc<LoadBalancerManager>,
    cb_registry: Arc<CircuitBreakerRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    engine: Arc<ProxyEngine>,
    stats: Mutex<RouteStats>,
}

impl DynamicRouteManager {
    pub fn new(
        lb_manager: Arc<LoadBalancerManager>,
        cb_registry: Arc<CircuitBreakerRegistry>,
        verifier: Arc<dyn TokenVerifier>,
        engine: Arc<ProxyEngine>,
    ) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            lb_manager,
            cb_registry,
            verifier,
            engine,
            stats: Mutex::new(RouteStats::default()),
        }
    }

    pub async fn handle(&self, req: Request) -> Response {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let Some(route) = self.find_route(&method, &path) else {
            debug!(method = %method, path = %path, "no dynamic route found");
            return GatewayError::NoRouteMatch { method, path }.into_response();
        };

        self.record_request(&route);

        if route.auth_required {
            if let Err(e) = check_bearer(req.headers(), self.verifier.as_ref()) {
                warn!(
                    method = %method,
                    path = %path,
                    service = %route.service_name,
                    error = %e,
                    "authentication failed"
                );
                self.record_error();
                return e.into_response();
            }
        }

        match self.dispatch(req, &route).await {
            Ok(response) => {
                self.record_success();
                response
            }
            Err(e) => {
                warn!(
                    method = %method,
                    path = %path,
                    service = %route.service_name,
                    error = %e,
                    "dynamic route dispatch failed"
                );
                self.record_error();
                e.into_response()
            }
        }
    }

    /// Select an endpoint and proxy the request, all inside the service's
    /// circuit breaker so transport failures feed its counts.
    async fn dispatch(&self, req: Request, route: &DynamicRoute) -> GatewayResult<Response> {
        let lb = self
            .lb_manager
            .get_or_create(&route.service_name, &route.service.load_balancing);
        lb.update_endpoints(route.endpoints.clone());

        let cb = self.cb_registry.get_or_create(&route.service_name);

        let service_name = route.service_name.clone();
        cb.execute(|| async move {
            let endpoint = lb
                .select_endpoint()
                .ok_or_else(|| GatewayError::NoHealthyEndpoint(service_name.clone()))?;
            GatewayMetrics::record_lb_decision(&service_name, &endpoint.authority());

            let _guard = lb.connection_guard(&endpoint);
            let target = format!("http://{}", endpoint.authority());
            self.engine
                .forward(req, &target, &service_name, &endpoint.ip)
                .await
        })
        .await
    }

    fn find_route(&self, method: &str, path: &str) -> Option<DynamicRoute> {
        self.routes
            .read()
            .unwrap()
            .get(&(method.to_string(), path.to_string()))
            .cloned()
    }

    pub fn stats(&self) -> RouteStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap().len()
    }

    fn record_request(&self, route: &DynamicRoute) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;
        *stats
            .route_requests
            .entry(format!("{}:{}", route.method, route.path))
            .or_insert(0) += 1;
    }

    fn record_success(&self) {
        self.stats.lock().unwrap().success_requests += 1;
    }

    fn record_error(&self) {
        self.stats.lock().unwrap().error_requests += 1;
    }
}

impl EventProcessor for DynamicRouteManager {
    fn process_service_event(&self, event: &ServiceEvent) -> GatewayResult<()> {
        let service = &event.service;
        let key = (service.method.clone(), service.path.clone());

        match event.event_type {
            ServiceEventType::Added | ServiceEventType::Modified => {
                let route = DynamicRoute {
                    path: service.path.clone(),
                    method: service.method.clone(),
                    service_name: service.name.clone(),
                    namespace: service.namespace.clone(),
                    auth_required: service.auth_required,
                    endpoints: service.endpoints.clone(),
                    service: service.clone(),
                    last_updated: chrono::Utc::now(),
                };
                self.routes.write().unwrap().insert(key, route);
                // Keep an existing balancer fresh without waiting for
                // traffic; creation stays lazy.
                self.lb_manager
                    .update_service_endpoints(&service.name, service.endpoints.clone());
            }
            ServiceEventType::Deleted => {
                self.routes.write().unwrap().remove(&key);
                // Balancer and breaker survive by design: a re-created
                // service reuses its accumulated state.
            }
        }
        Ok(())
    }
}
