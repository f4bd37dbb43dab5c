//! Static-route dispatch, used when discovery is disabled.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{
    auth::{check_bearer, TokenVerifier},
    config::{StaticRoute, StaticRouteFile},
    core::GatewayError,
    health::HealthMonitor,
    proxy::ProxyEngine,
};

/// Routes loaded from the static YAML file, gated by the active health
/// monitor.
pub struct StaticRouteTable {
    routes: HashMap<(String, String), StaticRoute>,
    health: Arc<HealthMonitor>,
    engine: Arc<ProxyEngine>,
    verifier: Arc<dyn TokenVerifier>,
}

impl StaticRouteTable {
    pub fn new(
        file: StaticRouteFile,
        health: Arc<HealthMonitor>,
        engine: Arc<ProxyEngine>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let routes = file
            .routes
            .into_iter()
            .map(|route| ((route.method.clone(), route.path.clone()), route))
            .collect();
        Self {
            routes,
            health,
            engine,
            verifier,
        }
    }

    /// Unique backend targets, for the health monitor.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .routes
            .values()
            .map(|route| route.target_url.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub async fn handle(&self, req: Request) -> Response {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let Some(route) = self
            .routes
            .get(&(method.clone(), path.clone()))
            .cloned()
        else {
            return GatewayError::NoRouteMatch { method, path }.into_response();
        };

        if route.auth_required {
            if let Err(e) = check_bearer(req.headers(), self.verifier.as_ref()) {
                return e.into_response();
            }
        }

        if !self.health.is_healthy(&route.target_url) {
            warn!(
                target = %route.target_url,
                method = %method,
                path = %path,
                "service unavailable, health check failed"
            );
            return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response();
        }

        let endpoint_host = host_of(&route.target_url);
        match self
            .engine
            .forward(req, &route.target_url, &path, &endpoint_host)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    target = %route.target_url,
                    method = %method,
                    path = %path,
                    error = %e,
                    "static proxy request failed"
                );
                e.into_response()
            }
        }
    }
}

/// Host part of a target URL like `http://users.internal:8081`.
fn host_of(target_url: &str) -> String {
    let without_scheme = target_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target_url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::TokenVerifier,
        config::{HealthConfig, ProxyConfig},
        core::GatewayResult,
    };
    use axum::body::Body;

    struct AcceptAll;
    impl TokenVerifier for AcceptAll {
        fn verify(&self, _token: &str) -> GatewayResult<()> {
            Ok(())
        }
    }

    fn table(routes: Vec<StaticRoute>) -> StaticRouteTable {
        StaticRouteTable::new(
            StaticRouteFile { routes },
            Arc::new(HealthMonitor::new(&HealthConfig::default()).unwrap()),
            Arc::new(ProxyEngine::new(&ProxyConfig::default()).unwrap()),
            Arc::new(AcceptAll),
        )
    }

    fn route(path: &str, target: &str) -> StaticRoute {
        StaticRoute {
            path: path.to_string(),
            method: "GET".to_string(),
            target_url: target.to_string(),
            auth_required: false,
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("http://users.internal:8081"), "users.internal");
        assert_eq!(host_of("http://10.0.0.1:8080/"), "10.0.0.1");
        assert_eq!(host_of("backend"), "backend");
    }

    #[test]
    fn test_targets_deduplicated() {
        let table = table(vec![
            route("/a", "http://b1:8080"),
            route("/b", "http://b1:8080"),
            route("/c", "http://b2:8080"),
        ]);
        assert_eq!(table.targets().len(), 2);
        assert_eq!(table.route_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let table = table(vec![]);
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert_eq!(table.handle(req).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unhealthy_target_is_503() {
        // The monitor never probed this target, so it is unhealthy.
        let table = table(vec![route("/a", "http://127.0.0.1:1")]);
        let req = Request::builder().uri("/a").body(Body::empty()).unwrap();
        assert_eq!(
            table.handle(req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
