//! Per-service load balancers.
//!
//! One [`LoadBalancer`] per service name, strategy fixed at creation. The
//! balancer owns the live endpoint slice (replaced wholesale on discovery
//! updates), filters readiness before delegating to the strategy, and keeps
//! selection statistics. [`LoadBalancerManager`] is the name-keyed registry;
//! like circuit breakers, balancers survive route deletion so a re-created
//! service reuses its accumulated stats.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
    policies::{BalancingStrategy, StrategyFactory},
    service_discovery::ServiceEndpoint,
};

/// Selection statistics for one balancer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadBalancerStats {
    pub strategy: String,
    pub total_requests: u64,
    pub endpoint_requests: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_selected_at: Option<DateTime<Utc>>,
    pub healthy_endpoints: usize,
    pub unhealthy_endpoints: usize,
}

/// Load balancer for a single service.
pub struct LoadBalancer {
    service_name: String,
    strategy: Box<dyn BalancingStrategy>,
    endpoints: RwLock<Vec<ServiceEndpoint>>,
    stats: Mutex<LoadBalancerStats>,
}

impl LoadBalancer {
    pub fn new(service_name: impl Into<String>, strategy: Box<dyn BalancingStrategy>) -> Self {
        let stats = LoadBalancerStats {
            strategy: strategy.name().to_string(),
            ..Default::default()
        };
        Self {
            service_name: service_name.into(),
            strategy,
            endpoints: RwLock::new(Vec::new()),
            stats: Mutex::new(stats),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Replace the endpoint slice atomically and refresh the health counters.
    pub fn update_endpoints(&self, endpoints: Vec<ServiceEndpoint>) {
        let healthy = endpoints.iter().filter(|e| e.ready).count();
        let unhealthy = endpoints.len() - healthy;

        *self.endpoints.write().unwrap() = endpoints;

        let mut stats = self.stats.lock().unwrap();
        stats.healthy_endpoints = healthy;
        stats.unhealthy_endpoints = unhealthy;
    }

    /// Select a ready endpoint via the configured strategy.
    ///
    /// Returns `None` when no endpoint is ready; an endpoint with
    /// `ready == false` is never returned.
    pub fn select_endpoint(&self) -> Option<ServiceEndpoint> {
        let healthy: Vec<ServiceEndpoint> = self
            .endpoints
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.ready)
            .cloned()
            .collect();

        let selected = self.strategy.select(&healthy)?;

        let key = selected.authority();
        let mut stats = self.stats.lock().unwrap();
        stats.total_requests += 1;
        *stats.endpoint_requests.entry(key.clone()).or_insert(0) += 1;
        stats.last_selected = Some(key);
        stats.last_selected_at = Some(Utc::now());
        drop(stats);

        debug!(
            service = %self.service_name,
            endpoint = %selected.authority(),
            strategy = self.strategy.name(),
            "endpoint selected"
        );

        Some(selected)
    }

    /// Track an in-flight request against `endpoint` for the strategies that
    /// care (least-connections). The returned guard releases the connection
    /// on drop, whether the request succeeded or not.
    pub fn connection_guard(self: &Arc<Self>, endpoint: &ServiceEndpoint) -> ConnectionGuard {
        let key = endpoint.authority();
        self.strategy.on_dispatch(&key);
        ConnectionGuard {
            balancer: Arc::clone(self),
            key,
        }
    }

    pub fn stats(&self) -> LoadBalancerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// RAII handle pairing `on_dispatch` with `on_complete`.
pub struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    key: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.strategy.on_complete(&self.key);
    }
}

/// Name-keyed registry of load balancers.
pub struct LoadBalancerManager {
    balancers: RwLock<HashMap<String, Arc<LoadBalancer>>>,
}

impl LoadBalancerManager {
    pub fn new() -> Self {
        Self {
            balancers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the balancer for `service_name`, creating it with the named
    /// strategy on first use.
    pub fn get_or_create(&self, service_name: &str, strategy_name: &str) -> Arc<LoadBalancer> {
        if let Some(lb) = self.balancers.read().unwrap().get(service_name) {
            return Arc::clone(lb);
        }

        let mut balancers = self.balancers.write().unwrap();
        if let Some(lb) = balancers.get(service_name) {
            return Arc::clone(lb);
        }
        let lb = Arc::new(LoadBalancer::new(
            service_name,
            StrategyFactory::create(strategy_name),
        ));
        balancers.insert(service_name.to_string(), Arc::clone(&lb));
        lb
    }

    pub fn get(&self, service_name: &str) -> Option<Arc<LoadBalancer>> {
        self.balancers.read().unwrap().get(service_name).cloned()
    }

    /// Push a fresh endpoint set to the named balancer; no-op when no
    /// balancer exists yet for the service.
    pub fn update_service_endpoints(&self, service_name: &str, endpoints: Vec<ServiceEndpoint>) {
        let lb = self.balancers.read().unwrap().get(service_name).cloned();
        if let Some(lb) = lb {
            lb.update_endpoints(endpoints);
        }
    }

    pub fn all_stats(&self) -> HashMap<String, LoadBalancerStats> {
        self.balancers
            .read()
            .unwrap()
            .iter()
            .map(|(name, lb)| (name.clone(), lb.stats()))
            .collect()
    }
}

impl Default for LoadBalancerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::RoundRobinStrategy;

    fn endpoint(ip: &str, ready: bool) -> ServiceEndpoint {
        ServiceEndpoint {
            ip: ip.to_string(),
            port: 8080,
            ready,
            node_name: None,
        }
    }

    #[test]
    fn test_unready_endpoints_never_selected() {
        let lb = LoadBalancer::new("orders", Box::new(RoundRobinStrategy::new()));
        lb.update_endpoints(vec![
            endpoint("10.0.0.1", false),
            endpoint("10.0.0.2", true),
            endpoint("10.0.0.3", false),
        ]);

        for _ in 0..10 {
            assert_eq!(lb.select_endpoint().unwrap().ip, "10.0.0.2");
        }
    }

    #[test]
    fn test_all_unready_yields_none() {
        let lb = LoadBalancer::new("orders", Box::new(RoundRobinStrategy::new()));
        lb.update_endpoints(vec![endpoint("10.0.0.1", false)]);
        assert!(lb.select_endpoint().is_none());

        let stats = lb.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.healthy_endpoints, 0);
        assert_eq!(stats.unhealthy_endpoints, 1);
    }

    #[test]
    fn test_stats_track_selections() {
        let lb = LoadBalancer::new("orders", Box::new(RoundRobinStrategy::new()));
        lb.update_endpoints(vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)]);

        for _ in 0..4 {
            lb.select_endpoint().unwrap();
        }

        let stats = lb.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.endpoint_requests.get("10.0.0.1:8080"), Some(&2));
        assert_eq!(stats.endpoint_requests.get("10.0.0.2:8080"), Some(&2));
        assert!(stats.last_selected.is_some());
        assert_eq!(stats.healthy_endpoints, 2);
    }

    #[test]
    fn test_update_endpoints_replaces_wholesale() {
        let lb = LoadBalancer::new("orders", Box::new(RoundRobinStrategy::new()));
        lb.update_endpoints(vec![endpoint("10.0.0.1", true)]);
        assert_eq!(lb.select_endpoint().unwrap().ip, "10.0.0.1");

        lb.update_endpoints(vec![endpoint("10.0.0.9", true)]);
        assert_eq!(lb.select_endpoint().unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn test_connection_guard_releases_on_drop() {
        let manager = LoadBalancerManager::new();
        let lb = manager.get_or_create("orders", "least-connections");
        lb.update_endpoints(vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)]);

        let first = lb.select_endpoint().unwrap();
        let guard = lb.connection_guard(&first);

        // With one connection held on the first endpoint, the other wins.
        let second = lb.select_endpoint().unwrap();
        assert_ne!(first.ip, second.ip);

        drop(guard);
        // Counters even out again, ties break in slice order.
        assert_eq!(lb.select_endpoint().unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn test_manager_reuses_balancer_by_name() {
        let manager = LoadBalancerManager::new();
        let a = manager.get_or_create("orders", "random");
        let b = manager.get_or_create("orders", "round-robin");

        // Strategy is fixed at creation; the second call returns the same
        // balancer untouched.
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.strategy_name(), "random");
    }

    #[test]
    fn test_manager_update_unknown_service_is_noop() {
        let manager = LoadBalancerManager::new();
        manager.update_service_endpoints("ghost", vec![endpoint("10.0.0.1", true)]);
        assert!(manager.get("ghost").is_none());
        assert!(manager.all_stats().is_empty());
    }
}
