//! Least-connections load balancing strategy.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use super::BalancingStrategy;
use crate::service_discovery::ServiceEndpoint;

/// Least-connections selection.
///
/// Keeps a live open-connection counter per `ip:port` and picks the endpoint
/// with the lowest value; ties go to the first endpoint in slice order. The
/// dispatch path must pair `on_dispatch` with `on_complete` (the balancer's
/// connection guard does this), otherwise the counters degenerate.
#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy {
    connections: Mutex<HashMap<String, u64>>,
}

impl LeastConnectionsStrategy {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn connection_count(&self, key: &str) -> u64 {
        self.connections
            .lock()
            .map(|c| c.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl BalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Option<ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let connections = self.connections.lock().ok()?;

        let mut selected = None;
        let mut min_connections = u64::MAX;
        for endpoint in endpoints {
            let count = connections
                .get(&endpoint.authority())
                .copied()
                .unwrap_or(0);
            if count < min_connections {
                min_connections = count;
                selected = Some(endpoint.clone());
            }
        }

        selected
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn on_dispatch(&self, key: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            *connections.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    fn on_complete(&self, key: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            if let Some(count) = connections.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_endpoints;
    use super::*;

    #[test]
    fn test_picks_minimum_connections() {
        let strategy = LeastConnectionsStrategy::new();
        let endpoints = test_endpoints(3);

        strategy.on_dispatch("10.0.0.1:8080");
        strategy.on_dispatch("10.0.0.1:8080");
        strategy.on_dispatch("10.0.0.2:8080");

        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.3");
    }

    #[test]
    fn test_ties_break_by_slice_order() {
        let strategy = LeastConnectionsStrategy::new();
        let endpoints = test_endpoints(3);

        // All counters are zero, so the first endpoint wins.
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn test_complete_releases_connection() {
        let strategy = LeastConnectionsStrategy::new();
        let endpoints = test_endpoints(2);

        strategy.on_dispatch("10.0.0.1:8080");
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.2");

        strategy.on_complete("10.0.0.1:8080");
        assert_eq!(strategy.connection_count("10.0.0.1:8080"), 0);
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn test_complete_never_underflows() {
        let strategy = LeastConnectionsStrategy::new();
        strategy.on_complete("10.0.0.1:8080");
        strategy.on_complete("10.0.0.1:8080");
        assert_eq!(strategy.connection_count("10.0.0.1:8080"), 0);
    }

    #[test]
    fn test_least_connections_empty() {
        let strategy = LeastConnectionsStrategy::new();
        assert!(strategy.select(&[]).is_none());
    }
}
