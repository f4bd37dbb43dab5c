//! Weighted round-robin load balancing strategy.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use super::BalancingStrategy;
use crate::service_discovery::ServiceEndpoint;

/// Weighted round-robin selection.
///
/// Weights are keyed by `ip:port`; endpoints without an entry get weight 1.
/// Selection walks the endpoint slice accumulating weight until the
/// accumulator passes `counter % total_weight`, which spreads a full cycle
/// of `total_weight` selections proportionally across the set.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinStrategy {
    weights: HashMap<String, u64>,
    counter: AtomicU64,
}

impl WeightedRoundRobinStrategy {
    pub fn new(weights: HashMap<String, u64>) -> Self {
        Self {
            weights,
            counter: AtomicU64::new(0),
        }
    }

    fn weight_of(&self, endpoint: &ServiceEndpoint) -> u64 {
        self.weights
            .get(&endpoint.authority())
            .copied()
            .unwrap_or(1)
    }
}

impl BalancingStrategy for WeightedRoundRobinStrategy {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Option<ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let total_weight: u64 = endpoints.iter().map(|e| self.weight_of(e)).sum();
        if total_weight == 0 {
            return endpoints.first().cloned();
        }

        let target = self.counter.fetch_add(1, Ordering::Relaxed) % total_weight;

        let mut acc = 0;
        for endpoint in endpoints {
            acc += self.weight_of(endpoint);
            if acc > target {
                return Some(endpoint.clone());
            }
        }

        endpoints.first().cloned()
    }

    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_endpoints;
    use super::*;

    #[test]
    fn test_weighted_distribution() {
        let endpoints = test_endpoints(2);
        let mut weights = HashMap::new();
        weights.insert("10.0.0.1:8080".to_string(), 3);
        weights.insert("10.0.0.2:8080".to_string(), 1);
        let strategy = WeightedRoundRobinStrategy::new(weights);

        let mut first = 0;
        let mut second = 0;
        for _ in 0..40 {
            match strategy.select(&endpoints).unwrap().ip.as_str() {
                "10.0.0.1" => first += 1,
                _ => second += 1,
            }
        }

        assert_eq!(first, 30);
        assert_eq!(second, 10);
    }

    #[test]
    fn test_default_weight_is_uniform() {
        let strategy = WeightedRoundRobinStrategy::new(HashMap::new());
        let endpoints = test_endpoints(3);

        let mut counts = [0u32; 3];
        for _ in 0..9 {
            let selected = strategy.select(&endpoints).unwrap();
            let idx = endpoints.iter().position(|e| e.ip == selected.ip).unwrap();
            counts[idx] += 1;
        }

        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn test_weighted_empty() {
        let strategy = WeightedRoundRobinStrategy::new(HashMap::new());
        assert!(strategy.select(&[]).is_none());
    }
}
