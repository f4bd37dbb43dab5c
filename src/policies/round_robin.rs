//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::BalancingStrategy;
use crate::service_discovery::ServiceEndpoint;

/// Round-robin selection.
///
/// Cycles through the endpoint set in slice order with a monotonic counter.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl BalancingStrategy for RoundRobinStrategy {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Option<ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        endpoints.get(count % endpoints.len()).cloned()
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::test_endpoints;
    use super::*;

    #[test]
    fn test_round_robin_cycles_in_order() {
        let strategy = RoundRobinStrategy::new();
        let endpoints = test_endpoints(3);

        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.1");
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.2");
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.3");
        assert_eq!(strategy.select(&endpoints).unwrap().ip, "10.0.0.1");
    }

    #[test]
    fn test_round_robin_fairness() {
        let strategy = RoundRobinStrategy::new();
        let endpoints = test_endpoints(4);

        // K * N selections hand each endpoint exactly K requests.
        let k = 25;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..k * endpoints.len() {
            let selected = strategy.select(&endpoints).unwrap();
            *counts.entry(selected.ip).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == k as u32));
    }

    #[test]
    fn test_round_robin_empty() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&[]).is_none());
    }
}
