//! Random load balancing strategy.

use rand::Rng;

use super::BalancingStrategy;
use crate::service_discovery::ServiceEndpoint;

/// Uniform random selection over the healthy set.
///
/// The thread-local generator is seeded from OS entropy.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl BalancingStrategy for RandomStrategy {
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Option<ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let mut rng = rand::rng();
        let idx = rng.random_range(0..endpoints.len());
        endpoints.get(idx).cloned()
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
