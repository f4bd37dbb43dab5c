//! Load balancing strategies.
//!
//! A strategy picks one endpoint out of the healthy set; the per-service
//! [`LoadBalancer`](crate::balancer::LoadBalancer) owns the endpoint slice,
//! filters readiness, and keeps statistics. Strategies are selected by name
//! at balancer creation and stay fixed for the balancer's lifetime.

use std::fmt::Debug;

use crate::service_discovery::ServiceEndpoint;

mod factory;
mod least_connections;
mod random;
mod round_robin;
mod weighted_round_robin;

pub use factory::StrategyFactory;
pub use least_connections::LeastConnectionsStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted_round_robin::WeightedRoundRobinStrategy;

/// Core trait for load balancing strategies.
///
/// `select` receives the already-filtered healthy set and returns `None`
/// when it is empty; callers treat `None` as "no backend available".
pub trait BalancingStrategy: Send + Sync + Debug {
    /// Select one endpoint from the given set.
    fn select(&self, endpoints: &[ServiceEndpoint]) -> Option<ServiceEndpoint>;

    /// Strategy name for stats and admin output.
    fn name(&self) -> &'static str;

    /// Called when a request is dispatched to the endpoint keyed `ip:port`.
    fn on_dispatch(&self, _key: &str) {
        // Default: no-op for stateless strategies.
    }

    /// Called when the request to the endpoint keyed `ip:port` completes,
    /// successfully or not.
    fn on_complete(&self, _key: &str) {
        // Default: no-op for stateless strategies.
    }
}

#[cfg(test)]
pub(crate) fn test_endpoints(n: u16) -> Vec<ServiceEndpoint> {
    (0..n)
        .map(|i| ServiceEndpoint {
            ip: format!("10.0.0.{}", i + 1),
            port: 8080,
            ready: true,
            node_name: None,
        })
        .collect()
}
