//! Factory for creating balancing strategies by name.

use std::collections::HashMap;

use tracing::warn;

use super::{
    BalancingStrategy, LeastConnectionsStrategy, RandomStrategy, RoundRobinStrategy,
    WeightedRoundRobinStrategy,
};

/// Factory for strategy instances. Names come from service annotations.
pub struct StrategyFactory;

impl StrategyFactory {
    /// Create a strategy by name. Unknown names fall back to round-robin.
    pub fn create(name: &str) -> Box<dyn BalancingStrategy> {
        match name {
            "round-robin" => Box::new(RoundRobinStrategy::new()),
            "weighted-round-robin" => {
                Box::new(WeightedRoundRobinStrategy::new(HashMap::new()))
            }
            "random" => Box::new(RandomStrategy::new()),
            "least-connections" => Box::new(LeastConnectionsStrategy::new()),
            other => {
                if !other.is_empty() {
                    warn!(
                        strategy = other,
                        "unknown load balancing strategy, falling back to round-robin"
                    );
                }
                Box::new(RoundRobinStrategy::new())
            }
        }
    }
}
