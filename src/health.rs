//! Active health monitoring for static-route targets.
//!
//! One long-running probe task per unique target URL. In discovery mode the
//! readiness flag on each endpoint is authoritative and this monitor is not
//! started.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::HealthConfig,
    core::{GatewayError, GatewayResult},
};

/// Tracks backend health by probing `<target>/health`.
pub struct HealthMonitor {
    statuses: Arc<RwLock<HashMap<String, bool>>>,
    client: Client,
    check_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build health client: {}", e)))?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            statuses: Arc::new(RwLock::new(HashMap::new())),
            client,
            check_interval: Duration::from_secs(config.check_interval_secs),
            shutdown_tx,
        })
    }

    /// Spawn one probe task per unique target.
    pub fn start(&self, targets: impl IntoIterator<Item = String>) {
        let unique: HashSet<String> = targets.into_iter().collect();
        info!(targets = unique.len(), "starting health checks");

        for target in unique {
            let statuses = Arc::clone(&self.statuses);
            let client = self.client.clone();
            let interval = self.check_interval;
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first check fires immediately
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            debug!(target = %target, "health check stopped");
                            return;
                        }
                        _ = ticker.tick() => {
                            Self::perform_check(&client, &statuses, &target).await;
                        }
                    }
                }
            });
        }
    }

    async fn perform_check(
        client: &Client,
        statuses: &RwLock<HashMap<String, bool>>,
        target: &str,
    ) {
        let check_url = format!("{}/health", target.trim_end_matches('/'));
        let result = client.get(&check_url).send().await;

        let (healthy, status_code) = match &result {
            Ok(response) => {
                let code = response.status().as_u16();
                ((200..400).contains(&code), Some(code))
            }
            Err(_) => (false, None),
        };

        let previous = {
            let mut statuses = statuses.write().unwrap();
            statuses.insert(target.to_string(), healthy)
        };

        match (previous, healthy) {
            (Some(true) | None, false) => warn!(
                target = %target,
                status = status_code.unwrap_or(0),
                error = result.err().map(|e| e.to_string()).unwrap_or_default(),
                "service became unhealthy"
            ),
            (Some(false) | None, true) => info!(
                target = %target,
                status = status_code.unwrap_or(0),
                "service became healthy"
            ),
            _ => debug!(target = %target, healthy, "health check completed"),
        }
    }

    /// Health of `target`; unknown targets are unhealthy.
    pub fn is_healthy(&self, target: &str) -> bool {
        self.statuses
            .read()
            .unwrap()
            .get(target)
            .copied()
            .unwrap_or(false)
    }

    /// Snapshot of every tracked target.
    pub fn overview(&self) -> HashMap<String, bool> {
        self.statuses.read().unwrap().clone()
    }

    /// Stop all probe tasks.
    pub fn stop(&self) {
        info!("stopping health checks");
        let _ = self.shutdown_tx.send(true);
    }
}
