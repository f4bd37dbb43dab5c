//! Service discovery data model and event sources.
//!
//! A service becomes routable when its Kubernetes `Service` object carries
//! `gateway.io/enabled: "true"`; routing attributes (path, method, auth,
//! load-balancing strategy) come from the same annotation map. The
//! [`KubernetesEventSource`] watches `Service` and `Endpoints` objects,
//! merges them name-wise, and emits one normalized [`ServiceEvent`] per
//! material change over a bounded channel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    api::Api,
    runtime::watcher::{watcher, Config, Event},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    config::DiscoveryConfig,
    core::{GatewayError, GatewayResult},
    observability::metrics::GatewayMetrics,
};

/// Annotation keys for service configuration.
pub const ANNOTATION_ENABLED: &str = "gateway.io/enabled";
pub const ANNOTATION_PATH: &str = "gateway.io/path";
pub const ANNOTATION_METHOD: &str = "gateway.io/method";
pub const ANNOTATION_AUTH_REQUIRED: &str = "gateway.io/auth-required";
pub const ANNOTATION_LOAD_BALANCING: &str = "gateway.io/load-balancing";

/// Bound of the event channel between the source and the discovery manager.
/// Overflowing events are dropped with a warning; consumers recover on the
/// next resync.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// A single reachable backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub ip: String,
    pub port: u16,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl ServiceEndpoint {
    /// The `ip:port` key used by load balancer stats and weights.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A routable service discovered from the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub name: String,
    pub namespace: String,
    pub path: String,
    pub method: String,
    pub auth_required: bool,
    pub load_balancing: String,
    pub annotations: HashMap<String, String>,
    pub endpoints: Vec<ServiceEndpoint>,
    pub last_updated: DateTime<Utc>,
}

impl DiscoveredService {
    /// Whether the Kubernetes service opted into gateway routing.
    pub fn is_enabled(service: &Service) -> bool {
        service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_ENABLED))
            .is_some_and(|v| v == "true")
    }

    /// Build a discovered service from a Kubernetes service, applying the
    /// annotation defaults. Returns `None` when the object has no name.
    pub fn from_service(service: &Service) -> Option<Self> {
        let name = service.metadata.name.clone()?;
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let annotations: HashMap<String, String> = service
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let path = annotations
            .get(ANNOTATION_PATH)
            .cloned()
            .unwrap_or_else(|| format!("/{}", name));
        let method = annotations
            .get(ANNOTATION_METHOD)
            .cloned()
            .unwrap_or_else(|| "GET".to_string());
        let auth_required = annotations
            .get(ANNOTATION_AUTH_REQUIRED)
            .is_some_and(|v| v == "true");
        let load_balancing = annotations
            .get(ANNOTATION_LOAD_BALANCING)
            .cloned()
            .unwrap_or_else(|| "round-robin".to_string());

        Some(Self {
            name,
            namespace,
            path,
            method,
            auth_required,
            load_balancing,
            annotations,
            endpoints: Vec::new(),
            last_updated: Utc::now(),
        })
    }
}

/// Type of a service change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceEventType {
    Added,
    Modified,
    Deleted,
}

/// A change in the discovered service set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    #[serde(rename = "type")]
    pub event_type: ServiceEventType,
    pub service: DiscoveredService,
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(event_type: ServiceEventType, service: DiscoveredService) -> Self {
        Self {
            event_type,
            service,
            timestamp: Utc::now(),
        }
    }
}

/// A long-lived producer of service change events.
///
/// Implementations emit the initial state as one `Added` event per existing
/// enabled service, then deltas.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Start producing events. The receiver is bounded; the producer drops
    /// events (with a warning) rather than block.
    async fn start(&mut self) -> GatewayResult<mpsc::Receiver<ServiceEvent>>;

    /// Stop the producer. The stream ends shortly after.
    fn shutdown(&self);
}

/// In-memory event source fed through a channel sender.
///
/// Used by tests and by any embedding that produces its own events.
pub struct ChannelEventSource {
    rx: Option<mpsc::Receiver<ServiceEvent>>,
}

impl ChannelEventSource {
    pub fn new() -> (mpsc::Sender<ServiceEvent>, Self) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (tx, Self { rx: Some(rx) })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn start(&mut self) -> GatewayResult<mpsc::Receiver<ServiceEvent>> {
        self.rx
            .take()
            .ok_or_else(|| GatewayError::EventSource("channel source already started".into()))
    }

    fn shutdown(&self) {
        // Dropping all senders ends the stream; nothing to do here.
    }
}

/// Merged view of the watched `Service` and `Endpoints` objects.
///
/// Both watchers funnel into this state under one lock; every mutation
/// returns the normalized event to emit, if any.
#[derive(Default)]
struct WatchState {
    services: HashMap<String, DiscoveredService>,
    endpoints: HashMap<String, Vec<ServiceEndpoint>>,
}

impl WatchState {
    fn apply_service(&mut self, service: &Service) -> Option<ServiceEvent> {
        if !DiscoveredService::is_enabled(service) {
            return None;
        }
        let mut discovered = DiscoveredService::from_service(service)?;
        if let Some(endpoints) = self.endpoints.get(&discovered.name) {
            discovered.endpoints = endpoints.clone();
        }

        let event_type = if self.services.contains_key(&discovered.name) {
            ServiceEventType::Modified
        } else {
            ServiceEventType::Added
        };
        self.services
            .insert(discovered.name.clone(), discovered.clone());

        info!(
            service = %discovered.name,
            method = %discovered.method,
            path = %discovered.path,
            endpoints = discovered.endpoints.len(),
            "service discovered"
        );
        Some(ServiceEvent::new(event_type, discovered))
    }

    fn delete_service(&mut self, service: &Service) -> Option<ServiceEvent> {
        let name = service.metadata.name.as_deref()?;
        let removed = self.services.remove(name)?;
        info!(service = %name, "service removed from discovery");
        Some(ServiceEvent::new(ServiceEventType::Deleted, removed))
    }

    fn apply_endpoints(&mut self, endpoints: &Endpoints) -> Option<ServiceEvent> {
        let name = endpoints.metadata.name.clone()?;
        let converted = convert_endpoints(endpoints);
        self.endpoints.insert(name.clone(), converted.clone());

        let service = self.services.get_mut(&name)?;
        service.endpoints = converted;
        service.last_updated = Utc::now();
        debug!(
            service = %name,
            endpoints = service.endpoints.len(),
            "service endpoints updated"
        );
        Some(ServiceEvent::new(
            ServiceEventType::Modified,
            service.clone(),
        ))
    }

    fn delete_endpoints(&mut self, endpoints: &Endpoints) -> Option<ServiceEvent> {
        let name = endpoints.metadata.name.as_deref()?;
        self.endpoints.remove(name);

        let service = self.services.get_mut(name)?;
        service.endpoints = Vec::new();
        service.last_updated = Utc::now();
        Some(ServiceEvent::new(
            ServiceEventType::Modified,
            service.clone(),
        ))
    }

    /// Reconcile against a full service list: vanished services become
    /// `Deleted` events, the rest re-apply. This is how consumers recover
    /// from dropped events.
    fn resync_services(&mut self, services: &[Service]) -> Vec<ServiceEvent> {
        let mut events = Vec::new();

        let live: Vec<String> = services
            .iter()
            .filter(|s| DiscoveredService::is_enabled(s))
            .filter_map(|s| s.metadata.name.clone())
            .collect();
        let gone: Vec<String> = self
            .services
            .keys()
            .filter(|name| !live.contains(name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(removed) = self.services.remove(&name) {
                info!(service = %name, "service gone after resync");
                events.push(ServiceEvent::new(ServiceEventType::Deleted, removed));
            }
        }

        for service in services {
            if let Some(event) = self.apply_service(service) {
                events.push(event);
            }
        }
        events
    }
}

/// Convert a Kubernetes `Endpoints` object into service endpoints, keeping
/// not-ready addresses with `ready = false`.
fn convert_endpoints(endpoints: &Endpoints) -> Vec<ServiceEndpoint> {
    let mut converted = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        let port = subset
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.port as u16)
            .unwrap_or(80);

        for addr in subset.addresses.iter().flatten() {
            converted.push(ServiceEndpoint {
                ip: addr.ip.clone(),
                port,
                ready: true,
                node_name: addr.node_name.clone(),
            });
        }
        for addr in subset.not_ready_addresses.iter().flatten() {
            converted.push(ServiceEndpoint {
                ip: addr.ip.clone(),
                port,
                ready: false,
                node_name: addr.node_name.clone(),
            });
        }
    }

    converted
}

/// Event source backed by Kubernetes `Service` and `Endpoints` watches.
pub struct KubernetesEventSource {
    config: DiscoveryConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl KubernetesEventSource {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }
}

#[async_trait]
impl EventSource for KubernetesEventSource {
    async fn start(&mut self) -> GatewayResult<mpsc::Receiver<ServiceEvent>> {
        let client = Client::try_default()
            .await
            .map_err(|e| GatewayError::EventSource(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(Mutex::new(WatchState::default()));

        let (services, endpoints): (Api<Service>, Api<Endpoints>) =
            if self.config.watch_all_namespaces {
                (Api::all(client.clone()), Api::all(client))
            } else {
                (
                    Api::namespaced(client.clone(), &self.config.namespace),
                    Api::namespaced(client, &self.config.namespace),
                )
            };

        info!(
            namespace = %self.config.namespace,
            all_namespaces = self.config.watch_all_namespaces,
            "starting Kubernetes service discovery"
        );

        tokio::spawn(run_watch(
            services,
            "services",
            Arc::clone(&state),
            tx.clone(),
            self.shutdown_rx.clone(),
            |state, event| match event {
                Event::Applied(svc) => state.apply_service(&svc).into_iter().collect(),
                Event::Deleted(svc) => state.delete_service(&svc).into_iter().collect(),
                Event::Restarted(svcs) => state.resync_services(&svcs),
            },
        ));
        tokio::spawn(run_watch(
            endpoints,
            "endpoints",
            state,
            tx,
            self.shutdown_rx.clone(),
            |state, event| match event {
                Event::Applied(eps) => state.apply_endpoints(&eps).into_iter().collect(),
                Event::Deleted(eps) => state.delete_endpoints(&eps).into_iter().collect(),
                Event::Restarted(all) => all
                    .iter()
                    .filter_map(|eps| state.apply_endpoints(eps))
                    .collect(),
            },
        ));

        Ok(rx)
    }

    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Drive one watcher until shutdown, reconnecting with exponential backoff.
async fn run_watch<K, F>(
    api: Api<K>,
    resource: &'static str,
    state: Arc<Mutex<WatchState>>,
    tx: mpsc::Sender<ServiceEvent>,
    mut shutdown: watch::Receiver<bool>,
    handle: F,
) where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Clone + Eq + std::hash::Hash,
    F: Fn(&mut WatchState, Event<K>) -> Vec<ServiceEvent> + Send + 'static,
{
    let mut retry_delay = Duration::from_secs(1);
    const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

    loop {
        let mut stream = Box::pin(watcher(api.clone(), Config::default()));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(resource, "watcher stopped");
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        retry_delay = Duration::from_secs(1);
                        let events = {
                            let mut state = state.lock().unwrap();
                            handle(&mut state, event)
                        };
                        for event in events {
                            emit(&tx, event);
                        }
                    }
                    Some(Err(e)) => {
                        error!(resource, error = %e, "Kubernetes watcher error");
                        GatewayMetrics::record_watcher_error(resource);
                        break;
                    }
                    None => break,
                }
            }
        }

        warn!(
            resource,
            retry_secs = retry_delay.as_secs(),
            "Kubernetes watcher exited, restarting with backoff"
        );
        GatewayMetrics::record_watcher_restart(resource);

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
        retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
    }
}

/// Non-blocking send; the channel bound is the backpressure boundary and
/// consumers tolerate gaps by resync.
fn emit(tx: &mpsc::Sender<ServiceEvent>, event: ServiceEvent) {
    if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event) {
        warn!(
            service = %dropped.service.name,
            "event channel full, dropping service event"
        );
        GatewayMetrics::record_event_dropped();
    }
}
