//! Discovery manager: the authoritative route table.
//!
//! Consumes the event stream from an [`EventSource`], maintains the
//! `(method, path)` route table and the discovered-service mirror, and fans
//! every event out to the registered processors in registration order. Load
//! balancer and circuit breaker state is keyed by service name elsewhere, so
//! deleting a route never tears that state down.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    core::{GatewayError, GatewayResult},
    service_discovery::{
        DiscoveredService, EventSource, ServiceEndpoint, ServiceEvent, ServiceEventType,
    },
};

/// Route table key: `(method, path)`.
pub type RouteKey = (String, String);

/// The gateway's view of one discovered route.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicRoute {
    pub path: String,
    pub method: String,
    pub service_name: String,
    pub namespace: String,
    pub auth_required: bool,
    pub endpoints: Vec<ServiceEndpoint>,
    pub service: DiscoveredService,
    pub last_updated: DateTime<Utc>,
}

impl DynamicRoute {
    fn from_service(service: &DiscoveredService) -> Self {
        Self {
            path: service.path.clone(),
            method: service.method.clone(),
            service_name: service.name.clone(),
            namespace: service.namespace.clone(),
            auth_required: service.auth_required,
            endpoints: service.endpoints.clone(),
            service: service.clone(),
            last_updated: Utc::now(),
        }
    }
}

/// Downstream consumer of service events (the dynamic route manager, stats
/// collectors). Processor errors are logged and do not stop the fan-out.
pub trait EventProcessor: Send + Sync {
    fn process_service_event(&self, event: &ServiceEvent) -> GatewayResult<()>;
}

/// Discovery statistics for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStats {
    pub enabled: bool,
    pub namespace: String,
    pub started: bool,
    pub total_routes: usize,
    pub discovered_services: usize,
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
}

/// Owns the route table and the event consumer task.
pub struct DiscoveryManager {
    enabled: bool,
    namespace: String,
    routes: Arc<RwLock<HashMap<RouteKey, DynamicRoute>>>,
    services: Arc<RwLock<HashMap<String, DiscoveredService>>>,
    processors: Arc<RwLock<Vec<Arc<dyn EventProcessor>>>>,
    event_source: Mutex<Option<Box<dyn EventSource>>>,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl DiscoveryManager {
    pub fn new(enabled: bool, namespace: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            enabled,
            namespace: namespace.into(),
            routes: Arc::new(RwLock::new(HashMap::new())),
            services: Arc::new(RwLock::new(HashMap::new())),
            processors: Arc::new(RwLock::new(Vec::new())),
            event_source: Mutex::new(None),
            consumer: Mutex::new(None),
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Register a processor; fan-out follows registration order.
    pub fn add_event_processor(&self, processor: Arc<dyn EventProcessor>) {
        self.processors.write().unwrap().push(processor);
    }

    /// Start consuming events from `source`.
    pub async fn start(&self, mut source: Box<dyn EventSource>) -> GatewayResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Internal(
                "discovery manager already started".into(),
            ));
        }

        let mut rx = match source.start().await {
            Ok(rx) => rx,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.event_source.lock().unwrap() = Some(source);

        let routes = Arc::clone(&self.routes);
        let services = Arc::clone(&self.services);
        let processors = Arc::clone(&self.processors);
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!("discovery event processing started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            Self::handle_event(&routes, &services, &processors, event);
                        }
                        None => break,
                    }
                }
            }
            info!("discovery event processing stopped");
        });
        *self.consumer.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Stop the event source, drain the consumer, and prevent further
    /// dispatch.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        if let Some(source) = self.event_source.lock().unwrap().take() {
            source.shutdown();
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.consumer.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "discovery consumer did not exit cleanly");
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn handle_event(
        routes: &RwLock<HashMap<RouteKey, DynamicRoute>>,
        services: &RwLock<HashMap<String, DiscoveredService>>,
        processors: &RwLock<Vec<Arc<dyn EventProcessor>>>,
        event: ServiceEvent,
    ) {
        debug!(
            event = ?event.event_type,
            service = %event.service.name,
            "processing service event"
        );

        let service = &event.service;
        let key = (service.method.clone(), service.path.clone());

        match event.event_type {
            ServiceEventType::Added | ServiceEventType::Modified => {
                let route = DynamicRoute::from_service(service);
                info!(
                    method = %route.method,
                    path = %route.path,
                    service = %route.service_name,
                    endpoints = route.endpoints.len(),
                    "route updated"
                );
                routes.write().unwrap().insert(key, route);
                services
                    .write()
                    .unwrap()
                    .insert(service.name.clone(), service.clone());
            }
            ServiceEventType::Deleted => {
                routes.write().unwrap().remove(&key);
                services.write().unwrap().remove(&service.name);
                info!(
                    method = %service.method,
                    path = %service.path,
                    "route removed"
                );
            }
        }

        let processors = processors.read().unwrap().clone();
        for processor in processors {
            if let Err(e) = processor.process_service_event(&event) {
                error!(
                    service = %event.service.name,
                    error = %e,
                    "event processor failed"
                );
            }
        }
    }

    pub fn find_route(&self, method: &str, path: &str) -> Option<DynamicRoute> {
        self.routes
            .read()
            .unwrap()
            .get(&(method.to_string(), path.to_string()))
            .cloned()
    }

    /// Snapshot of all routes, keyed `METHOD:path` for JSON output.
    pub fn get_routes(&self) -> HashMap<String, DynamicRoute> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .map(|((method, path), route)| (format!("{}:{}", method, path), route.clone()))
            .collect()
    }

    pub fn get_discovered_services(&self) -> HashMap<String, DiscoveredService> {
        self.services.read().unwrap().clone()
    }

    /// Ready endpoints for a service, by name.
    pub fn get_service_endpoints(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.routes
            .read()
            .unwrap()
            .values()
            .find(|route| route.service_name == service_name)
            .map(|route| {
                route
                    .endpoints
                    .iter()
                    .filter(|e| e.ready)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let routes = self.routes.read().unwrap();
        let total_endpoints: usize = routes.values().map(|r| r.endpoints.len()).sum();
        let healthy_endpoints: usize = routes
            .values()
            .map(|r| r.endpoints.iter().filter(|e| e.ready).count())
            .sum();

        DiscoveryStats {
            enabled: self.enabled,
            namespace: self.namespace.clone(),
            started: self.started.load(Ordering::SeqCst),
            total_routes: routes.len(),
            discovered_services: self.services.read().unwrap().len(),
            total_endpoints,
            healthy_endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::service_discovery::ChannelEventSource;

    fn discovered(name: &str, method: &str, path: &str, endpoints: Vec<ServiceEndpoint>) -> DiscoveredService {
        DiscoveredService {
            name: name.to_string(),
            namespace: "default".to_string(),
            path: path.to_string(),
            method: method.to_string(),
            auth_required: false,
            load_balancing: "round-robin".to_string(),
            annotations: HashMap::new(),
            endpoints,
            last_updated: Utc::now(),
        }
    }

    fn endpoint(ip: &str, ready: bool) -> ServiceEndpoint {
        ServiceEndpoint {
            ip: ip.to_string(),
            port: 8080,
            ready,
            node_name: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_route_lifecycle() {
        let manager = DiscoveryManager::new(true, "default");
        let (tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();

        let svc = discovered("orders", "GET", "/orders", vec![endpoint("10.0.0.1", true)]);
        tx.send(ServiceEvent::new(ServiceEventType::Added, svc.clone()))
            .await
            .unwrap();
        settle().await;

        let route = manager.find_route("GET", "/orders").unwrap();
        assert_eq!(route.service_name, "orders");
        assert_eq!(route.endpoints.len(), 1);

        // Modified replaces endpoints wholesale.
        let mut updated = svc.clone();
        updated.endpoints = vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)];
        tx.send(ServiceEvent::new(ServiceEventType::Modified, updated))
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            manager.find_route("GET", "/orders").unwrap().endpoints.len(),
            2
        );

        tx.send(ServiceEvent::new(ServiceEventType::Deleted, svc))
            .await
            .unwrap();
        settle().await;
        assert!(manager.find_route("GET", "/orders").is_none());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_route_uniqueness_per_method_path() {
        let manager = DiscoveryManager::new(true, "default");
        let (tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();

        let first = discovered("orders-v1", "GET", "/orders", vec![]);
        let second = discovered("orders-v2", "GET", "/orders", vec![]);
        tx.send(ServiceEvent::new(ServiceEventType::Added, first))
            .await
            .unwrap();
        tx.send(ServiceEvent::new(ServiceEventType::Added, second))
            .await
            .unwrap();
        settle().await;

        assert_eq!(manager.get_routes().len(), 1);
        assert_eq!(
            manager.find_route("GET", "/orders").unwrap().service_name,
            "orders-v2"
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_service_endpoints_filters_ready() {
        let manager = DiscoveryManager::new(true, "default");
        let (tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();

        let svc = discovered(
            "orders",
            "GET",
            "/orders",
            vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", false)],
        );
        tx.send(ServiceEvent::new(ServiceEventType::Added, svc))
            .await
            .unwrap();
        settle().await;

        let ready = manager.get_service_endpoints("orders");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].ip, "10.0.0.1");

        let stats = manager.stats();
        assert_eq!(stats.total_routes, 1);
        assert_eq!(stats.discovered_services, 1);
        assert_eq!(stats.total_endpoints, 2);
        assert_eq!(stats.healthy_endpoints, 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_processor_fanout_continues_past_errors() {
        struct Failing;
        impl EventProcessor for Failing {
            fn process_service_event(&self, _event: &ServiceEvent) -> GatewayResult<()> {
                Err(GatewayError::Internal("boom".into()))
            }
        }
        struct Counting(AtomicUsize);
        impl EventProcessor for Counting {
            fn process_service_event(&self, _event: &ServiceEvent) -> GatewayResult<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let manager = DiscoveryManager::new(true, "default");
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        manager.add_event_processor(Arc::new(Failing));
        manager.add_event_processor(Arc::clone(&counting) as Arc<dyn EventProcessor>);

        let (tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();

        tx.send(ServiceEvent::new(
            ServiceEventType::Added,
            discovered("orders", "GET", "/orders", vec![]),
        ))
        .await
        .unwrap();
        settle().await;

        assert_eq!(counting.0.load(Ordering::Relaxed), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_prevents_further_dispatch() {
        let manager = DiscoveryManager::new(true, "default");
        let (tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();
        manager.stop().await;

        let _ = tx
            .send(ServiceEvent::new(
                ServiceEventType::Added,
                discovered("orders", "GET", "/orders", vec![]),
            ))
            .await;
        settle().await;

        assert!(manager.find_route("GET", "/orders").is_none());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let manager = DiscoveryManager::new(true, "default");
        let (_tx, source) = ChannelEventSource::new();
        manager.start(Box::new(source)).await.unwrap();

        let (_tx2, source2) = ChannelEventSource::new();
        assert!(manager.start(Box::new(source2)).await.is_err());
        manager.stop().await;
    }
}
