//! Reverse proxy engine and route handlers.
//!
//! [`ProxyEngine`] forwards a request to one backend endpoint, streaming
//! both bodies. [`DynamicRouteManager`] serves discovered routes through
//! per-service load balancers and circuit breakers; [`StaticRouteTable`]
//! serves the file-configured routes behind the active health monitor.

pub mod engine;
pub mod header_utils;
pub mod route_manager;
pub mod static_routes;

pub use engine::ProxyEngine;
pub use route_manager::{DynamicRouteManager, RouteStats};
pub use static_routes::StaticRouteTable;
