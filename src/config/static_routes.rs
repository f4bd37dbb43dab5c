//! Static route file, used when service discovery is disabled.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{GatewayError, GatewayResult};

/// One statically configured proxy route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoute {
    pub path: String,
    pub method: String,
    pub target_url: String,
    #[serde(default)]
    pub auth_required: bool,
}

/// The `routes:` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRouteFile {
    #[serde(default)]
    pub routes: Vec<StaticRoute>,
}

/// Load the static route file.
///
/// A missing file yields an empty table (the gateway can still serve its
/// reserved endpoints); an unparseable file is a configuration error and
/// aborts startup.
pub fn load_static_routes(path: &Path) -> GatewayResult<StaticRouteFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "could not read static route file, using empty configuration"
            );
            return Ok(StaticRouteFile::default());
        }
    };

    serde_yaml::from_str(&raw).map_err(|e| {
        GatewayError::Config(format!(
            "could not parse static route file {}: {}",
            path.display(),
            e
        ))
    })
}
