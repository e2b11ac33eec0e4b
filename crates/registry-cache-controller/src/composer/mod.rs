//! Pure composition of the objects shipped for each cache
//!
//! Nothing in here talks to an API server. Each composer maps configuration
//! and observed state to an [`ObjectRegistry`](crate::managed_resources::ObjectRegistry)
//! that the actuator hands to managed-resource delivery.

use std::collections::BTreeMap;

use registry_cache_api::helper::compute_upstream_label_value;

pub mod cache;
pub mod monitoring;
pub mod services;

/// Well-known application label
pub const APP_LABEL: &str = "app.kubernetes.io/name";

/// Application label value of every cache object
pub const APP_NAME: &str = "registry-cache";

/// Per-upstream selector label
pub const UPSTREAM_HOST_LABEL: &str = "upstream-host";

/// Port the cache serves images on
pub const SERVER_PORT: i32 = 5000;

/// Port of the cache's debug and metrics endpoint
pub const DEBUG_PORT: i32 = 5001;

/// Labels selecting the pods of the cache for `upstream`
pub fn selector_labels(upstream: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (
            UPSTREAM_HOST_LABEL.to_string(),
            compute_upstream_label_value(upstream),
        ),
    ])
}
