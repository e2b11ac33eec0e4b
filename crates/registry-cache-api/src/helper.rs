//! Derived names and URLs for caches

use registry_cache_common::kube_utils::sha256_hex;

use crate::types::RegistryCache;

/// Upstream of Docker Hub
pub const DOCKER_HUB_UPSTREAM: &str = "docker.io";

/// Registry endpoint serving Docker Hub
pub const DOCKER_HUB_REMOTE_URL: &str = "https://registry-1.docker.io";

/// Maximum length of an upstream label value
pub const MAX_LABEL_VALUE_LENGTH: usize = 43;

const TRUNCATED_LABEL_LENGTH: usize = 37;
const HASH_SUFFIX_LENGTH: usize = 5;

/// Prefix of every cache object name
pub const RESOURCE_NAME_PREFIX: &str = "registry-";

/// Label value identifying the cache for `upstream`.
///
/// Ports are joined with `-`. Upstreams longer than 43 characters are
/// truncated to 37 characters and suffixed with five hex characters of their
/// SHA-256, keeping distinct upstreams distinct.
pub fn compute_upstream_label_value(upstream: &str) -> String {
    let label = upstream.replace(':', "-");
    if upstream.len() <= MAX_LABEL_VALUE_LENGTH {
        return label;
    }

    let hash = sha256_hex(upstream.as_bytes());
    let truncated: String = label.chars().take(TRUNCATED_LABEL_LENGTH).collect();
    format!("{}-{}", truncated, &hash[..HASH_SUFFIX_LENGTH])
}

/// Name of the StatefulSet, Service and other objects for `upstream`.
///
/// At most 52 characters so the StatefulSet's pods get valid
/// `controller-revision-hash` labels.
pub fn compute_kubernetes_resource_name(upstream: &str) -> String {
    format!(
        "{}{}",
        RESOURCE_NAME_PREFIX,
        compute_upstream_label_value(upstream).replace('.', "-")
    )
}

/// Resolved proxy target of a cache
pub fn remote_url(cache: &RegistryCache) -> String {
    if let Some(url) = cache.remote_url.as_deref().filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    if cache.upstream == DOCKER_HUB_UPSTREAM {
        return DOCKER_HUB_REMOTE_URL.to_string();
    }
    format!("https://{}", cache.upstream)
}
