//! Internal shape of the registry cache configuration and status
//!
//! Every external version converts into these types. They are never
//! serialized directly.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::duration::GoDuration;
use crate::helper;

/// Default cache volume size
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";

/// Default garbage collection TTL (7 days)
pub const DEFAULT_GARBAGE_COLLECTION_TTL: GoDuration = GoDuration::from_hours(7 * 24);

/// Storage class back-filled for configs converted from `v1alpha1`
pub const LEGACY_STORAGE_CLASS_NAME: &str = "default";

/// Configuration for all caches of one shoot
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryConfig {
    /// Caches, one per upstream
    pub caches: Vec<RegistryCache>,
}

/// One pull-through cache
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryCache {
    /// Remote registry host with optional port
    pub upstream: String,
    /// Explicit proxy target, `https://<upstream>` when unset
    pub remote_url: Option<String>,
    /// Cache volume settings
    pub volume: Option<Volume>,
    /// Garbage collection settings
    pub garbage_collection: Option<GarbageCollection>,
    /// Name of the shoot resource reference holding upstream credentials
    pub secret_reference_name: Option<String>,
    /// Proxy settings for reaching the upstream
    pub proxy: Option<Proxy>,
    /// Serving settings
    pub http: Option<Http>,
    /// High availability settings
    pub high_availability: Option<HighAvailability>,
}

/// Cache volume settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Volume {
    /// Volume size
    pub size: Option<Quantity>,
    /// Storage class of the volume claim
    pub storage_class_name: Option<String>,
}

/// Garbage collection settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GarbageCollection {
    /// Time to live of cached blobs; zero disables collection
    pub ttl: GoDuration,
}

/// Proxy settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Proxy {
    /// HTTP proxy URL
    pub http_proxy: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

/// Serving settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Http {
    /// Whether the cache terminates TLS
    pub tls: bool,
}

/// High availability settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HighAvailability {
    /// Run several replicas behind a disruption budget
    pub enabled: bool,
}

/// Status published by the controller
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryStatus {
    /// One entry per cache service
    pub caches: Vec<RegistryCacheStatus>,
    /// Secret holding the CA bundle, set when any cache serves TLS
    pub ca_secret_name: Option<String>,
}

/// Observed state of one cache
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryCacheStatus {
    /// Upstream host
    pub upstream: String,
    /// `<scheme>://<clusterIP>:<port>`
    pub endpoint: String,
    /// Resolved proxy target
    pub remote_url: String,
}

impl RegistryConfig {
    /// Whether at least one cache terminates TLS
    pub fn any_tls_enabled(&self) -> bool {
        self.caches.iter().any(RegistryCache::tls_enabled)
    }

    /// Find the cache for `upstream`
    pub fn find(&self, upstream: &str) -> Option<&RegistryCache> {
        self.caches.iter().find(|c| c.upstream == upstream)
    }

    /// Upstreams in configuration order
    pub fn upstreams(&self) -> Vec<&str> {
        self.caches.iter().map(|c| c.upstream.as_str()).collect()
    }
}

impl RegistryCache {
    /// Cache for `upstream` with every optional field unset
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            ..Default::default()
        }
    }

    /// Resolved proxy target
    pub fn remote_url(&self) -> String {
        helper::remote_url(self)
    }

    /// Configured volume size
    pub fn volume_size(&self) -> Option<&Quantity> {
        self.volume.as_ref().and_then(|v| v.size.as_ref())
    }

    /// Configured storage class
    pub fn volume_storage_class_name(&self) -> Option<&str> {
        self.volume
            .as_ref()
            .and_then(|v| v.storage_class_name.as_deref())
    }

    /// Garbage collection TTL, defaulted when unset
    pub fn garbage_collection_ttl(&self) -> GoDuration {
        self.garbage_collection
            .as_ref()
            .map(|gc| gc.ttl)
            .unwrap_or(DEFAULT_GARBAGE_COLLECTION_TTL)
    }

    /// Whether TLS is enabled, defaulted to true
    pub fn tls_enabled(&self) -> bool {
        self.http.as_ref().map(|h| h.tls).unwrap_or(true)
    }

    /// Whether high availability is enabled
    pub fn high_availability_enabled(&self) -> bool {
        self.high_availability
            .as_ref()
            .map(|h| h.enabled)
            .unwrap_or(false)
    }

    /// "https" or "http" depending on TLS
    pub fn scheme(&self) -> &'static str {
        if self.tls_enabled() {
            "https"
        } else {
            "http"
        }
    }
}

impl RegistryStatus {
    /// Upstreams listed in the status
    pub fn upstreams(&self) -> Vec<&str> {
        self.caches.iter().map(|c| c.upstream.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fall_back_to_defaults() {
        let cache = RegistryCache::new("ghcr.io");
        assert!(cache.tls_enabled());
        assert_eq!(cache.scheme(), "https");
        assert!(!cache.high_availability_enabled());
        assert_eq!(cache.garbage_collection_ttl(), DEFAULT_GARBAGE_COLLECTION_TTL);
        assert_eq!(cache.volume_size(), None);
        assert_eq!(cache.remote_url(), "https://ghcr.io");
    }

    #[test]
    fn config_lookups() {
        let config = RegistryConfig {
            caches: vec![
                RegistryCache {
                    http: Some(Http { tls: false }),
                    ..RegistryCache::new("docker.io")
                },
                RegistryCache::new("ghcr.io"),
            ],
        };
        assert!(config.any_tls_enabled());
        assert_eq!(config.upstreams(), vec!["docker.io", "ghcr.io"]);
        assert_eq!(config.find("docker.io").unwrap().scheme(), "http");
        assert!(config.find("quay.io").is_none());
    }
}
