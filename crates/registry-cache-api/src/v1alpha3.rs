//! `registry.extensions.gardener.cloud/v1alpha3`, the current external version

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::duration::GoDuration;
use crate::types::{self, DEFAULT_GARBAGE_COLLECTION_TTL, DEFAULT_VOLUME_SIZE};
use crate::{KIND_REGISTRY_CONFIG, KIND_REGISTRY_STATUS};

/// API version string
pub const API_VERSION: &str = "registry.extensions.gardener.cloud/v1alpha3";

/// Registry cache configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryConfig {
    /// API version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Caches
    #[serde(default)]
    pub caches: Vec<RegistryCache>,
}

/// One pull-through cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryCache {
    /// Remote registry host with optional port
    pub upstream: String,
    /// Explicit proxy target
    #[serde(rename = "remoteURL", default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Volume settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
    /// Garbage collection settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection: Option<GarbageCollection>,
    /// Credentials reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_reference_name: Option<String>,
    /// Proxy settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,
    /// Serving settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Http>,
    /// High availability settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_availability: Option<HighAvailability>,
}

/// Volume settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Volume {
    /// Volume size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Quantity>,
    /// Storage class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Garbage collection settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GarbageCollection {
    /// Time to live; zero disables collection
    #[serde(default)]
    pub ttl: GoDuration,
}

/// Proxy settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Proxy {
    /// HTTP proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    /// HTTPS proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
}

/// Serving settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Http {
    /// Terminate TLS
    #[serde(default)]
    pub tls: bool,
}

/// High availability settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HighAvailability {
    /// Run several replicas
    #[serde(default)]
    pub enabled: bool,
}

/// Registry cache status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryStatus {
    /// API version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Per-cache status
    #[serde(default)]
    pub caches: Vec<RegistryCacheStatus>,
    /// Secret holding the CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

/// Status of one cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistryCacheStatus {
    /// Upstream host
    pub upstream: String,
    /// Cache endpoint
    pub endpoint: String,
    /// Resolved proxy target
    #[serde(rename = "remoteURL")]
    pub remote_url: String,
}

/// Apply defaults to a decoded config
pub fn set_defaults(config: &mut RegistryConfig) {
    for cache in &mut config.caches {
        let volume = cache.volume.get_or_insert_with(Volume::default);
        if volume.size.is_none() {
            volume.size = Some(Quantity(DEFAULT_VOLUME_SIZE.to_string()));
        }
        if cache.garbage_collection.is_none() {
            cache.garbage_collection = Some(GarbageCollection {
                ttl: DEFAULT_GARBAGE_COLLECTION_TTL,
            });
        }
        if cache.http.is_none() {
            cache.http = Some(Http { tls: true });
        }
    }
}

impl From<RegistryConfig> for types::RegistryConfig {
    fn from(config: RegistryConfig) -> Self {
        Self {
            caches: config.caches.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<RegistryCache> for types::RegistryCache {
    fn from(cache: RegistryCache) -> Self {
        Self {
            upstream: cache.upstream,
            remote_url: cache.remote_url,
            volume: cache.volume.map(|v| types::Volume {
                size: v.size,
                storage_class_name: v.storage_class_name,
            }),
            garbage_collection: cache
                .garbage_collection
                .map(|gc| types::GarbageCollection { ttl: gc.ttl }),
            secret_reference_name: cache.secret_reference_name,
            proxy: cache.proxy.map(|p| types::Proxy {
                http_proxy: p.http_proxy,
                https_proxy: p.https_proxy,
            }),
            http: cache.http.map(|h| types::Http { tls: h.tls }),
            high_availability: cache
                .high_availability
                .map(|h| types::HighAvailability { enabled: h.enabled }),
        }
    }
}

impl From<&types::RegistryConfig> for RegistryConfig {
    fn from(config: &types::RegistryConfig) -> Self {
        Self {
            api_version: Some(API_VERSION.to_string()),
            kind: Some(KIND_REGISTRY_CONFIG.to_string()),
            caches: config.caches.iter().map(Into::into).collect(),
        }
    }
}

impl From<&types::RegistryCache> for RegistryCache {
    fn from(cache: &types::RegistryCache) -> Self {
        Self {
            upstream: cache.upstream.clone(),
            remote_url: cache.remote_url.clone(),
            volume: cache.volume.as_ref().map(|v| Volume {
                size: v.size.clone(),
                storage_class_name: v.storage_class_name.clone(),
            }),
            garbage_collection: cache
                .garbage_collection
                .as_ref()
                .map(|gc| GarbageCollection { ttl: gc.ttl }),
            secret_reference_name: cache.secret_reference_name.clone(),
            proxy: cache.proxy.as_ref().map(|p| Proxy {
                http_proxy: p.http_proxy.clone(),
                https_proxy: p.https_proxy.clone(),
            }),
            http: cache.http.as_ref().map(|h| Http { tls: h.tls }),
            high_availability: cache
                .high_availability
                .as_ref()
                .map(|h| HighAvailability { enabled: h.enabled }),
        }
    }
}

impl From<RegistryStatus> for types::RegistryStatus {
    fn from(status: RegistryStatus) -> Self {
        Self {
            caches: status
                .caches
                .into_iter()
                .map(|c| types::RegistryCacheStatus {
                    upstream: c.upstream,
                    endpoint: c.endpoint,
                    remote_url: c.remote_url,
                })
                .collect(),
            ca_secret_name: status.ca_secret_name,
        }
    }
}

impl From<&types::RegistryStatus> for RegistryStatus {
    fn from(status: &types::RegistryStatus) -> Self {
        Self {
            api_version: Some(API_VERSION.to_string()),
            kind: Some(KIND_REGISTRY_STATUS.to_string()),
            caches: status
                .caches
                .iter()
                .map(|c| RegistryCacheStatus {
                    upstream: c.upstream.clone(),
                    endpoint: c.endpoint.clone(),
                    remote_url: c.remote_url.clone(),
                })
                .collect(),
            ca_secret_name: status.ca_secret_name.clone(),
        }
    }
}
