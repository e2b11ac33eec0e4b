//! Cache services and the status derived from them
//!
//! Services carry the upstream, the resolved remote URL and the scheme as
//! annotations. Status is rebuilt from those annotations plus the allocated
//! cluster IP, never from what the composer intended.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use registry_cache_api::helper::compute_kubernetes_resource_name;
use registry_cache_api::{RegistryCache, RegistryCacheStatus, RegistryConfig, RegistryStatus};
use registry_cache_common::{Error, Result, SHOOT_SYSTEM_NAMESPACE};

use super::{selector_labels, APP_LABEL, APP_NAME, DEBUG_PORT, SERVER_PORT, UPSTREAM_HOST_LABEL};
use crate::managed_resources::ObjectRegistry;

/// Upstream served by the cache
pub const UPSTREAM_ANNOTATION: &str = "upstream";

/// Resolved remote URL of the cache
pub const REMOTE_URL_ANNOTATION: &str = "remoteURL";

/// Scheme the cache is served with
pub const SCHEME_ANNOTATION: &str = "scheme";

/// Selector for listing cache services in the shoot
pub const SERVICE_LABEL_SELECTOR: &str = "app.kubernetes.io/name=registry-cache,upstream-host";

/// Service fronting the cache for one upstream
pub fn service(cache: &RegistryCache) -> Service {
    let annotations = BTreeMap::from([
        (UPSTREAM_ANNOTATION.to_string(), cache.upstream.clone()),
        (REMOTE_URL_ANNOTATION.to_string(), cache.remote_url()),
        (SCHEME_ANNOTATION.to_string(), cache.scheme().to_string()),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(compute_kubernetes_resource_name(&cache.upstream)),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            labels: Some(selector_labels(&cache.upstream)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(&cache.upstream)),
            ports: Some(vec![
                ServicePort {
                    name: Some("registry-cache".to_string()),
                    port: SERVER_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::String("registry-cache".to_string())),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("debug".to_string()),
                    port: DEBUG_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::String("debug".to_string())),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The service bundle for every cache in `config`
pub fn compose_services(config: &RegistryConfig) -> Result<ObjectRegistry> {
    let mut registry = ObjectRegistry::new();
    for cache in &config.caches {
        registry.add(&service(cache))?;
    }
    Ok(registry)
}

/// Whether a service was created by this composer
pub fn is_cache_service(svc: &Service) -> bool {
    let labels = svc.labels();
    labels.get(APP_LABEL).map(String::as_str) == Some(APP_NAME)
        && labels.contains_key(UPSTREAM_HOST_LABEL)
}

/// Cluster IP of a service, if allocated
pub fn cluster_ip(svc: &Service) -> Option<IpAddr> {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .and_then(|ip| ip.parse().ok())
}

/// `<scheme>://<ip>:5000`, bracketing IPv6 addresses
pub fn endpoint(scheme: &str, ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}://{}:{}", scheme, v4, SERVER_PORT),
        IpAddr::V6(v6) => format!("{}://[{}]:{}", scheme, v6, SERVER_PORT),
    }
}

fn annotation<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    svc.annotations().get(key).map(String::as_str)
}

/// Find the observed service for `upstream`
pub fn find_service<'a>(services: &'a [Service], upstream: &str) -> Option<&'a Service> {
    services
        .iter()
        .find(|s| annotation(s, UPSTREAM_ANNOTATION) == Some(upstream))
}

/// Build the provider status from the observed services, in config order
pub fn compute_status(
    config: &RegistryConfig,
    services: &[Service],
    ca_secret_name: Option<String>,
) -> Result<RegistryStatus> {
    let mut caches = Vec::with_capacity(config.caches.len());
    for cache in &config.caches {
        let svc = find_service(services, &cache.upstream).ok_or_else(|| {
            Error::not_ready(format!("service for upstream {} not found", cache.upstream))
        })?;
        let ip = cluster_ip(svc).ok_or_else(|| {
            Error::not_ready(format!(
                "service {} has no cluster IP yet",
                svc.name_any()
            ))
        })?;
        let scheme = annotation(svc, SCHEME_ANNOTATION).unwrap_or(cache.scheme());
        let remote_url = annotation(svc, REMOTE_URL_ANNOTATION)
            .map(str::to_string)
            .unwrap_or_else(|| cache.remote_url());

        caches.push(RegistryCacheStatus {
            upstream: cache.upstream.clone(),
            endpoint: endpoint(scheme, ip),
            remote_url,
        });
    }

    Ok(RegistryStatus {
        caches,
        ca_secret_name: if config.any_tls_enabled() {
            ca_secret_name
        } else {
            None
        },
    })
}
