//! Seed-side monitoring for the caches of one shoot

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

use registry_cache_common::SHOOT_SYSTEM_NAMESPACE;

use super::{APP_NAME, DEBUG_PORT};

const DASHBOARD: &str = include_str!("../../templates/registry-cache-dashboard.json");

/// Dashboard config map
pub const DASHBOARD_NAME: &str = "registry-cache-dashboards";

/// Alerting and recording rules
pub const PROMETHEUS_RULE_NAME: &str = "shoot-registry-cache";

/// Scrape configuration
pub const SCRAPE_CONFIG_NAME: &str = "shoot-registry-cache";

const DASHBOARD_LABEL: &str = "dashboard.monitoring.gardener.cloud/shoot";
const PROMETHEUS_LABEL: &str = "prometheus";
const PROMETHEUS_SHOOT: &str = "shoot";

const PVC_SELECTOR: &str = r#"persistentvolumeclaim=~"cache-volume-registry-.+""#;

/// Objects applied to the extension namespace
#[derive(Clone, Debug, PartialEq)]
pub struct MonitoringObjects {
    /// Grafana dashboard
    pub dashboard: ConfigMap,
    /// `monitoring.coreos.com/v1` PrometheusRule
    pub prometheus_rule: Value,
    /// `monitoring.coreos.com/v1alpha1` ScrapeConfig
    pub scrape_config: Value,
}

fn shoot_prometheus_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(PROMETHEUS_LABEL.to_string(), PROMETHEUS_SHOOT.to_string())])
}

/// Dashboard config map
pub fn dashboard(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(DASHBOARD_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(DASHBOARD_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "registry-cache.dashboard.json".to_string(),
            DASHBOARD.to_string(),
        )])),
        ..Default::default()
    }
}

/// PVC alerts and per-upstream byte counters
pub fn prometheus_rule(namespace: &str) -> Value {
    let free_percent = format!(
        "100 * kubelet_volume_stats_available_bytes{{{sel}}} / kubelet_volume_stats_capacity_bytes{{{sel}}}",
        sel = PVC_SELECTOR
    );

    json!({
        "metadata": {
            "name": PROMETHEUS_RULE_NAME,
            "namespace": namespace,
            "labels": shoot_prometheus_labels(),
        },
        "spec": {
            "groups": [{
                "name": "registry-cache.rules",
                "rules": [
                    {
                        "alert": "RegistryCachePersistentVolumeUsageCritical",
                        "expr": format!("{} < 5", free_percent),
                        "for": "1h",
                        "labels": { "severity": "warning", "type": "shoot", "visibility": "owner" },
                        "annotations": {
                            "summary": "Registry cache volume almost full",
                            "description": "The registry cache volume {{ $labels.persistentvolumeclaim }} has less than 5% free space.",
                        },
                    },
                    {
                        "alert": "RegistryCachePersistentVolumeFullInFourDays",
                        "expr": format!(
                            "{} < 15 and predict_linear(kubelet_volume_stats_available_bytes{{{}}}[30m], 4 * 24 * 3600) <= 0",
                            free_percent, PVC_SELECTOR
                        ),
                        "for": "1h",
                        "labels": { "severity": "warning", "type": "shoot", "visibility": "owner" },
                        "annotations": {
                            "summary": "Registry cache volume fills up within four days",
                            "description": "Based on the recent trend the registry cache volume {{ $labels.persistentvolumeclaim }} is expected to fill up within four days.",
                        },
                    },
                    {
                        "record": "shoot:registry_proxy_pulled_bytes_total:sum",
                        "expr": "sum by (upstream_host) (registry_proxy_pulled_bytes_total)",
                    },
                    {
                        "record": "shoot:registry_proxy_pushed_bytes_total:sum",
                        "expr": "sum by (upstream_host) (registry_proxy_pushed_bytes_total)",
                    },
                ],
            }],
        },
    })
}

/// Scrape the cache pods' debug port through the shoot API server proxy
pub fn scrape_config(namespace: &str) -> Value {
    let tls = json!({ "ca": { "secret": { "name": "ca", "key": "bundle.crt" } } });
    let authorization = json!({
        "type": "Bearer",
        "credentials": { "name": "shoot-access-prometheus-shoot", "key": "token" },
    });

    json!({
        "metadata": {
            "name": SCRAPE_CONFIG_NAME,
            "namespace": namespace,
            "labels": shoot_prometheus_labels(),
        },
        "spec": {
            "honorLabels": false,
            "scheme": "HTTPS",
            "tlsConfig": tls,
            "authorization": authorization,
            "kubernetesSDConfigs": [{
                "apiServer": "https://kube-apiserver",
                "role": "Pod",
                "namespaces": { "names": [SHOOT_SYSTEM_NAMESPACE] },
                "tlsConfig": tls,
                "authorization": authorization,
                "followRedirects": true,
            }],
            "relabelings": [
                {
                    "sourceLabels": ["__meta_kubernetes_pod_label_app_kubernetes_io_name"],
                    "regex": APP_NAME,
                    "action": "keep",
                },
                {
                    "sourceLabels": ["__meta_kubernetes_pod_container_port_number"],
                    "regex": DEBUG_PORT.to_string(),
                    "action": "keep",
                },
                {
                    "sourceLabels": ["__meta_kubernetes_pod_label_upstream_host"],
                    "targetLabel": "upstream_host",
                },
                {
                    "sourceLabels": ["__meta_kubernetes_pod_name"],
                    "targetLabel": "pod",
                },
                {
                    "targetLabel": "__address__",
                    "replacement": "kube-apiserver:443",
                },
                {
                    "sourceLabels": ["__meta_kubernetes_pod_name", "__meta_kubernetes_pod_container_port_number"],
                    "regex": "(.+);(.+)",
                    "targetLabel": "__metrics_path__",
                    "replacement": format!("/api/v1/namespaces/{}/pods/${{1}}:${{2}}/proxy/metrics", SHOOT_SYSTEM_NAMESPACE),
                },
            ],
            "metricRelabelings": [{
                "sourceLabels": ["__name__"],
                "regex": "registry_proxy_.+|registry_storage_.+|registry_http_.+",
                "action": "keep",
            }],
        },
    })
}

/// Everything applied for monitoring
pub fn compose_monitoring(namespace: &str) -> MonitoringObjects {
    MonitoringObjects {
        dashboard: dashboard(namespace),
        prometheus_rule: prometheus_rule(namespace),
        scrape_config: scrape_config(namespace),
    }
}
