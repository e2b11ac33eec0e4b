//! Cache workloads
//!
//! Per cache: a content-addressed config secret, a StatefulSet running the
//! registry in proxy mode, an optional TLS secret, a NetworkPolicy, a
//! PodDisruptionBudget when highly available and a VPA when the shoot runs
//! one.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SeccompProfile, Secret, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use minijinja::{context, Environment, UndefinedBehavior};
use serde_json::json;

use registry_cache_api::helper::compute_kubernetes_resource_name;
use registry_cache_api::types::DEFAULT_VOLUME_SIZE;
use registry_cache_api::RegistryCache;
use registry_cache_common::kube_utils::short_checksum;
use registry_cache_common::{Error, Result, SHOOT_SYSTEM_NAMESPACE};

use super::{selector_labels, APP_LABEL, APP_NAME, DEBUG_PORT, SERVER_PORT};
use crate::managed_resources::ObjectRegistry;
use crate::secrets::{ServerCertificate, TLS_CERT_KEY, TLS_KEY_KEY};

const CONFIG_TEMPLATE: &str = include_str!("../../templates/config.yml.j2");

/// Key of the rendered config in the config secret
pub const CONFIG_KEY: &str = "config.yml";

/// Name of the cache container
pub const CONTAINER_NAME: &str = "registry-cache";

/// Where the registry keeps its blobs
pub const STORAGE_DIR: &str = "/var/lib/registry";

/// Where the config file is mounted
pub const CONFIG_PATH: &str = "/etc/distribution/config.yml";

/// Where the TLS secret is mounted
pub const TLS_DIR: &str = "/etc/distribution/tls";

const CACHE_VOLUME: &str = "cache-volume";
const CONFIG_VOLUME: &str = "config-volume";
const TLS_VOLUME: &str = "tls-volume";

const GARBAGE_COLLECTABLE_LABEL: &str = "resources.gardener.cloud/garbage-collectable-reference";
const HA_TYPE_LABEL: &str = "high-availability-config.resources.gardener.cloud/type";

const HA_REPLICAS: i32 = 2;

/// Removes a zero-byte scheduler state left by a crash together with the
/// store it described, then hands over to the registry entrypoint.
const ENTRYPOINT_PREAMBLE: &str = r#"STATE=/var/lib/registry/scheduler-state.json
if [ -f "$STATE" ] && [ ! -s "$STATE" ]; then
  echo "Found empty $STATE, removing it and the registry storage"
  rm -f "$STATE"
  rm -rf /var/lib/registry/docker
fi
exec /entrypoint.sh /etc/distribution/config.yml
"#;

/// Credentials for a private upstream
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredentials {
    /// Registry user name
    pub username: String,
    /// Registry password or token
    pub password: String,
}

impl fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Everything needed to compose one cache
#[derive(Clone, Debug)]
pub struct CacheInputs<'a> {
    /// The cache configuration
    pub cache: &'a RegistryCache,
    /// Resolved upstream credentials
    pub credentials: Option<UpstreamCredentials>,
    /// Server certificate when TLS is on
    pub tls: Option<ServerCertificate>,
}

/// Settings shared by all caches
#[derive(Clone, Debug, PartialEq)]
pub struct ComposeOptions {
    /// Registry image
    pub image: String,
    /// Whether the shoot runs a vertical pod autoscaler
    pub vpa_enabled: bool,
}

/// Render the registry config file for a cache
pub fn render_config(
    cache: &RegistryCache,
    credentials: Option<&UpstreamCredentials>,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("registry-config", CONFIG_TEMPLATE)
        .map_err(|e| Error::internal_with_context("render_config", e.to_string()))?;

    let template = env
        .get_template("registry-config")
        .map_err(|e| Error::internal_with_context("render_config", e.to_string()))?;
    template
        .render(context! {
            storage_dir => STORAGE_DIR,
            server_port => SERVER_PORT,
            debug_port => DEBUG_PORT,
            tls => cache.tls_enabled(),
            tls_cert_path => format!("{}/{}", TLS_DIR, TLS_CERT_KEY),
            tls_key_path => format!("{}/{}", TLS_DIR, TLS_KEY_KEY),
            remote_url => cache.remote_url(),
            ttl => cache.garbage_collection_ttl().to_string(),
            username => credentials.map(|c| c.username.clone()),
            password => credentials.map(|c| c.password.replace('\'', "''")),
        })
        .map_err(|e| Error::internal_with_context("render_config", e.to_string()))
}

fn immutable_secret(name: String, type_: &str, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                GARBAGE_COLLECTABLE_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        immutable: Some(true),
        data: Some(data),
        ..Default::default()
    }
}

/// Config secret named after a hash of its content
pub fn config_secret(resource_name: &str, config: &str) -> Secret {
    immutable_secret(
        format!("{}-config-{}", resource_name, short_checksum(config.as_bytes())),
        "Opaque",
        BTreeMap::from([(CONFIG_KEY.to_string(), ByteString(config.as_bytes().to_vec()))]),
    )
}

/// TLS secret named after a hash of its content
pub fn tls_secret(resource_name: &str, cert: &ServerCertificate) -> Secret {
    let digest = short_checksum(format!("{}{}", cert.cert_pem, cert.key_pem).as_bytes());
    immutable_secret(
        format!("{}-tls-{}", resource_name, digest),
        "kubernetes.io/tls",
        BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(cert.cert_pem.as_bytes().to_vec())),
            (TLS_KEY_KEY.to_string(), ByteString(cert.key_pem.as_bytes().to_vec())),
        ]),
    )
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn health_probe(failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/debug/health".to_string()),
            port: IntOrString::Int(DEBUG_PORT),
            ..Default::default()
        }),
        failure_threshold: Some(failure_threshold),
        success_threshold: Some(1),
        period_seconds: Some(20),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// StatefulSet running the cache
pub fn stateful_set(
    cache: &RegistryCache,
    image: &str,
    config_secret_name: &str,
    tls_secret_name: Option<&str>,
) -> StatefulSet {
    let name = compute_kubernetes_resource_name(&cache.upstream);
    let labels = selector_labels(&cache.upstream);

    let mut sts_labels = labels.clone();
    let replicas = if cache.high_availability_enabled() {
        sts_labels.insert(HA_TYPE_LABEL.to_string(), "server".to_string());
        HA_REPLICAS
    } else {
        1
    };

    let mut env = vec![env_var("OTEL_TRACES_EXPORTER", "none")];
    if let Some(proxy) = &cache.proxy {
        if let Some(http) = proxy.http_proxy.as_deref() {
            env.push(env_var("HTTP_PROXY", http));
        }
        if let Some(https) = proxy.https_proxy.as_deref() {
            env.push(env_var("HTTPS_PROXY", https));
        }
    }

    let mut mounts = vec![
        VolumeMount {
            name: CACHE_VOLUME.to_string(),
            mount_path: STORAGE_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_PATH.to_string(),
            sub_path: Some(CONFIG_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    let mut volumes = vec![secret_volume(CONFIG_VOLUME, config_secret_name)];
    if let Some(tls) = tls_secret_name {
        mounts.push(VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(secret_volume(TLS_VOLUME, tls));
    }

    let size = cache
        .volume_size()
        .cloned()
        .unwrap_or_else(|| Quantity(DEFAULT_VOLUME_SIZE.to_string()));

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            ENTRYPOINT_PREAMBLE.to_string(),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("registry-cache".to_string()),
                container_port: SERVER_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("debug".to_string()),
                container_port: DEBUG_PORT,
                ..Default::default()
            },
        ]),
        env: Some(env),
        liveness_probe: Some(health_probe(6)),
        readiness_probe: Some(health_probe(3)),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("20m".to_string())),
                ("memory".to_string(), Quantity("50Mi".to_string())),
            ])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            labels: Some(sts_labels),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: name,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    security_context: Some(PodSecurityContext {
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(CACHE_VOLUME.to_string()),
                    labels: Some(selector_labels(&cache.upstream)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: cache.volume_storage_class_name().map(str::to_string),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Disruption budget for highly available caches
pub fn pod_disruption_budget(cache: &RegistryCache) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(compute_kubernetes_resource_name(&cache.upstream)),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            labels: Some(selector_labels(&cache.upstream)),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&cache.upstream)),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("AlwaysAllow".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress to the cache's server and debug ports
pub fn network_policy(cache: &RegistryCache) -> NetworkPolicy {
    let port = |p: i32| NetworkPolicyPort {
        port: Some(IntOrString::Int(p)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(format!(
                "allow-ingress-to-{}",
                compute_kubernetes_resource_name(&cache.upstream)
            )),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(&cache.upstream)),
                ..Default::default()
            },
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            APP_LABEL.to_string(),
                            APP_NAME.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ports: Some(vec![port(SERVER_PORT), port(DEBUG_PORT)]),
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// VPA adjusting the cache's requests
pub fn vertical_pod_autoscaler(cache: &RegistryCache) -> serde_json::Value {
    let name = compute_kubernetes_resource_name(&cache.upstream);
    json!({
        "apiVersion": "autoscaling.k8s.io/v1",
        "kind": "VerticalPodAutoscaler",
        "metadata": {
            "name": name,
            "namespace": SHOOT_SYSTEM_NAMESPACE,
        },
        "spec": {
            "targetRef": {
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "name": name,
            },
            "updatePolicy": { "updateMode": "Auto" },
            "resourcePolicy": {
                "containerPolicies": [{
                    "containerName": CONTAINER_NAME,
                    "minAllowed": { "memory": "20Mi" },
                    "controlledValues": "RequestsOnly",
                }],
            },
        },
    })
}

/// The workload bundle for every cache
pub fn compose_caches(
    inputs: &[CacheInputs<'_>],
    options: &ComposeOptions,
) -> Result<ObjectRegistry> {
    let mut registry = ObjectRegistry::new();

    for input in inputs {
        let cache = input.cache;
        let resource_name = compute_kubernetes_resource_name(&cache.upstream);

        let config = render_config(cache, input.credentials.as_ref())?;
        let config_secret = config_secret(&resource_name, &config);
        let config_secret_name = config_secret.metadata.name.clone().unwrap_or_default();
        registry.add(&config_secret)?;

        let tls_secret_name = if cache.tls_enabled() {
            let cert = input.tls.as_ref().ok_or_else(|| {
                Error::internal_with_context(
                    "compose_caches",
                    format!("no server certificate for TLS cache {}", cache.upstream),
                )
            })?;
            let secret = tls_secret(&resource_name, cert);
            let name = secret.metadata.name.clone();
            registry.add(&secret)?;
            name
        } else {
            None
        };

        registry.add(&stateful_set(
            cache,
            &options.image,
            &config_secret_name,
            tls_secret_name.as_deref(),
        ))?;
        registry.add(&network_policy(cache))?;
        if cache.high_availability_enabled() {
            registry.add(&pod_disruption_budget(cache))?;
        }
        if options.vpa_enabled {
            registry.add(&vertical_pod_autoscaler(cache))?;
        }
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_cache_api::{GarbageCollection, GoDuration, HighAvailability, Http, Proxy};

    fn options() -> ComposeOptions {
        ComposeOptions {
            image: "europe-docker.pkg.dev/gardener-project/releases/3rd/registry:3.0.0".to_string(),
            vpa_enabled: false,
        }
    }

    fn cert() -> ServerCertificate {
        ServerCertificate {
            secret_name: "docker.io-tls-abcdef12".to_string(),
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        }
    }

    fn explicit_override() -> RegistryCache {
        RegistryCache {
            remote_url: Some("http://my-registry.io:5000".to_string()),
            volume: Some(registry_cache_api::Volume {
                size: Some(Quantity("2Gi".to_string())),
                storage_class_name: None,
            }),
            http: Some(Http { tls: false }),
            garbage_collection: Some(GarbageCollection {
                ttl: GoDuration::ZERO,
            }),
            ..RegistryCache::new("my-registry.io:5000")
        }
    }

    fn sts_of(bundle: &ObjectRegistry, name: &str) -> StatefulSet {
        serde_json::from_value(bundle.find("StatefulSet", name).unwrap().clone()).unwrap()
    }

    #[test]
    fn default_config_has_tls_and_week_ttl() {
        let config = render_config(&RegistryCache::new("docker.io"), None).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();

        assert_eq!(parsed["proxy"]["remoteurl"], "https://registry-1.docker.io");
        assert_eq!(parsed["proxy"]["ttl"], "168h0m0s");
        assert_eq!(parsed["http"]["addr"], ":5000");
        assert_eq!(parsed["http"]["debug"]["addr"], ":5001");
        assert_eq!(parsed["http"]["tls"]["certificate"], "/etc/distribution/tls/tls.crt");
        assert_eq!(parsed["storage"]["filesystem"]["rootdirectory"], "/var/lib/registry");
        assert!(parsed["proxy"].get("username").is_none());
    }

    #[test]
    fn plain_http_config_has_no_tls_block() {
        let config = render_config(&explicit_override(), None).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();

        assert_eq!(parsed["proxy"]["ttl"], "0s");
        assert_eq!(parsed["proxy"]["remoteurl"], "http://my-registry.io:5000");
        assert!(parsed["http"].get("tls").is_none());
    }

    #[test]
    fn credentials_are_rendered_with_quoted_password() {
        let creds = UpstreamCredentials {
            username: "john".to_string(),
            password: "It's12o'clock".to_string(),
        };
        let config = render_config(&RegistryCache::new("docker.io"), Some(&creds)).unwrap();

        assert!(config.contains("username: john"));
        assert!(config.contains("password: 'It''s12o''clock'"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed["proxy"]["password"], "It's12o'clock");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = UpstreamCredentials {
            username: "john".to_string(),
            password: "swordfish".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("swordfish"));
    }

    #[test]
    fn config_secret_name_tracks_content() {
        let a = config_secret("registry-docker-io", "a");
        let b = config_secret("registry-docker-io", "b");
        assert_ne!(a.metadata.name, b.metadata.name);
        assert_eq!(a.immutable, Some(true));
        assert!(a.metadata.name.unwrap().starts_with("registry-docker-io-config-"));
    }

    #[test]
    fn network_policy_admits_registry_cache_pods_on_both_ports() {
        let policy = network_policy(&RegistryCache::new("ghcr.io"));
        assert_eq!(policy.metadata.name.as_deref(), Some("allow-ingress-to-registry-ghcr-io"));

        let spec = policy.spec.unwrap();
        let rules = spec.ingress.unwrap();
        assert_eq!(rules.len(), 1);

        let peers = rules[0].from.as_ref().unwrap();
        assert_eq!(peers.len(), 1);
        let selector = peers[0].pod_selector.as_ref().unwrap();
        assert_eq!(
            selector.match_labels.as_ref().unwrap().get("app.kubernetes.io/name"),
            Some(&"registry-cache".to_string())
        );
        assert!(peers[0].namespace_selector.is_none());

        let ports: Vec<_> = rules[0]
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.port.clone())
            .collect();
        assert_eq!(
            ports,
            vec![Some(IntOrString::Int(5000)), Some(IntOrString::Int(5001))]
        );
    }

    #[test]
    fn default_cache_bundle() {
        let cache = RegistryCache::new("docker.io");
        let inputs = [CacheInputs {
            cache: &cache,
            credentials: None,
            tls: Some(cert()),
        }];
        let bundle = compose_caches(&inputs, &options()).unwrap();

        assert_eq!(bundle.of_kind("Secret").count(), 2);
        assert_eq!(bundle.of_kind("NetworkPolicy").count(), 1);
        assert_eq!(bundle.of_kind("PodDisruptionBudget").count(), 0);
        assert_eq!(bundle.of_kind("VerticalPodAutoscaler").count(), 0);

        let sts = sts_of(&bundle, "registry-docker-io");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name, "registry-docker-io");

        let claim = &spec.volume_claim_templates.unwrap()[0];
        let requests = claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.clone())
            .unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".to_string()));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.automount_service_account_token, Some(false));
        let container = &pod.containers[0];
        assert!(container.command.as_ref().unwrap()[2].contains("scheduler-state.json"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "OTEL_TRACES_EXPORTER"));
        let mounts: Vec<_> = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert!(mounts.contains(&"/etc/distribution/tls"));

        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.failure_threshold, Some(6));
        assert_eq!(liveness.period_seconds, Some(20));
    }

    #[test]
    fn plain_http_bundle_has_no_tls_secret() {
        let cache = explicit_override();
        let inputs = [CacheInputs {
            cache: &cache,
            credentials: None,
            tls: None,
        }];
        let bundle = compose_caches(&inputs, &options()).unwrap();

        assert_eq!(bundle.of_kind("Secret").count(), 1);
        let sts = sts_of(&bundle, "registry-my-registry-io-5000");
        let claim = &sts.spec.unwrap().volume_claim_templates.unwrap()[0];
        let requests = claim
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.clone())
            .unwrap();
        assert_eq!(requests["storage"], Quantity("2Gi".to_string()));
    }

    #[test]
    fn tls_cache_without_certificate_is_an_error() {
        let cache = RegistryCache::new("docker.io");
        let inputs = [CacheInputs {
            cache: &cache,
            credentials: None,
            tls: None,
        }];
        assert!(compose_caches(&inputs, &options()).is_err());
    }

    #[test]
    fn high_availability_and_vpa() {
        let cache = RegistryCache {
            high_availability: Some(HighAvailability { enabled: true }),
            proxy: Some(Proxy {
                http_proxy: Some("http://proxy:3128".to_string()),
                https_proxy: None,
            }),
            ..RegistryCache::new("ghcr.io")
        };
        let inputs = [CacheInputs {
            cache: &cache,
            credentials: None,
            tls: Some(cert()),
        }];
        let bundle = compose_caches(
            &inputs,
            &ComposeOptions {
                vpa_enabled: true,
                ..options()
            },
        )
        .unwrap();

        assert_eq!(bundle.of_kind("PodDisruptionBudget").count(), 1);
        let vpa = bundle.find("VerticalPodAutoscaler", "registry-ghcr-io").unwrap();
        assert_eq!(vpa["spec"]["updatePolicy"]["updateMode"], "Auto");
        assert_eq!(
            vpa["spec"]["resourcePolicy"]["containerPolicies"][0]["minAllowed"]["memory"],
            "20Mi"
        );

        let sts = sts_of(&bundle, "registry-ghcr-io");
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(2));
        let env = sts.spec.unwrap().template.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "HTTP_PROXY"));
    }

    #[test]
    fn composition_is_deterministic() {
        let cache = RegistryCache::new("docker.io");
        let inputs = [CacheInputs {
            cache: &cache,
            credentials: None,
            tls: Some(cert()),
        }];
        let a = compose_caches(&inputs, &options()).unwrap().serialize().unwrap();
        let b = compose_caches(&inputs, &options()).unwrap().serialize().unwrap();
        assert_eq!(a, b);
    }
}
