//! OperatingSystemConfig mutator
//!
//! Points containerd on every node at the caches published in the
//! extension status. Only OSCs applied to running nodes are touched; the
//! response carries a JSON patch from the original to the mutated object.

use std::sync::Arc;

use axum::{extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use registry_cache_api::decode_registry_status;
use registry_cache_common::gardener::{
    FileContent, FileContentInline, OscFile, CA_BUNDLE_PATH, CONFIGURE_SCRIPT_PATH,
    OSC_PURPOSE_RECONCILE,
};
use registry_cache_common::metrics::record_admission;
use registry_cache_common::EXTENSION_TYPE;

use crate::error::WebhookError;
use crate::hosts::{configure_script, configure_unit, registry_configs};
use crate::readers::SeedReader;

/// Path the mutator is served on
pub const MUTATOR_PATH: &str = "/webhooks/operatingsystemconfig";

/// Key of the CA bundle in the secret named by `caSecretName`
pub const CA_BUNDLE_KEY: &str = "bundle.crt";

const WEBHOOK_NAME: &str = "osc-mutator";

const CA_BUNDLE_PERMISSIONS: u32 = 0o644;
const SCRIPT_PERMISSIONS: u32 = 0o744;

const REGISTRIES_PATH: [&str; 4] = ["spec", "criConfig", "containerd", "registries"];
const FILES_PATH: [&str; 2] = ["spec", "files"];
const UNITS_PATH: [&str; 2] = ["spec", "units"];

/// Shared state of the mutator
pub struct MutatorState {
    /// Seed reads
    pub seed: Arc<dyn SeedReader>,
}

/// Handle a mutating admission review for OperatingSystemConfigs
pub async fn mutate_handler(
    State(state): State<Arc<MutatorState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(review_osc(&state, &req).await.into_review())
}

#[instrument(skip_all, fields(uid = %request.uid, osc = %request.name))]
async fn review_osc(
    state: &MutatorState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let object = match (&request.operation, &request.object) {
        (Operation::Create | Operation::Update, Some(object)) => object,
        _ => return AdmissionResponse::from(request),
    };

    let patch = match patch_for(state.seed.as_ref(), object).await {
        Ok(patch) => patch,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Failed to mutate OperatingSystemConfig");
            record_admission(WEBHOOK_NAME, false);
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };
    record_admission(WEBHOOK_NAME, true);

    let Some(patch) = patch else {
        return AdmissionResponse::from(request);
    };
    info!(operations = patch.0.len(), "Patching OperatingSystemConfig");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

async fn patch_for(
    seed: &dyn SeedReader,
    object: &DynamicObject,
) -> Result<Option<json_patch::Patch>, WebhookError> {
    let original = serde_json::to_value(object)?;
    Ok(mutate_osc(seed, &original)
        .await?
        .map(|mutated| json_patch::diff(&original, &mutated)))
}

/// Mutated copy of an OperatingSystemConfig, `None` when it is left alone
pub async fn mutate_osc(seed: &dyn SeedReader, osc: &Value) -> Result<Option<Value>, WebhookError> {
    if osc.pointer("/spec/purpose").and_then(Value::as_str) != Some(OSC_PURPOSE_RECONCILE) {
        return Ok(None);
    }
    let namespace = osc
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookError::InvalidReview("OperatingSystemConfig has no namespace".to_string()))?;
    let extension_ref = format!("{namespace}/{EXTENSION_TYPE}");

    let extension = seed
        .get_extension(namespace, EXTENSION_TYPE)
        .await?
        .ok_or_else(|| WebhookError::NotFound {
            kind: "Extension",
            name: extension_ref.clone(),
        })?;
    let shoot = seed.get_cluster(namespace).await?.shoot()?;
    if shoot.is_being_deleted() || shoot.is_hibernated() {
        debug!(namespace, "Shoot is being deleted or hibernated, leaving OSC alone");
        return Ok(None);
    }

    let raw_status = extension
        .provider_status()
        .ok_or_else(|| WebhookError::MissingStatus {
            extension: extension_ref,
        })?;
    let status = decode_registry_status(raw_status).map_err(|source| WebhookError::Decode {
        what: "providerStatus",
        source,
    })?;

    let registries = registry_configs(&status);
    let mut files = Vec::new();
    if let Some(ca_secret) = status.ca_secret_name.as_deref() {
        files.push(ca_bundle_file(seed, namespace, ca_secret).await?);
    }
    files.push(inline_file(
        CONFIGURE_SCRIPT_PATH,
        SCRIPT_PERMISSIONS,
        configure_script(&registries)?.as_bytes(),
    ));

    let mut mutated = osc.clone();
    upsert_by(
        &mut mutated,
        &REGISTRIES_PATH,
        "upstream",
        registries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?,
    )?;
    upsert_by(
        &mut mutated,
        &FILES_PATH,
        "path",
        files
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?,
    )?;
    upsert_by(
        &mut mutated,
        &UNITS_PATH,
        "name",
        vec![serde_json::to_value(configure_unit())?],
    )?;
    Ok(Some(mutated))
}

async fn ca_bundle_file(seed: &dyn SeedReader, namespace: &str, name: &str) -> Result<OscFile, WebhookError> {
    let secret_ref = format!("{namespace}/{name}");
    let secret = seed
        .get_secret(namespace, name)
        .await?
        .ok_or_else(|| WebhookError::NotFound {
            kind: "Secret",
            name: secret_ref.clone(),
        })?;
    let bundle = secret
        .data
        .as_ref()
        .and_then(|d| d.get(CA_BUNDLE_KEY))
        .ok_or_else(|| WebhookError::NotFound {
            kind: "CA bundle",
            name: format!("{secret_ref}/{CA_BUNDLE_KEY}"),
        })?;
    Ok(inline_file(CA_BUNDLE_PATH, CA_BUNDLE_PERMISSIONS, &bundle.0))
}

fn inline_file(path: &str, permissions: u32, data: &[u8]) -> OscFile {
    OscFile {
        path: path.to_string(),
        permissions: Some(permissions),
        content: FileContent {
            inline: Some(FileContentInline {
                encoding: "b64".to_string(),
                data: STANDARD.encode(data),
            }),
        },
    }
}

/// Replace entries of the list at `path` whose `key` matches, append the rest
fn upsert_by(root: &mut Value, path: &[&str], key: &str, items: Vec<Value>) -> Result<(), WebhookError> {
    let list = array_at(root, path)?;
    for item in items {
        match list.iter_mut().find(|e| e.get(key).is_some() && e.get(key) == item.get(key)) {
            Some(existing) => *existing = item,
            None => list.push(item),
        }
    }
    Ok(())
}

/// List at `path`, creating missing parents
fn array_at<'a>(root: &'a mut Value, path: &[&str]) -> Result<&'a mut Vec<Value>, WebhookError> {
    let malformed = || WebhookError::InvalidReview(format!("{} is not a list", path.join(".")));
    let mut current = root;
    for (i, segment) in path.iter().enumerate() {
        let entry = current
            .as_object_mut()
            .ok_or_else(malformed)?
            .entry(segment.to_string())
            .or_insert(Value::Null);
        if entry.is_null() {
            *entry = if i + 1 == path.len() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Default::default())
            };
        }
        current = entry;
    }
    current.as_array_mut().ok_or_else(malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use registry_cache_api::{encode_registry_status, RegistryCacheStatus, RegistryStatus};
    use registry_cache_common::gardener::{
        Cluster, ClusterSpec, Extension, ExtensionSpec, ExtensionStatus, CONFIGURE_UNIT_NAME,
    };
    use serde_json::json;

    use crate::readers::MockSeedReader;

    const NAMESPACE: &str = "shoot--dev--crazy-botany";
    const CA_SECRET: &str = "ca-extension-registry-cache-bundle-1a2b3c4d";
    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn status() -> Value {
        encode_registry_status(&RegistryStatus {
            caches: vec![
                RegistryCacheStatus {
                    upstream: "docker.io".to_string(),
                    endpoint: "https://10.4.246.205:5000".to_string(),
                    remote_url: "https://registry-1.docker.io".to_string(),
                },
                RegistryCacheStatus {
                    upstream: "ghcr.io".to_string(),
                    endpoint: "https://10.4.26.127:5000".to_string(),
                    remote_url: "https://ghcr.io".to_string(),
                },
            ],
            ca_secret_name: Some(CA_SECRET.to_string()),
        })
        .unwrap()
    }

    fn extension(provider_status: Option<Value>) -> Extension {
        let mut ext = Extension::new(
            EXTENSION_TYPE,
            ExtensionSpec {
                type_: EXTENSION_TYPE.to_string(),
                class: None,
                provider_config: None,
            },
        );
        ext.metadata.namespace = Some(NAMESPACE.to_string());
        ext.status = provider_status.map(|s| ExtensionStatus {
            provider_status: Some(s),
            ..Default::default()
        });
        ext
    }

    fn seed(provider_status: Option<Value>, shoot: Value) -> MockSeedReader {
        let mut seed = MockSeedReader::new();
        let ext = extension(provider_status);
        seed.expect_get_extension()
            .returning(move |_, _| Ok(Some(ext.clone())));
        seed.expect_get_cluster().returning(move |name| {
            Ok(Cluster::new(
                name,
                ClusterSpec {
                    shoot: shoot.clone(),
                    ..Default::default()
                },
            ))
        });
        seed.expect_get_secret().returning(|_, name| {
            Ok((name == CA_SECRET).then(|| Secret {
                data: Some(
                    [(CA_BUNDLE_KEY.to_string(), ByteString(CA_PEM.as_bytes().to_vec()))].into(),
                ),
                ..Default::default()
            }))
        });
        seed
    }

    fn running_shoot() -> Value {
        json!({"metadata": {"name": "crazy-botany", "namespace": "garden-dev"}, "spec": {}})
    }

    fn osc(purpose: &str) -> Value {
        json!({
            "apiVersion": "extensions.gardener.cloud/v1alpha1",
            "kind": "OperatingSystemConfig",
            "metadata": {"name": "osc-worker-a", "namespace": NAMESPACE},
            "spec": {
                "type": "gardenlinux",
                "purpose": purpose,
                "criConfig": {"name": "containerd", "containerd": {"registries": [
                    {"upstream": "docker.io", "server": "https://mirror.example.com"},
                    {"upstream": "quay.io", "server": "https://quay.io", "readinessProbe": true}
                ]}},
                "files": [
                    {"path": CA_BUNDLE_PATH, "content": {"inline": {"data": "stale"}}},
                    {"path": "/etc/motd", "permissions": 420, "content": {"inline": {"data": "hi"}}}
                ],
                "units": [{"name": "kubelet.service", "enable": true}]
            }
        })
    }

    fn decoded(value: &Value) -> String {
        String::from_utf8(STANDARD.decode(value.as_str().unwrap()).unwrap()).unwrap()
    }

    /// Scenario: a node pool's OSC already carries a hand-written mirror for
    /// docker.io. After mutation, docker.io points at its cache, ghcr.io is
    /// added, quay.io is kept, and nodes get the CA bundle plus the script and
    /// unit writing the same configuration on legacy images.
    #[tokio::test]
    async fn story_nodes_are_pointed_at_the_caches() {
        let seed = seed(Some(status()), running_shoot());
        let mutated = mutate_osc(&seed, &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap()
            .unwrap();

        let registries = mutated
            .pointer("/spec/criConfig/containerd/registries")
            .unwrap()
            .as_array()
            .unwrap();
        let upstreams: Vec<&str> = registries
            .iter()
            .filter_map(|r| r["upstream"].as_str())
            .collect();
        assert_eq!(upstreams, vec!["docker.io", "quay.io", "ghcr.io"]);
        assert_eq!(registries[0]["server"], "https://registry-1.docker.io");
        assert_eq!(registries[0]["hosts"][0]["url"], "https://10.4.246.205:5000");
        assert_eq!(registries[0]["hosts"][0]["capabilities"], json!(["pull", "resolve"]));
        assert_eq!(registries[0]["hosts"][0]["caCerts"], json!([CA_BUNDLE_PATH]));
        assert_eq!(registries[1]["readinessProbe"], true);

        let files = mutated.pointer("/spec/files").unwrap().as_array().unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0]["path"], CA_BUNDLE_PATH);
        assert_eq!(files[0]["permissions"], 0o644);
        assert_eq!(decoded(&files[0]["content"]["inline"]["data"]), CA_PEM);
        assert_eq!(files[1]["path"], "/etc/motd");
        assert_eq!(files[2]["path"], CONFIGURE_SCRIPT_PATH);
        assert_eq!(files[2]["permissions"], 0o744);
        let script = decoded(&files[2]["content"]["inline"]["data"]);
        assert!(script.contains("/etc/containerd/certs.d/ghcr.io/hosts.toml"));

        let units = mutated.pointer("/spec/units").unwrap().as_array().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1]["name"], CONFIGURE_UNIT_NAME);
    }

    #[tokio::test]
    async fn mutation_is_idempotent() {
        let seed = seed(Some(status()), running_shoot());
        let once = mutate_osc(&seed, &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap()
            .unwrap();
        let twice = mutate_osc(&seed, &once).await.unwrap().unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn provision_osc_is_left_alone() {
        let result = mutate_osc(&MockSeedReader::new(), &osc("provision"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn hibernated_shoot_is_skipped_even_without_status() {
        let shoot = json!({"metadata": {"name": "crazy-botany"}, "spec": {"hibernation": {"enabled": true}}});
        let result = mutate_osc(&seed(None, shoot), &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn deleting_shoot_is_skipped() {
        let shoot = json!({
            "metadata": {"name": "crazy-botany", "deletionTimestamp": "2026-10-16T10:00:00Z"},
            "spec": {}
        });
        let result = mutate_osc(&seed(Some(status()), shoot), &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_status_fails() {
        let err = mutate_osc(&seed(None, running_shoot()), &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MissingStatus { .. }));
        assert_eq!(
            err.to_string(),
            format!("extension \"{NAMESPACE}/registry-cache\" has no provider status yet")
        );
    }

    #[tokio::test]
    async fn missing_extension_fails() {
        let mut seed = MockSeedReader::new();
        seed.expect_get_extension().returning(|_, _| Ok(None));
        let err = mutate_osc(&seed, &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::NotFound { kind: "Extension", .. }));
    }

    #[tokio::test]
    async fn plain_http_caches_need_no_ca_bundle() {
        let status = encode_registry_status(&RegistryStatus {
            caches: vec![RegistryCacheStatus {
                upstream: "my-registry.io:5000".to_string(),
                endpoint: "http://10.4.26.127:5000".to_string(),
                remote_url: "http://my-registry.io:5000".to_string(),
            }],
            ca_secret_name: None,
        })
        .unwrap();
        let mut osc = osc(OSC_PURPOSE_RECONCILE);
        osc["spec"].as_object_mut().unwrap().remove("files");

        let mutated = mutate_osc(&seed(Some(status), running_shoot()), &osc)
            .await
            .unwrap()
            .unwrap();
        let files = mutated.pointer("/spec/files").unwrap().as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], CONFIGURE_SCRIPT_PATH);
        let registry = &mutated.pointer("/spec/criConfig/containerd/registries").unwrap()[2];
        assert!(registry["hosts"][0].get("caCerts").is_none());
    }

    #[tokio::test]
    async fn missing_ca_secret_fails() {
        let mut status = status();
        status["caSecretName"] = json!("ca-extension-registry-cache-bundle-gone");
        let err = mutate_osc(&seed(Some(status), running_shoot()), &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::NotFound { kind: "Secret", .. }));
    }

    fn review(object: Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0c7b54f1-5f0f-4c55-8c43-3b8a2d9f6e21",
                "kind": {"group": "extensions.gardener.cloud", "version": "v1alpha1", "kind": "OperatingSystemConfig"},
                "resource": {"group": "extensions.gardener.cloud", "version": "v1alpha1", "resource": "operatingsystemconfigs"},
                "name": "osc-worker-a",
                "namespace": NAMESPACE,
                "operation": "UPDATE",
                "userInfo": {"username": "gardenlet"},
                "object": object,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn handler_patch_yields_the_mutated_object() {
        let seed = seed(Some(status()), running_shoot());
        let expected = mutate_osc(&seed, &osc(OSC_PURPOSE_RECONCILE))
            .await
            .unwrap()
            .unwrap();
        let state = Arc::new(MutatorState {
            seed: Arc::new(seed),
        });

        let Json(reviewed) = mutate_handler(State(state), Json(review(osc(OSC_PURPOSE_RECONCILE)))).await;
        let response = reviewed.response.unwrap();
        assert!(response.allowed);

        let patch: json_patch::Patch = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        let mut patched = osc(OSC_PURPOSE_RECONCILE);
        json_patch::patch(&mut patched, &patch).unwrap();
        assert_eq!(patched, expected);
    }

    #[tokio::test]
    async fn handler_denies_when_status_is_missing() {
        let state = Arc::new(MutatorState {
            seed: Arc::new(seed(None, running_shoot())),
        });
        let Json(reviewed) = mutate_handler(State(state), Json(review(osc(OSC_PURPOSE_RECONCILE)))).await;
        let response = reviewed.response.unwrap();
        assert!(!response.allowed);
        assert!(response.result.message.contains("has no provider status yet"));
    }
}
