//! Managed-resource delivery
//!
//! Shoot objects are never written directly. They are serialized into a
//! data secret in the extension namespace and referenced from a
//! `ManagedResource`, which the host platform applies to the shoot, health
//! checks, and garbage collects.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use registry_cache_common::gardener::{LocalObjectReference, ManagedResource, ManagedResourceSpec};
use registry_cache_common::kube_utils::{is_not_found, poll_until};
use registry_cache_common::{Error, Result, FIELD_MANAGER, NO_CLEANUP_LABEL};

/// Bundle holding the cache services
pub const SERVICES_BUNDLE: &str = "extension-registry-cache-services";

/// Bundle holding the cache workloads and their secrets
pub const CACHES_BUNDLE: &str = "extension-registry-cache";

/// Transient bundle holding the configuration cleaner
pub const CLEANER_BUNDLE: &str = "extension-registry-configuration-cleaner";

/// Interval between health and deletion checks
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Deadline for a bundle to become healthy or disappear
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Name of the data secret backing a bundle
pub fn data_secret_name(bundle: &str) -> String {
    format!("managedresource-{}", bundle)
}

/// Ordered set of serialized shoot objects
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectRegistry {
    objects: BTreeMap<String, Value>,
}

impl ObjectRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object; it must serialize with `kind` and `metadata.name`
    pub fn add(&mut self, obj: &impl Serialize) -> Result<()> {
        let value = serde_json::to_value(obj)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("object has no kind"))?;
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization_for_kind(kind, "object has no name"))?;
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("");

        let key = format!(
            "{}__{}__{}.yaml",
            kind.to_lowercase(),
            namespace,
            name.replace(':', "_")
        );
        self.objects.insert(key, value);
        Ok(())
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects of the given kind, in key order
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.objects
            .values()
            .filter(move |v| v.get("kind").and_then(Value::as_str) == Some(kind))
    }

    /// Look up an object by kind and name
    pub fn find(&self, kind: &str, name: &str) -> Option<&Value> {
        self.objects.values().find(|v| {
            v.get("kind").and_then(Value::as_str) == Some(kind)
                && v.pointer("/metadata/name").and_then(Value::as_str) == Some(name)
        })
    }

    /// Serialize every object to YAML, keyed deterministically
    pub fn serialize(&self) -> Result<BTreeMap<String, String>> {
        self.objects
            .iter()
            .map(|(k, v)| -> Result<(String, String)> { Ok((k.clone(), serde_yaml::to_string(v)?)) })
            .collect()
    }
}

/// Delivery options for a bundle
#[derive(Clone, Debug, PartialEq)]
pub struct BundleOptions {
    /// Leave shoot objects in place when the bundle is removed
    pub keep_objects: bool,
    /// Delete PVCs created from volume claim templates on removal
    pub delete_persistent_volume_claims: bool,
    /// Labels injected into every shoot object
    pub inject_labels: BTreeMap<String, String>,
}

impl BundleOptions {
    /// Options used for every bundle shipped to the shoot
    pub fn for_shoot() -> Self {
        Self {
            keep_objects: false,
            delete_persistent_volume_claims: true,
            inject_labels: BTreeMap::from([(NO_CLEANUP_LABEL.to_string(), "true".to_string())]),
        }
    }
}

/// Operations on managed resources in the extension namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagedResourceClient: Send + Sync {
    /// Create or update the bundle with exactly `objects`
    async fn deploy(
        &self,
        namespace: &str,
        name: &str,
        objects: ObjectRegistry,
        options: BundleOptions,
    ) -> Result<()>;

    /// Wait until the bundle reports applied and healthy
    async fn wait_until_healthy(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<()>;

    /// Request deletion of the bundle
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Wait until the bundle is gone
    async fn wait_until_deleted(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<()>;

    /// Delete the secret holding the bundle's objects
    async fn delete_data_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Toggle whether shoot objects survive removal of the bundle
    async fn set_keep_objects(&self, namespace: &str, name: &str, keep: bool) -> Result<()>;
}

/// [`ManagedResourceClient`] backed by the seed API server
pub struct KubeManagedResources {
    client: Client,
}

impl KubeManagedResources {
    /// Create a client for the seed
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ManagedResource> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ManagedResourceClient for KubeManagedResources {
    async fn deploy(
        &self,
        namespace: &str,
        name: &str,
        objects: ObjectRegistry,
        options: BundleOptions,
    ) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let secret_name = data_secret_name(name);

        let data = objects
            .serialize()?
            .into_iter()
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        };
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets
            .patch(&secret_name, &params, &Patch::Apply(&secret))
            .await?;

        let mut mr = ManagedResource::new(
            name,
            ManagedResourceSpec {
                secret_refs: vec![LocalObjectReference { name: secret_name }],
                inject_labels: Some(options.inject_labels),
                keep_objects: Some(options.keep_objects),
                delete_persistent_volume_claims: Some(options.delete_persistent_volume_claims),
                class: None,
            },
        );
        mr.metadata.namespace = Some(namespace.to_string());
        self.api(namespace)
            .patch(name, &params, &Patch::Apply(&mr))
            .await?;

        info!(namespace, managed_resource = name, objects = objects.len(), "deployed managed resource");
        Ok(())
    }

    async fn wait_until_healthy(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api(namespace);
        poll_until(
            timeout,
            POLL_INTERVAL,
            format!("managed resource {}/{} to become healthy", namespace, name),
            || {
                let api = api.clone();
                async move {
                    let mr = api.get(name).await?;
                    mr.check_health().map_err(Error::not_ready)?;
                    Ok(true)
                }
            },
        )
        .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!(namespace, managed_resource = name, "deleting managed resource"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_data_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets
            .delete(&data_secret_name(name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_until_deleted(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.api(namespace);
        poll_until(
            timeout,
            POLL_INTERVAL,
            format!("managed resource {}/{} to be deleted", namespace, name),
            || {
                let api = api.clone();
                async move { Ok(api.get_opt(name).await?.is_none()) }
            },
        )
        .await
    }

    async fn set_keep_objects(&self, namespace: &str, name: &str, keep: bool) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "keepObjects": keep } });
        match self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Delete a bundle, wait until it is gone, then drop its data secret
///
/// The data secret must outlive the ManagedResource: the resource manager
/// reads it to clean up the shoot objects.
pub async fn destroy(
    client: &dyn ManagedResourceClient,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    client.delete(namespace, name).await?;
    client.wait_until_deleted(namespace, name, timeout).await?;
    client.delete_data_secret(namespace, name).await
}

/// Delete a bundle and its data secret without waiting
pub async fn destroy_now(client: &dyn ManagedResourceClient, namespace: &str, name: &str) -> Result<()> {
    client.delete(namespace, name).await?;
    client.delete_data_secret(namespace, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};

    fn service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn keys_are_kind_namespace_name() {
        let mut registry = ObjectRegistry::new();
        registry.add(&service("registry-docker-io")).unwrap();

        let data = registry.serialize().unwrap();
        let key = "service__kube-system__registry-docker-io.yaml";
        assert!(data.contains_key(key), "{:?}", data.keys());
        assert!(data[key].contains("kind: Service"));
    }

    #[test]
    fn serialization_is_deterministic() {
        let mut a = ObjectRegistry::new();
        a.add(&service("registry-b")).unwrap();
        a.add(&service("registry-a")).unwrap();

        let mut b = ObjectRegistry::new();
        b.add(&service("registry-a")).unwrap();
        b.add(&service("registry-b")).unwrap();

        assert_eq!(a.serialize().unwrap(), b.serialize().unwrap());
        let keys: Vec<_> = a.serialize().unwrap().into_keys().collect();
        assert!(keys[0] < keys[1]);
    }

    #[test]
    fn objects_without_name_are_rejected() {
        let mut registry = ObjectRegistry::new();
        assert!(registry.add(&ConfigMap::default()).is_err());
    }

    #[test]
    fn lookup_by_kind_and_name() {
        let mut registry = ObjectRegistry::new();
        registry.add(&service("registry-a")).unwrap();
        assert!(registry.find("Service", "registry-a").is_some());
        assert!(registry.find("Service", "registry-b").is_none());
        let kind = String::from("Service");
        let found = registry.find(&kind, "registry-a");
        drop(kind);
        assert!(found.is_some());
        assert_eq!(registry.of_kind("Service").count(), 1);
    }

    #[tokio::test]
    async fn data_secret_is_deleted_after_the_bundle_is_gone() {
        let mut seq = mockall::Sequence::new();
        let mut client = MockManagedResourceClient::new();
        client
            .expect_delete()
            .withf(|ns, name| ns == "shoot--foo--bar" && name == CACHES_BUNDLE)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        client
            .expect_wait_until_deleted()
            .withf(|_, name, timeout| name == CACHES_BUNDLE && *timeout == DEFAULT_TIMEOUT)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        client
            .expect_delete_data_secret()
            .withf(|_, name| name == CACHES_BUNDLE)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        destroy(&client, "shoot--foo--bar", CACHES_BUNDLE, DEFAULT_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn data_secret_survives_a_deletion_timeout() {
        let mut client = MockManagedResourceClient::new();
        client.expect_delete().returning(|_, _| Ok(()));
        client
            .expect_wait_until_deleted()
            .returning(|_, name, _| Err(Error::timeout(name, "managed resource still present")));
        client.expect_delete_data_secret().never();

        let err = destroy(&client, "shoot--foo--bar", SERVICES_BUNDLE, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn shoot_bundles_protect_objects_and_collect_pvcs() {
        let options = BundleOptions::for_shoot();
        assert!(options.delete_persistent_volume_claims);
        assert!(!options.keep_objects);
        assert_eq!(
            options.inject_labels.get("shoot.gardener.cloud/no-cleanup"),
            Some(&"true".to_string())
        );
    }
}
