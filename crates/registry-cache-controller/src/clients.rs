//! Seed and shoot API boundaries used by the actuator
//!
//! Each boundary is a trait so the actuator and controller can be tested
//! against mocks; the `Kube*` types are the production implementations.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, ApiResource, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use registry_cache_common::gardener::{Cluster, Extension};
use registry_cache_common::kube_utils::{
    client_from_kubeconfig, delete_ignore_not_found, get_secret_data, is_not_found, ApplyBatch,
};
use registry_cache_common::{
    Result, FIELD_MANAGER, FINALIZER, OPERATION_ANNOTATION, SHOOT_ACCESS_SECRET_NAME,
    SHOOT_SYSTEM_NAMESPACE,
};

use crate::composer::monitoring::{MonitoringObjects, DASHBOARD_NAME, PROMETHEUS_RULE_NAME, SCRAPE_CONFIG_NAME};
use crate::composer::services::SERVICE_LABEL_SELECTOR;

/// Key of the kubeconfig in the shoot access secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

fn prometheus_rule_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "monitoring.coreos.com",
        "v1",
        "PrometheusRule",
    ))
}

fn scrape_config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "monitoring.coreos.com",
        "v1alpha1",
        "ScrapeConfig",
    ))
}

/// Operations against the seed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SeedClient: Send + Sync {
    /// Get the cluster-scoped Cluster object for an extension namespace
    async fn get_cluster(&self, name: &str) -> Result<Cluster>;

    /// Get a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Merge-patch the status of an Extension
    async fn patch_extension_status(&self, namespace: &str, name: &str, status: Value)
        -> Result<()>;

    /// Add the controller finalizer to an Extension
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove the controller finalizer from an Extension
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Drop the operation annotation after a migrate/restore
    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<()>;

    /// Apply dashboards, alerting rules and scrape config
    async fn apply_monitoring(&self, namespace: &str, objects: MonitoringObjects) -> Result<()>;

    /// Remove everything [`SeedClient::apply_monitoring`] created
    async fn delete_monitoring(&self, namespace: &str) -> Result<()>;
}

/// Operations against a shoot cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShootClient: Send + Sync {
    /// List the cache services in the shoot's system namespace
    async fn list_cache_services(&self) -> Result<Vec<Service>>;
}

/// Builds shoot clients for an extension namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShootClientFactory: Send + Sync {
    /// Client for the shoot served from `namespace`
    async fn shoot_client(&self, namespace: &str) -> Result<Arc<dyn ShootClient>>;
}

/// [`SeedClient`] backed by the seed API server
pub struct KubeSeedClient {
    client: Client,
}

impl KubeSeedClient {
    /// Create a seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn extensions(&self, namespace: &str) -> Api<Extension> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        modify: impl FnOnce(&mut Vec<String>) + Send,
    ) -> Result<()> {
        let api = self.extensions(namespace);
        let ext = api.get(name).await?;
        let mut finalizers = ext.finalizers().to_vec();
        let before = finalizers.clone();
        modify(&mut finalizers);
        if finalizers == before {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": ext.resource_version(),
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SeedClient for KubeSeedClient {
    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.extensions(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        self.patch_finalizers(namespace, name, |f| {
            if !f.iter().any(|x| x == FINALIZER) {
                f.push(FINALIZER.to_string());
            }
        })
        .await
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .patch_finalizers(namespace, name, |f| f.retain(|x| x != FINALIZER))
            .await
        {
            Err(registry_cache_common::Error::Kube { source }) if is_not_found(&source) => Ok(()),
            other => other,
        }
    }

    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { OPERATION_ANNOTATION: null } }
        });
        self.extensions(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_monitoring(&self, namespace: &str, objects: MonitoringObjects) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut batch = ApplyBatch::new(self.client.clone(), namespace, &params);
        batch.push(
            DASHBOARD_NAME,
            &objects.dashboard,
            &ApiResource::erase::<ConfigMap>(&()),
        )?;
        batch.push_json(
            PROMETHEUS_RULE_NAME,
            objects.prometheus_rule,
            &prometheus_rule_resource(),
        );
        batch.push_json(
            SCRAPE_CONFIG_NAME,
            objects.scrape_config,
            &scrape_config_resource(),
        );
        let count = batch.run("monitoring").await?;
        debug!(namespace, count, "applied monitoring configuration");
        Ok(())
    }

    async fn delete_monitoring(&self, namespace: &str) -> Result<()> {
        delete_ignore_not_found(
            self.client.clone(),
            namespace,
            DASHBOARD_NAME,
            &ApiResource::erase::<ConfigMap>(&()),
        )
        .await?;
        delete_ignore_not_found(
            self.client.clone(),
            namespace,
            PROMETHEUS_RULE_NAME,
            &prometheus_rule_resource(),
        )
        .await?;
        delete_ignore_not_found(
            self.client.clone(),
            namespace,
            SCRAPE_CONFIG_NAME,
            &scrape_config_resource(),
        )
        .await
    }
}

/// [`ShootClient`] backed by a shoot API server
pub struct KubeShootClient {
    client: Client,
}

#[async_trait]
impl ShootClient for KubeShootClient {
    async fn list_cache_services(&self) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), SHOOT_SYSTEM_NAMESPACE);
        let list = api
            .list(&ListParams::default().labels(SERVICE_LABEL_SELECTOR))
            .await?;
        Ok(list.items)
    }
}

/// Builds shoot clients from the `gardener` access secret
pub struct KubeShootClientFactory {
    seed: Client,
}

impl KubeShootClientFactory {
    /// Create a factory reading access secrets through the seed client
    pub fn new(seed: Client) -> Self {
        Self { seed }
    }
}

#[async_trait]
impl ShootClientFactory for KubeShootClientFactory {
    async fn shoot_client(&self, namespace: &str) -> Result<Arc<dyn ShootClient>> {
        let kubeconfig =
            get_secret_data(&self.seed, SHOOT_ACCESS_SECRET_NAME, namespace, KUBECONFIG_KEY)
                .await?;
        let client = client_from_kubeconfig(&kubeconfig).await?;
        Ok(Arc::new(KubeShootClient { client }))
    }
}
