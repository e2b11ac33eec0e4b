//! API reads the webhooks depend on
//!
//! Both webhooks read objects directly from the API server rather than
//! through informer caches; the traits keep the handlers testable.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use registry_cache_common::gardener::{Cluster, Extension};

use crate::error::WebhookError;

/// Secret lookups in the garden cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Get a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, WebhookError>;
}

/// Seed-side lookups of the OSC mutator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SeedReader: Send + Sync {
    /// Get an Extension by namespace and name
    async fn get_extension(&self, namespace: &str, name: &str) -> Result<Option<Extension>, WebhookError>;

    /// Get the Cluster object named after a shoot namespace
    async fn get_cluster(&self, name: &str) -> Result<Cluster, WebhookError>;

    /// Get a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, WebhookError>;
}

/// [`SecretReader`] and [`SeedReader`] backed by a client
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
}

impl KubeReader {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, WebhookError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl SecretReader for KubeReader {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, WebhookError> {
        self.secret(namespace, name).await
    }
}

#[async_trait]
impl SeedReader for KubeReader {
    async fn get_extension(&self, namespace: &str, name: &str) -> Result<Option<Extension>, WebhookError> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster(&self, name: &str) -> Result<Cluster, WebhookError> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        api.get_opt(name).await?.ok_or_else(|| WebhookError::NotFound {
            kind: "Cluster",
            name: name.to_string(),
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, WebhookError> {
        self.secret(namespace, name).await
    }
}
