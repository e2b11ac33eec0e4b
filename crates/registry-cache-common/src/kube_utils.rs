//! Shared Kubernetes utilities using kube-rs

use std::fmt::Write as _;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, trace};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` elapses.
///
/// Errors from `check_fn` are treated as "not yet" and polling continues.
/// The last error (if any) is reported in the timeout error.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let operation = operation.into();
    let mut last_error: Option<String> = None;

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation = %operation, "condition not yet met"),
            Err(e) => {
                trace!(operation = %operation, error = %e, "poll check failed, retrying");
                last_error = Some(e.to_string());
            }
        }

        if start.elapsed() + poll_interval > timeout {
            let message = last_error.unwrap_or_else(|| format!("not done after {:?}", timeout));
            return Err(Error::timeout(operation, message));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Hex-encoded SHA-256 of `input`
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and can be
/// persisted in object names and labels.
pub fn deterministic_hash(input: &str) -> String {
    let mut hex = sha256_hex(input.as_bytes());
    hex.truncate(16);
    hex
}

/// Eight hex characters of SHA-256 over `data`, used for content-addressed names
pub fn short_checksum(data: &[u8]) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(8);
    hex
}

/// True if the error is a Kubernetes 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Build a client from raw kubeconfig bytes with default timeouts
pub async fn client_from_kubeconfig(raw: &[u8]) -> Result<Client, Error> {
    let text = std::str::from_utf8(raw).map_err(|e| {
        Error::internal_with_context("client_from_kubeconfig", format!("kubeconfig is not UTF-8: {}", e))
    })?;
    let kubeconfig = Kubeconfig::from_yaml(text).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to parse kubeconfig: {}", e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "client_from_kubeconfig",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to create client: {}", e),
        )
    })
}

/// Build the in-cluster (or local kubeconfig) client with default timeouts
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Get a secret data value
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Vec<u8>, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(name).await?;

    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .ok_or_else(|| {
            Error::internal_with_context(
                "get_secret_data",
                format!("secret {}/{} missing key {}", namespace, name, key),
            )
        })
}

/// Delete a namespaced object, treating 404 as success
pub async fn delete_ignore_not_found(
    client: Client,
    namespace: &str,
    name: &str,
    ar: &ApiResource,
) -> Result<(), Error> {
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, ar);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(name = %name, kind = %ar.kind, "deleted object");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

type ApplyFuture = std::pin::Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// Collects server-side-apply operations and runs them in parallel.
///
/// Objects are applied as `DynamicObject` with an explicit `ApiResource`.
/// For native types use `ApiResource::erase::<T>(&())`.
pub struct ApplyBatch<'a> {
    client: Client,
    futures: Vec<ApplyFuture>,
    namespace: &'a str,
    params: &'a PatchParams,
}

impl<'a> ApplyBatch<'a> {
    /// Create a new batch targeting `namespace` with the given `PatchParams`.
    pub fn new(client: Client, namespace: &'a str, params: &'a PatchParams) -> Self {
        Self {
            client,
            futures: Vec::new(),
            namespace,
            params,
        }
    }

    /// Serialize a typed resource and queue a server-side-apply patch.
    pub fn push(
        &mut self,
        name: &str,
        resource: &impl serde::Serialize,
        ar: &ApiResource,
    ) -> Result<(), Error> {
        let json = serde_json::to_value(resource)
            .map_err(|e| Error::serialization_for_kind(ar.kind.clone(), e.to_string()))?;
        self.push_json(name, json, ar);
        Ok(())
    }

    /// Queue a server-side-apply patch from raw JSON.
    ///
    /// `apiVersion` and `kind` are taken from the `ApiResource`.
    pub fn push_json(&mut self, name: &str, mut json: serde_json::Value, ar: &ApiResource) {
        if let Some(obj) = json.as_object_mut() {
            obj.insert(
                "apiVersion".to_string(),
                serde_json::Value::String(ar.api_version.clone()),
            );
            obj.insert("kind".to_string(), serde_json::Value::String(ar.kind.clone()));
        }

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), self.namespace, ar);
        let params = self.params.clone();
        let name = name.to_string();
        let kind = ar.kind.clone();
        self.futures.push(Box::pin(async move {
            debug!(name = %name, kind = %kind, "applying resource");
            api.patch(&name, &params, &Patch::Apply(&json)).await?;
            Ok(())
        }));
    }

    /// Execute all queued patches in parallel, returning the count applied.
    pub async fn run(self, layer: &str) -> Result<usize, Error> {
        use futures::future::join_all;

        let count = self.futures.len();
        if count == 0 {
            return Ok(0);
        }

        debug!(count, layer, "applying resources in parallel");
        let results = join_all(self.futures).await;

        let mut errors: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errors.is_empty() {
            for (i, err) in errors.iter().enumerate() {
                tracing::error!(error = %err, index = i, layer, "resource application failed");
            }
            return Err(errors.swap_remove(0));
        }

        Ok(count)
    }
}
