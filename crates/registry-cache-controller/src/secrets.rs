//! Secrets manager for the cache CA and per-cache server certificates
//!
//! Secrets live in the extension namespace and are identified by labels.
//! The CA is persisted across reconciles and rotated with the shoot's CA
//! rotation phase; server certificates are reissued whenever their inputs
//! change. Each run records the secrets it touched so that [`SecretsManager::cleanup`]
//! can reclaim everything else.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use registry_cache_common::gardener::{CaRotation, CA_ROTATION_PREPARED, CA_ROTATION_PREPARING};
use registry_cache_common::kube_utils::{is_not_found, short_checksum};
use registry_cache_common::{Error, Result, FIELD_MANAGER};

use crate::pki::{CertificateAuthority, CertificateInfo, CA_VALIDITY_DAYS, SERVER_CERT_VALIDITY_DAYS};

/// Base name of the cache CA
pub const CA_NAME: &str = "ca-extension-registry-cache";

/// Base name of the published CA bundle
pub const CA_BUNDLE_NAME: &str = "ca-extension-registry-cache-bundle";

/// Key of the bundle in the CA bundle secret
pub const BUNDLE_KEY: &str = "bundle.crt";

/// CA certificate key
pub const CA_CERT_KEY: &str = "ca.crt";

/// CA private key
pub const CA_KEY_KEY: &str = "ca.key";

/// Server certificate key
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Server private key
pub const TLS_KEY_KEY: &str = "tls.key";

const LABEL_MANAGED_BY: &str = "managed-by";
const LABEL_MANAGER_IDENTITY: &str = "manager-identity";
const LABEL_NAME: &str = "name";
const LABEL_CHECKSUM: &str = "checksum-of-config";
const LABEL_PERSIST: &str = "persist";
const LABEL_ISSUED_AT: &str = "issued-at-time";
const LABEL_AUTO_RENEWED: &str = "auto-renewed";

const MANAGED_BY: &str = "secrets-manager";
const MANAGER_IDENTITY: &str = "extension-registry-cache";

/// Label selector matching every secret owned by this manager
pub fn managed_selector() -> String {
    format!(
        "{}={},{}={}",
        LABEL_MANAGED_BY, MANAGED_BY, LABEL_MANAGER_IDENTITY, MANAGER_IDENTITY
    )
}

/// Storage for managed secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// List all secrets owned by the manager in `namespace`
    async fn list_managed(&self, namespace: &str) -> Result<Vec<Secret>>;

    /// Create or update a secret
    async fn apply(&self, namespace: &str, secret: Secret) -> Result<()>;

    /// Delete a secret, ignoring absence
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`SecretStore`] backed by the seed API server
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store for the seed
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn list_managed(&self, namespace: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(&managed_selector()))
            .await?;
        Ok(list.items)
    }

    async fn apply(&self, namespace: &str, secret: Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Server certificate and key for one cache
#[derive(Clone, Debug, PartialEq)]
pub struct ServerCertificate {
    /// Name of the secret holding the pair
    pub secret_name: String,
    /// PEM certificate
    pub cert_pem: String,
    /// PEM private key
    pub key_pem: String,
}

#[derive(Clone, Debug)]
struct StoredCa {
    name: String,
    issued_at: i64,
    auto_renewed: bool,
    ca: CertificateAuthority,
    info: CertificateInfo,
}

fn label<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
    secret.labels().get(key).map(String::as_str)
}

fn data_str(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}

fn to_data(entries: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

fn managed_labels(base: &str, checksum: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_MANAGER_IDENTITY.to_string(), MANAGER_IDENTITY.to_string()),
        (LABEL_NAME.to_string(), base.to_string()),
        (LABEL_CHECKSUM.to_string(), checksum.to_string()),
    ])
}

fn secret(
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn parse_stored_ca(secret: &Secret) -> Option<StoredCa> {
    let issued_at = label(secret, LABEL_ISSUED_AT)?.parse().ok()?;
    let cert = data_str(secret, CA_CERT_KEY)?;
    let key = data_str(secret, CA_KEY_KEY)?;
    let ca = CertificateAuthority::from_pem(&cert, &key).ok()?;
    let info = ca.cert_info().ok()?;
    Some(StoredCa {
        name: secret.name_any(),
        issued_at,
        auto_renewed: label(secret, LABEL_AUTO_RENEWED) == Some("true"),
        ca,
        info,
    })
}

/// One run of the secrets manager for an extension namespace
pub struct SecretsManager<'a> {
    store: &'a dyn SecretStore,
    namespace: String,
    now: DateTime<Utc>,
    existing: Vec<Secret>,
    used: BTreeSet<String>,
    current_ca: Option<StoredCa>,
}

impl<'a> SecretsManager<'a> {
    /// Load the managed secrets currently present in `namespace`
    pub async fn load(
        store: &'a dyn SecretStore,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<SecretsManager<'a>> {
        let existing = store.list_managed(namespace).await?;
        debug!(namespace, count = existing.len(), "loaded managed secrets");
        Ok(Self {
            store,
            namespace: namespace.to_string(),
            now,
            existing,
            used: BTreeSet::new(),
            current_ca: None,
        })
    }

    fn stored_cas(&self) -> Vec<StoredCa> {
        let mut cas: Vec<StoredCa> = self
            .existing
            .iter()
            .filter(|s| label(s, LABEL_NAME) == Some(CA_NAME))
            .filter_map(parse_stored_ca)
            .collect();
        cas.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(a.name.cmp(&b.name)));
        cas
    }

    /// Seed for a new CA, `None` if the current one stays
    fn renewal_seed(
        &self,
        current: Option<&StoredCa>,
        rotation: Option<&CaRotation>,
    ) -> Option<(String, bool)> {
        let Some(current) = current else {
            return Some(("initial".to_string(), false));
        };

        if let Some(rotation) = rotation {
            if rotation.phase == CA_ROTATION_PREPARING {
                let initiated = rotation
                    .last_initiation_time
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
                if let Some(initiated) = initiated {
                    if initiated.timestamp() > current.issued_at {
                        return Some((initiated.to_rfc3339(), false));
                    }
                }
            }
        }

        if current.info.needs_rotation_at(self.now.timestamp()) {
            return Some((format!("renew:{}", current.issued_at), true));
        }
        None
    }

    /// Ensure the CA exists and is rotated; returns the CA bundle secret name
    pub async fn ensure_ca(&mut self, rotation: Option<&CaRotation>) -> Result<String> {
        let mut cas = self.stored_cas();

        if let Some((seed, auto_renewed)) = self.renewal_seed(cas.first(), rotation) {
            let checksum =
                short_checksum(format!("{}|{}|{}", CA_NAME, CA_VALIDITY_DAYS, seed).as_bytes());
            let name = format!("{}-{}", CA_NAME, checksum);
            let ca = CertificateAuthority::new(CA_NAME)?;
            let info = ca.cert_info()?;
            let issued_at = self.now.timestamp();

            let mut labels = managed_labels(CA_NAME, &checksum);
            labels.insert(LABEL_PERSIST.to_string(), "true".to_string());
            labels.insert(LABEL_ISSUED_AT.to_string(), issued_at.to_string());
            if auto_renewed {
                labels.insert(LABEL_AUTO_RENEWED.to_string(), "true".to_string());
            }
            let data = to_data(&[(CA_CERT_KEY, ca.ca_cert_pem()), (CA_KEY_KEY, ca.ca_key_pem())]);
            self.store
                .apply(&self.namespace, secret(&self.namespace, &name, labels, data))
                .await?;
            info!(namespace = %self.namespace, ca = %name, auto_renewed, "generated new CA");

            cas.insert(
                0,
                StoredCa {
                    name,
                    issued_at,
                    auto_renewed,
                    ca,
                    info,
                },
            );
        }

        let (current, old) = cas
            .split_first()
            .ok_or_else(|| Error::internal("no CA after generation"))?;
        let in_rotation = rotation.is_some_and(|r| {
            r.phase == CA_ROTATION_PREPARING || r.phase == CA_ROTATION_PREPARED
        });
        let now = self.now.timestamp();
        let kept: Vec<&StoredCa> = old
            .iter()
            .filter(|ca| in_rotation || (current.auto_renewed && !ca.info.is_expired_at(now)))
            .collect();

        self.used.insert(current.name.clone());
        let mut bundle = current.ca.ca_cert_pem().to_string();
        for ca in &kept {
            self.used.insert(ca.name.clone());
            bundle.push_str(ca.ca.ca_cert_pem());
        }

        let checksum = short_checksum(bundle.as_bytes());
        let bundle_name = format!("{}-{}", CA_BUNDLE_NAME, checksum);
        self.store
            .apply(
                &self.namespace,
                secret(
                    &self.namespace,
                    &bundle_name,
                    managed_labels(CA_BUNDLE_NAME, &checksum),
                    to_data(&[(BUNDLE_KEY, &bundle)]),
                ),
            )
            .await?;
        self.used.insert(bundle_name.clone());
        self.current_ca = Some(current.clone());
        Ok(bundle_name)
    }

    /// Get or issue the server certificate `<base>-<checksum>` signed by the current CA
    pub async fn server_certificate(
        &mut self,
        base: &str,
        common_name: &str,
        ips: &[IpAddr],
    ) -> Result<ServerCertificate> {
        let ca = self
            .current_ca
            .as_ref()
            .ok_or_else(|| Error::internal("server certificate requested before CA"))?;

        let ip_list: Vec<String> = ips.iter().map(IpAddr::to_string).collect();
        let checksum = short_checksum(
            format!(
                "{}|{}|{}|{}",
                common_name,
                ip_list.join(","),
                ca.name,
                SERVER_CERT_VALIDITY_DAYS
            )
            .as_bytes(),
        );
        let name = format!("{}-{}", base, checksum);
        self.used.insert(name.clone());

        let now = self.now.timestamp();
        let reusable = self
            .existing
            .iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| Some((data_str(s, TLS_CERT_KEY)?, data_str(s, TLS_KEY_KEY)?)))
            .filter(|(cert, _)| {
                CertificateInfo::from_pem(cert).is_ok_and(|info| !info.needs_rotation_at(now))
            });
        if let Some((cert_pem, key_pem)) = reusable {
            return Ok(ServerCertificate {
                secret_name: name,
                cert_pem,
                key_pem,
            });
        }

        let (cert_pem, key_pem) = ca.ca.generate_server_cert(common_name, ips)?;
        self.store
            .apply(
                &self.namespace,
                secret(
                    &self.namespace,
                    &name,
                    managed_labels(base, &checksum),
                    to_data(&[(TLS_CERT_KEY, &cert_pem), (TLS_KEY_KEY, &key_pem)]),
                ),
            )
            .await?;
        info!(namespace = %self.namespace, secret = %name, "issued server certificate");
        Ok(ServerCertificate {
            secret_name: name,
            cert_pem,
            key_pem,
        })
    }

    /// Delete managed secrets not touched during this run
    pub async fn cleanup(&self) -> Result<()> {
        for secret in &self.existing {
            let name = secret.name_any();
            if !self.used.contains(&name) {
                debug!(namespace = %self.namespace, secret = %name, "deleting unused managed secret");
                self.store.delete(&self.namespace, &name).await?;
            }
        }
        Ok(())
    }
}

/// Delete every managed secret in `namespace`
pub async fn purge(store: &dyn SecretStore, namespace: &str) -> Result<()> {
    for secret in store.list_managed(namespace).await? {
        store.delete(namespace, &secret.name_any()).await?;
    }
    info!(namespace, "purged managed secrets");
    Ok(())
}
