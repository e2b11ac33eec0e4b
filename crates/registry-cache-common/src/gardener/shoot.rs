use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{EXTENSION_TYPE, FORCE_DELETION_ANNOTATION};

/// Container runtime name required on every worker pool
pub const CRI_CONTAINERD: &str = "containerd";

/// CA rotation phase: new CA is being introduced
pub const CA_ROTATION_PREPARING: &str = "Preparing";
/// CA rotation phase: new CA is trusted everywhere
pub const CA_ROTATION_PREPARED: &str = "Prepared";
/// CA rotation phase: old CA is being removed
pub const CA_ROTATION_COMPLETING: &str = "Completing";
/// CA rotation phase: rotation finished
pub const CA_ROTATION_COMPLETED: &str = "Completed";

/// Subset of a Shoot (`core.gardener.cloud/v1beta1`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default)]
    pub spec: ShootSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ShootStatus>,
}

/// Shoot specification subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Extensions enabled for the shoot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ShootExtension>,
    /// Hibernation settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hibernation: Option<Hibernation>,
    /// Infrastructure provider settings
    #[serde(default)]
    pub provider: ShootProvider,
    /// Resources referenced by extensions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<NamedResourceReference>,
    /// Kubernetes settings
    #[serde(default)]
    pub kubernetes: ShootKubernetes,
}

/// One extension block in the shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootExtension {
    /// Extension type
    #[serde(rename = "type")]
    pub type_: String,
    /// Raw provider config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
    /// Explicitly disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// Hibernation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hibernation {
    /// Whether the shoot should be hibernated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Provider settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootProvider {
    /// Worker pools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<Worker>,
}

/// A worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Pool name
    #[serde(default)]
    pub name: String,
    /// Container runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cri: Option<WorkerCri>,
}

/// Container runtime of a worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCri {
    /// Runtime name
    pub name: String,
}

/// Named reference to a resource in the shoot's project namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedResourceReference {
    /// Name used by extensions to refer to the resource
    pub name: String,
    /// The referenced object
    pub resource_ref: CrossVersionObjectReference,
}

/// Reference to an object of any kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    /// Kind of the object
    pub kind: String,
    /// Name of the object
    pub name: String,
    /// API version of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Kubernetes settings subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootKubernetes {
    /// VPA settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_pod_autoscaler: Option<VerticalPodAutoscaler>,
}

/// VPA settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscaler {
    /// Whether VPA is deployed into the shoot
    #[serde(default)]
    pub enabled: bool,
}

/// Shoot status subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Technical ID (the seed namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_id: Option<String>,
    /// Credentials rotation state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ShootCredentials>,
}

/// Credentials status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootCredentials {
    /// Rotation status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<ShootCredentialsRotation>,
}

/// Rotation status per credential kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootCredentialsRotation {
    /// CA rotation status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authorities: Option<CaRotation>,
}

/// CA rotation status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaRotation {
    /// Rotation phase
    #[serde(default)]
    pub phase: String,
    /// When the current rotation was initiated (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_initiation_time: Option<String>,
}

impl Shoot {
    /// Whether hibernation is enabled
    pub fn is_hibernated(&self) -> bool {
        self.spec
            .hibernation
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(false)
    }

    /// Whether the shoot is being deleted
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether deletion was confirmed as forceful
    pub fn is_force_deletion(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FORCE_DELETION_ANNOTATION))
            .is_some_and(|v| v == "true")
    }

    /// Whether VPA runs in the shoot
    pub fn is_vpa_enabled(&self) -> bool {
        self.spec
            .kubernetes
            .vertical_pod_autoscaler
            .as_ref()
            .is_some_and(|v| v.enabled)
    }

    /// Index and block of the enabled registry-cache extension, if any
    pub fn registry_cache_extension(&self) -> Option<(usize, &ShootExtension)> {
        self.spec
            .extensions
            .iter()
            .enumerate()
            .find(|(_, e)| e.type_ == EXTENSION_TYPE && e.disabled != Some(true))
    }

    /// Look up a named resource reference
    pub fn find_resource(&self, name: &str) -> Option<&NamedResourceReference> {
        self.spec.resources.iter().find(|r| r.name == name)
    }

    /// Current CA rotation status
    pub fn ca_rotation(&self) -> Option<&CaRotation> {
        self.status
            .as_ref()
            .and_then(|s| s.credentials.as_ref())
            .and_then(|c| c.rotation.as_ref())
            .and_then(|r| r.certificate_authorities.as_ref())
    }

    /// Namespace of the shoot in the garden cluster
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}
