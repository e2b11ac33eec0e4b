use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of an Extension resource
///
/// One Extension exists per shoot in the shoot's seed namespace. The
/// provider config is opaque here and decoded by the API crate.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Extension",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Extension type, e.g. "registry-cache"
    #[serde(rename = "type")]
    pub type_: String,

    /// Optional extension class for sharding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Raw provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
}

/// Observed state of an Extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Provider-specific status (a RegistryStatus for this extension)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    /// Last operation performed on the extension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Last error, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Generation last processed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Kind of lifecycle operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationType {
    /// First reconcile
    Create,
    /// Subsequent reconciles
    Reconcile,
    /// Deletion
    Delete,
    /// Migration away from this seed
    Migrate,
    /// Restoration on a new seed
    Restore,
}

/// State of the last operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// In progress
    Processing,
    /// Completed successfully
    Succeeded,
    /// Failed, will be retried
    Error,
}

/// Last operation record written to the Extension status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    /// Operation state
    pub state: LastOperationState,
    /// Human readable description
    pub description: String,
    /// RFC 3339 timestamp
    pub last_update_time: String,
    /// Progress in percent
    pub progress: i32,
}

/// Last error record written to the Extension status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Error message
    pub description: String,
    /// Machine readable error codes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    /// RFC 3339 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl Extension {
    /// Decode the raw provider status, if present
    pub fn provider_status(&self) -> Option<&serde_json::Value> {
        self.status.as_ref().and_then(|s| s.provider_status.as_ref())
    }

    /// The operation requested via annotation, if any
    pub fn requested_operation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::OPERATION_ANNOTATION))
            .map(String::as_str)
    }

    /// Whether the extension is being deleted
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the controller's finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
