use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set once all objects were applied
pub const CONDITION_RESOURCES_APPLIED: &str = "ResourcesApplied";
/// Condition type set once all applied objects are healthy
pub const CONDITION_RESOURCES_HEALTHY: &str = "ResourcesHealthy";

/// A bundle of objects the host platform applies into the shoot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resources.gardener.cloud",
    version = "v1alpha1",
    kind = "ManagedResource",
    namespaced,
    status = "ManagedResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Secrets holding the serialized objects
    #[serde(default)]
    pub secret_refs: Vec<LocalObjectReference>,

    /// Labels injected into every delivered object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject_labels: Option<BTreeMap<String, String>>,

    /// Leave delivered objects in place when the bundle is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,

    /// Delete PVCs created from StatefulSet templates on removal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_persistent_volume_claims: Option<bool>,

    /// Resource class; unset targets the shoot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

/// Observed state of a ManagedResource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    /// Conditions reported by the delivery layer
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation last processed by the delivery layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine readable reason
    #[serde(default)]
    pub reason: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
}

impl ManagedResource {
    /// Check the delivery layer reports the bundle applied and healthy.
    ///
    /// Returns a description of the first unmet requirement.
    pub fn check_health(&self) -> Result<(), String> {
        let status = self
            .status
            .as_ref()
            .ok_or_else(|| "managed resource has no status yet".to_string())?;

        let generation = self.metadata.generation;
        if generation.is_some() && status.observed_generation != generation {
            return Err(format!(
                "observed generation outdated ({:?}/{:?})",
                status.observed_generation, generation
            ));
        }

        for type_ in [CONDITION_RESOURCES_APPLIED, CONDITION_RESOURCES_HEALTHY] {
            match status.conditions.iter().find(|c| c.type_ == type_) {
                Some(c) if c.status == "True" => {}
                Some(c) => {
                    return Err(format!(
                        "condition {} has status {}: {}",
                        type_, c.status, c.message
                    ))
                }
                None => return Err(format!("condition {} is missing", type_)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mr_with(generation: i64, observed: i64, conditions: &[(&str, &str)]) -> ManagedResource {
        let mut mr = ManagedResource::new("extension-registry-cache", ManagedResourceSpec::default());
        mr.metadata.generation = Some(generation);
        mr.status = Some(ManagedResourceStatus {
            observed_generation: Some(observed),
            conditions: conditions
                .iter()
                .map(|(t, s)| Condition {
                    type_: t.to_string(),
                    status: s.to_string(),
                    ..Default::default()
                })
                .collect(),
        });
        mr
    }

    #[test]
    fn healthy_when_applied_and_healthy_for_current_generation() {
        let mr = mr_with(
            2,
            2,
            &[(CONDITION_RESOURCES_APPLIED, "True"), (CONDITION_RESOURCES_HEALTHY, "True")],
        );
        assert!(mr.check_health().is_ok());
    }

    #[test]
    fn unhealthy_when_generation_is_stale() {
        let mr = mr_with(
            3,
            2,
            &[(CONDITION_RESOURCES_APPLIED, "True"), (CONDITION_RESOURCES_HEALTHY, "True")],
        );
        assert!(mr.check_health().unwrap_err().contains("generation"));
    }

    #[test]
    fn unhealthy_when_condition_false_or_missing() {
        let mr = mr_with(
            1,
            1,
            &[(CONDITION_RESOURCES_APPLIED, "True"), (CONDITION_RESOURCES_HEALTHY, "False")],
        );
        assert!(mr.check_health().unwrap_err().contains("ResourcesHealthy"));

        let mr = mr_with(1, 1, &[(CONDITION_RESOURCES_APPLIED, "True")]);
        assert!(mr.check_health().unwrap_err().contains("missing"));

        let bare = ManagedResource::new("x", ManagedResourceSpec::default());
        assert!(bare.check_health().is_err());
    }
}
