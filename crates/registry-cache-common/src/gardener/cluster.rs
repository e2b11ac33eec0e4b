use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Shoot;
use crate::Error;

/// Cluster resource written by the host platform for every shoot
///
/// It is cluster-scoped and named after the shoot's seed namespace. The
/// embedded manifests are raw; only the shoot is decoded here.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "Cluster")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Raw Shoot manifest
    #[serde(default)]
    pub shoot: serde_json::Value,

    /// Raw Seed manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<serde_json::Value>,

    /// Raw CloudProfile manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_profile: Option<serde_json::Value>,
}

impl Cluster {
    /// Decode the embedded shoot manifest
    pub fn shoot(&self) -> Result<Shoot, Error> {
        serde_json::from_value(self.spec.shoot.clone())
            .map_err(|e| Error::serialization_for_kind("Shoot", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shoot_is_decoded_from_cluster() {
        let cluster = Cluster::new(
            "shoot--foo--bar",
            ClusterSpec {
                shoot: serde_json::json!({
                    "metadata": {"name": "bar", "namespace": "garden-foo"},
                    "spec": {"hibernation": {"enabled": true}}
                }),
                ..Default::default()
            },
        );
        let shoot = cluster.shoot().unwrap();
        assert_eq!(shoot.metadata.name.as_deref(), Some("bar"));
        assert!(shoot.is_hibernated());
    }

    #[test]
    fn malformed_shoot_is_a_serialization_error() {
        let cluster = Cluster::new(
            "shoot--foo--bar",
            ClusterSpec {
                shoot: serde_json::json!({"spec": {"extensions": "nope"}}),
                ..Default::default()
            },
        );
        assert!(matches!(
            cluster.shoot(),
            Err(Error::Serialization { .. })
        ));
    }
}
