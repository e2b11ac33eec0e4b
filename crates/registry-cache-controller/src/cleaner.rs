//! Removal of containerd registry configuration from nodes
//!
//! Nodes outlive cache configuration, so stale `hosts.toml` directories have
//! to be removed actively. A DaemonSet whose init container deletes them
//! (and optionally the configuring unit) is shipped, waited on and torn down
//! again.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use minijinja::{context, Environment, UndefinedBehavior};
use tracing::{info, instrument};

use registry_cache_common::gardener::{CONFIGURE_UNIT_NAME, CONTAINERD_CERTS_DIR};
use registry_cache_common::{Error, Result, SHOOT_SYSTEM_NAMESPACE};

use crate::managed_resources::{
    destroy, BundleOptions, ManagedResourceClient, ObjectRegistry, CLEANER_BUNDLE,
};

const CLEANER_SCRIPT: &str = include_str!("../templates/cleaner.sh.j2");

/// Name of the cleaner DaemonSet
pub const CLEANER_NAME: &str = "registry-configuration-cleaner";

/// Deadline for the cleaner to run on every node
pub const CLEANER_HEALTH_TIMEOUT: Duration = Duration::from_secs(180);

/// Deadline for the cleaner to be removed again
pub const CLEANER_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

const HOST_ROOT_VOLUME: &str = "host-root-volume";

/// Images used by the cleaner
#[derive(Clone, Debug, PartialEq)]
pub struct CleanerImages {
    /// Shell image running the removal
    pub cleaner: String,
    /// Image parking the pod afterwards
    pub pause: String,
}

/// Render the removal script
pub fn render_script(delete_unit: bool, upstreams: &[String]) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("cleaner", CLEANER_SCRIPT)
        .map_err(|e| Error::internal_with_context("cleaner", e.to_string()))?;
    env.get_template("cleaner")
        .and_then(|t| {
            t.render(context! {
                upstreams => upstreams,
                certs_dir => CONTAINERD_CERTS_DIR,
                delete_unit => delete_unit,
                unit => CONFIGURE_UNIT_NAME,
            })
        })
        .map_err(|e| Error::internal_with_context("cleaner", e.to_string()))
}

/// The cleaner DaemonSet
pub fn daemon_set(images: &CleanerImages, script: String) -> DaemonSet {
    let labels = BTreeMap::from([("app".to_string(), CLEANER_NAME.to_string())]);
    let small = ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("10m".to_string())),
            ("memory".to_string(), Quantity("16Mi".to_string())),
        ])),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(CLEANER_NAME.to_string()),
            namespace: Some(SHOOT_SYSTEM_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    host_pid: Some(true),
                    priority_class_name: Some("system-node-critical".to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    init_containers: Some(vec![Container {
                        name: "cleaner".to_string(),
                        image: Some(images.cleaner.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        resources: Some(small.clone()),
                        volume_mounts: Some(vec![VolumeMount {
                            name: HOST_ROOT_VOLUME.to_string(),
                            mount_path: "/host".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "pause".to_string(),
                        image: Some(images.pause.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        resources: Some(small),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: HOST_ROOT_VOLUME.to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Remove the configuration of `upstreams` from every node of the shoot
#[instrument(skip(managed_resources, images, upstreams))]
pub async fn clean(
    managed_resources: &dyn ManagedResourceClient,
    namespace: &str,
    images: &CleanerImages,
    delete_unit: bool,
    upstreams: &[String],
) -> Result<()> {
    if upstreams.is_empty() {
        return Err(Error::internal_with_context(
            "cleaner",
            "at least one upstream is required",
        ));
    }

    let mut objects = ObjectRegistry::new();
    objects.add(&daemon_set(images, render_script(delete_unit, upstreams)?))?;

    info!(?upstreams, delete_unit, "removing containerd configuration from nodes");
    managed_resources
        .deploy(namespace, CLEANER_BUNDLE, objects, BundleOptions::for_shoot())
        .await?;
    managed_resources
        .wait_until_healthy(namespace, CLEANER_BUNDLE, CLEANER_HEALTH_TIMEOUT)
        .await?;
    destroy(managed_resources, namespace, CLEANER_BUNDLE, CLEANER_DELETE_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_resources::MockManagedResourceClient;
    use std::sync::{Arc, Mutex};

    fn images() -> CleanerImages {
        CleanerImages {
            cleaner: "alpine:3.20".to_string(),
            pause: "registry.k8s.io/pause:3.10".to_string(),
        }
    }

    #[test]
    fn script_removes_each_upstream() {
        let upstreams = ["ghcr.io".to_string(), "my-registry.io:5000".to_string()];
        let script = render_script(false, &upstreams).unwrap();
        assert!(script.contains(r#"rm -rf "/host/etc/containerd/certs.d/ghcr.io""#));
        assert!(script.contains(r#"rm -rf "/host/etc/containerd/certs.d/my-registry.io:5000""#));
        assert!(!script.contains("systemctl"));
    }

    #[test]
    fn script_optionally_removes_unit() {
        let script = render_script(true, &["docker.io".to_string()]).unwrap();
        assert!(script.contains("systemctl disable configure-containerd-registries.service"));
        assert!(script.contains("rm -f \"/host/etc/systemd/system/configure-containerd-registries.service\""));
    }

    #[test]
    fn daemon_set_runs_on_every_node_with_host_root() {
        let ds = daemon_set(&images(), "true".to_string());
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_pid, Some(true));
        assert_eq!(pod.tolerations.unwrap()[0].operator.as_deref(), Some("Exists"));
        assert_eq!(pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path, "/");
        assert_eq!(pod.init_containers.unwrap()[0].image.as_deref(), Some("alpine:3.20"));
        assert_eq!(pod.containers[0].name, "pause");
    }

    #[tokio::test]
    async fn deploys_waits_and_removes_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut mr = MockManagedResourceClient::new();

        let c = calls.clone();
        mr.expect_deploy().returning(move |_, name, objects, _| {
            assert!(objects.find("DaemonSet", CLEANER_NAME).is_some());
            c.lock().unwrap().push(format!("deploy {}", name));
            Ok(())
        });
        let c = calls.clone();
        mr.expect_wait_until_healthy().returning(move |_, _, timeout| {
            c.lock().unwrap().push(format!("healthy {}s", timeout.as_secs()));
            Ok(())
        });
        let c = calls.clone();
        mr.expect_delete().returning(move |_, name| {
            c.lock().unwrap().push(format!("delete {}", name));
            Ok(())
        });
        let c = calls.clone();
        mr.expect_wait_until_deleted().returning(move |_, _, timeout| {
            c.lock().unwrap().push(format!("deleted {}s", timeout.as_secs()));
            Ok(())
        });
        let c = calls.clone();
        mr.expect_delete_data_secret().returning(move |_, name| {
            c.lock().unwrap().push(format!("delete secret {}", name));
            Ok(())
        });

        clean(&mr, "shoot--foo--bar", &images(), false, &["ghcr.io".to_string()])
            .await
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "deploy extension-registry-configuration-cleaner",
                "healthy 180s",
                "delete extension-registry-configuration-cleaner",
                "deleted 120s",
                "delete secret extension-registry-configuration-cleaner",
            ]
        );
    }

    #[tokio::test]
    async fn empty_upstreams_are_rejected() {
        let mr = MockManagedResourceClient::new();
        assert!(clean(&mr, "ns", &images(), true, &[]).await.is_err());
    }

    #[tokio::test]
    async fn health_timeout_stops_the_flow() {
        let mut mr = MockManagedResourceClient::new();
        mr.expect_deploy().returning(|_, _, _, _| Ok(()));
        mr.expect_wait_until_healthy()
            .returning(|_, _, _| Err(Error::timeout("cleaner", "not healthy")));
        mr.expect_delete().never();

        let err = clean(&mr, "ns", &images(), false, &["ghcr.io".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
