//! In-memory seed and shoot for actuator and controller tests
//!
//! Every mock records what it was asked to do instead of asserting on its
//! arguments, so tests check outcomes (bundles, secrets, status patches)
//! rather than call shapes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde_json::Value;

use registry_cache_common::gardener::{Cluster, ClusterSpec, Extension, ExtensionSpec, ExtensionStatus, Shoot};
use registry_cache_common::{Error, EXTENSION_TYPE};

use crate::cleaner::CleanerImages;
use crate::clients::{MockSeedClient, MockShootClient, MockShootClientFactory, ShootClient};
use crate::controller::{Context, ControllerConfig};
use crate::managed_resources::{MockManagedResourceClient, ObjectRegistry, CLEANER_BUNDLE, SERVICES_BUNDLE};
use crate::secrets::MockSecretStore;

type Shared<T> = Arc<Mutex<T>>;

/// Extension named `registry-cache` in `namespace`
pub fn extension(namespace: &str, provider_config: Option<Value>, provider_status: Option<Value>) -> Extension {
    let mut ext = Extension::new(
        "registry-cache",
        ExtensionSpec {
            type_: EXTENSION_TYPE.to_string(),
            class: None,
            provider_config,
        },
    );
    ext.metadata.namespace = Some(namespace.to_string());
    ext.metadata.generation = Some(1);
    ext.status = provider_status.map(|s| ExtensionStatus {
        provider_status: Some(s),
        ..Default::default()
    });
    ext
}

/// Decode a shoot fixture
pub fn shoot(json: Value) -> Shoot {
    serde_json::from_value(json).unwrap()
}

/// Fake seed and shoot state shared by all mocks of one test
#[derive(Clone)]
pub struct World {
    bundles: Shared<BTreeMap<String, ObjectRegistry>>,
    calls: Shared<Vec<String>>,
    status: Shared<Vec<Value>>,
    secrets: Shared<BTreeMap<String, Secret>>,
    seed_secrets: Shared<BTreeMap<String, Secret>>,
    cleaner_scripts: Shared<Vec<String>>,
    shoot: Shared<Value>,
    services: bool,
    unhealthy: Option<&'static str>,
}

impl World {
    pub fn new() -> Self {
        Self {
            bundles: Default::default(),
            calls: Default::default(),
            status: Default::default(),
            secrets: Default::default(),
            seed_secrets: Default::default(),
            cleaner_scripts: Default::default(),
            shoot: Arc::new(Mutex::new(serde_json::json!({}))),
            services: true,
            unhealthy: None,
        }
    }

    /// The shoot never reports any cache service
    pub fn without_services(mut self) -> Self {
        self.services = false;
        self
    }

    /// `bundle` never becomes healthy
    pub fn with_unhealthy(mut self, bundle: &'static str) -> Self {
        self.unhealthy = Some(bundle);
        self
    }

    /// Shoot manifest served through the Cluster object
    pub fn with_shoot(self, json: Value) -> Self {
        *self.shoot.lock().unwrap() = json;
        self
    }

    /// Secret readable from the seed namespace
    pub fn with_seed_secret(self, name: &str, data: &[(&str, &str)]) -> Self {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            immutable: Some(true),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.seed_secrets.lock().unwrap().insert(name.to_string(), secret);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn status_patches(&self) -> Vec<Value> {
        self.status.lock().unwrap().clone()
    }

    /// Last `providerStatus` written
    pub fn provider_status(&self) -> Option<Value> {
        self.status
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|s| s.get("providerStatus").cloned())
    }

    /// `ext` with the last written provider status
    pub fn with_recorded_status(&self, mut ext: Extension) -> Extension {
        let provider_status = self.provider_status();
        ext.status.get_or_insert_with(Default::default).provider_status = provider_status;
        ext
    }

    /// `ext` with every status patch merged in, as the watch would see it
    pub fn with_patched_status(&self, mut ext: Extension) -> Extension {
        let mut status = serde_json::to_value(ext.status.take().unwrap_or_default()).unwrap();
        for patch in self.status_patches() {
            for (key, value) in patch.as_object().unwrap() {
                if value.is_null() {
                    status.as_object_mut().unwrap().remove(key);
                } else {
                    status[key.as_str()] = value.clone();
                }
            }
        }
        ext.status = Some(serde_json::from_value(status).unwrap());
        ext
    }

    pub fn bundle(&self, name: &str) -> Option<ObjectRegistry> {
        self.bundles.lock().unwrap().get(name).cloned()
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.secrets.lock().unwrap().keys().cloned().collect()
    }

    /// Script of the last cleaner run
    pub fn cleaner_script(&self) -> Option<String> {
        self.cleaner_scripts.lock().unwrap().last().cloned()
    }

    /// Services the shoot reports: one per service in the deployed bundle,
    /// with cluster IPs handed out in key order
    fn observed_services(bundles: &Shared<BTreeMap<String, ObjectRegistry>>) -> Vec<Service> {
        let bundles = bundles.lock().unwrap();
        let Some(registry) = bundles.get(SERVICES_BUNDLE) else {
            return Vec::new();
        };
        registry
            .of_kind("Service")
            .enumerate()
            .map(|(i, v)| {
                let mut svc: Service = serde_json::from_value(v.clone()).unwrap();
                svc.spec.get_or_insert_with(Default::default).cluster_ip =
                    Some(format!("10.4.0.{}", 10 + i));
                svc
            })
            .collect()
    }

    fn record(calls: &Shared<Vec<String>>, call: String) {
        calls.lock().unwrap().push(call);
    }

    pub fn seed(&self) -> MockSeedClient {
        let mut seed = MockSeedClient::new();

        let shoot = self.shoot.clone();
        seed.expect_get_cluster().returning(move |name| {
            Ok(Cluster::new(
                name,
                ClusterSpec {
                    shoot: shoot.lock().unwrap().clone(),
                    ..Default::default()
                },
            ))
        });
        let secrets = self.seed_secrets.clone();
        seed.expect_get_secret()
            .returning(move |_, name| Ok(secrets.lock().unwrap().get(name).cloned()));
        let status = self.status.clone();
        seed.expect_patch_extension_status().returning(move |_, _, patch| {
            status.lock().unwrap().push(patch);
            Ok(())
        });

        let calls = self.calls.clone();
        seed.expect_add_finalizer()
            .returning(move |_, _| {
                Self::record(&calls, "add finalizer".to_string());
                Ok(())
            });
        let calls = self.calls.clone();
        seed.expect_remove_finalizer()
            .returning(move |_, _| {
                Self::record(&calls, "remove finalizer".to_string());
                Ok(())
            });
        let calls = self.calls.clone();
        seed.expect_remove_operation_annotation()
            .returning(move |_, _| {
                Self::record(&calls, "remove annotation".to_string());
                Ok(())
            });
        let calls = self.calls.clone();
        seed.expect_apply_monitoring()
            .returning(move |_, _| {
                Self::record(&calls, "apply monitoring".to_string());
                Ok(())
            });
        let calls = self.calls.clone();
        seed.expect_delete_monitoring()
            .returning(move |_| {
                Self::record(&calls, "delete monitoring".to_string());
                Ok(())
            });
        seed
    }

    pub fn shoots(&self) -> MockShootClientFactory {
        let mut factory = MockShootClientFactory::new();
        let bundles = self.bundles.clone();
        let services = self.services;
        factory.expect_shoot_client().returning(move |_| {
            let mut client = MockShootClient::new();
            let bundles = bundles.clone();
            client.expect_list_cache_services().returning(move || {
                Ok(if services {
                    Self::observed_services(&bundles)
                } else {
                    Vec::new()
                })
            });
            Ok(Arc::new(client) as Arc<dyn ShootClient>)
        });
        factory
    }

    pub fn managed_resources(&self) -> MockManagedResourceClient {
        let mut mr = MockManagedResourceClient::new();

        let (calls, bundles, scripts) =
            (self.calls.clone(), self.bundles.clone(), self.cleaner_scripts.clone());
        mr.expect_deploy().returning(move |_, name, objects, _| {
            if name == CLEANER_BUNDLE {
                if let Some(script) = objects
                    .of_kind("DaemonSet")
                    .next()
                    .and_then(|ds| ds.pointer("/spec/template/spec/initContainers/0/command/2"))
                    .and_then(Value::as_str)
                {
                    scripts.lock().unwrap().push(script.to_string());
                }
            }
            bundles.lock().unwrap().insert(name.to_string(), objects);
            Self::record(&calls, format!("deploy {}", name));
            Ok(())
        });
        let calls = self.calls.clone();
        let unhealthy = self.unhealthy;
        mr.expect_wait_until_healthy().returning(move |_, name, _| {
            Self::record(&calls, format!("healthy {}", name));
            if unhealthy == Some(name) {
                return Err(Error::timeout(name, "resources are not healthy"));
            }
            Ok(())
        });
        let (calls, bundles) = (self.calls.clone(), self.bundles.clone());
        mr.expect_delete().returning(move |_, name| {
            bundles.lock().unwrap().remove(name);
            Self::record(&calls, format!("delete {}", name));
            Ok(())
        });
        let calls = self.calls.clone();
        mr.expect_wait_until_deleted().returning(move |_, name, _| {
            Self::record(&calls, format!("deleted {}", name));
            Ok(())
        });
        let calls = self.calls.clone();
        mr.expect_delete_data_secret().returning(move |_, name| {
            Self::record(&calls, format!("delete secret {}", name));
            Ok(())
        });
        let calls = self.calls.clone();
        mr.expect_set_keep_objects().returning(move |_, name, _| {
            Self::record(&calls, format!("keep {}", name));
            Ok(())
        });
        mr
    }

    pub fn secret_store(&self) -> MockSecretStore {
        let mut store = MockSecretStore::new();
        let secrets = self.secrets.clone();
        store.expect_list_managed()
            .returning(move |_| Ok(secrets.lock().unwrap().values().cloned().collect()));
        let secrets = self.secrets.clone();
        store.expect_apply().returning(move |_, s| {
            secrets.lock().unwrap().insert(s.name_any(), s);
            Ok(())
        });
        let secrets = self.secrets.clone();
        store.expect_delete().returning(move |_, name| {
            secrets.lock().unwrap().remove(name);
            Ok(())
        });
        store
    }

    pub fn config() -> ControllerConfig {
        ControllerConfig {
            registry_image: "europe-docker.pkg.dev/gardener-project/releases/3rd/registry:3.0.0".to_string(),
            cleaner_images: CleanerImages {
                cleaner: "europe-docker.pkg.dev/gardener-project/releases/3rd/alpine:3.20.3".to_string(),
                pause: "registry.k8s.io/pause:3.10".to_string(),
            },
            extension_class: None,
        }
    }

    pub fn context(&self) -> Context {
        Context::for_testing(
            Arc::new(self.seed()),
            Arc::new(self.shoots()),
            Arc::new(self.managed_resources()),
            Arc::new(self.secret_store()),
            Self::config(),
        )
    }
}
