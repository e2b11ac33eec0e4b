//! containerd registry configuration for the caches
//!
//! Nodes are pointed at the caches in two ways: declaratively through the
//! OperatingSystemConfig's containerd registries, and through a one-shot unit
//! that writes the same `hosts.toml` files on node images that ignore the
//! declarative form.

use std::collections::BTreeMap;

use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;

use registry_cache_api::RegistryStatus;
use registry_cache_common::gardener::{
    ContainerdRegistryConfig, OscUnit, RegistryHost, CA_BUNDLE_PATH, CONFIGURE_SCRIPT_PATH,
    CONFIGURE_UNIT_NAME, CONTAINERD_CERTS_DIR,
};

use crate::error::WebhookError;

const CONFIGURE_SCRIPT: &str = include_str!("../templates/configure-containerd-registries.sh.j2");

/// Capabilities granted to every cache host
pub const HOST_CAPABILITIES: [&str; 2] = ["pull", "resolve"];

/// Declarative registry entries, one per cache in `status`
pub fn registry_configs(status: &RegistryStatus) -> Vec<ContainerdRegistryConfig> {
    status
        .caches
        .iter()
        .map(|cache| ContainerdRegistryConfig {
            upstream: cache.upstream.clone(),
            server: Some(cache.remote_url.clone()),
            hosts: vec![RegistryHost {
                url: cache.endpoint.clone(),
                capabilities: HOST_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
                ca_certs: if cache.endpoint.starts_with("https://") {
                    vec![CA_BUNDLE_PATH.to_string()]
                } else {
                    Vec::new()
                },
            }],
            readiness_probe: None,
        })
        .collect()
}

#[derive(Serialize)]
struct HostsFile<'a> {
    server: &'a str,
    host: BTreeMap<&'a str, HostEntry>,
}

#[derive(Serialize)]
struct HostEntry {
    capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ca: Vec<String>,
}

/// Render the `hosts.toml` of one registry entry
pub fn hosts_toml(registry: &ContainerdRegistryConfig) -> Result<String, WebhookError> {
    let server = registry
        .server
        .as_deref()
        .unwrap_or(registry.upstream.as_str());
    let file = HostsFile {
        server,
        host: registry
            .hosts
            .iter()
            .map(|h| {
                (
                    h.url.as_str(),
                    HostEntry {
                        capabilities: h.capabilities.clone(),
                        ca: h.ca_certs.clone(),
                    },
                )
            })
            .collect(),
    };
    toml::to_string(&file).map_err(|e| WebhookError::Render {
        what: "hosts.toml",
        message: e.to_string(),
    })
}

#[derive(Serialize)]
struct ScriptEntry {
    upstream: String,
    hosts_toml: String,
}

/// Render the script writing every registry's `hosts.toml`
pub fn configure_script(registries: &[ContainerdRegistryConfig]) -> Result<String, WebhookError> {
    let entries = registries
        .iter()
        .map(|r| {
            Ok(ScriptEntry {
                upstream: r.upstream.clone(),
                hosts_toml: hosts_toml(r)?,
            })
        })
        .collect::<Result<Vec<_>, WebhookError>>()?;

    let render_err = |e: minijinja::Error| WebhookError::Render {
        what: "configure script",
        message: e.to_string(),
    };
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("configure", CONFIGURE_SCRIPT)
        .map_err(render_err)?;
    env.get_template("configure")
        .and_then(|t| {
            t.render(context! {
                registries => entries,
                certs_dir => CONTAINERD_CERTS_DIR,
            })
        })
        .map_err(render_err)
}

/// The one-shot unit running the configure script
pub fn configure_unit() -> OscUnit {
    let content = format!(
        "[Unit]\n\
         Description=Configures containerd registry mirrors of the registry caches\n\
         After=containerd.service\n\
         Requires=containerd.service\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         RemainAfterExit=yes\n\
         ExecStart={CONFIGURE_SCRIPT_PATH}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    );
    OscUnit {
        name: CONFIGURE_UNIT_NAME.to_string(),
        command: Some("start".to_string()),
        enable: Some(true),
        content: Some(content),
        file_paths: vec![CONFIGURE_SCRIPT_PATH.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_cache_api::RegistryCacheStatus;

    fn status() -> RegistryStatus {
        RegistryStatus {
            caches: vec![
                RegistryCacheStatus {
                    upstream: "docker.io".to_string(),
                    endpoint: "https://10.4.246.205:5000".to_string(),
                    remote_url: "https://registry-1.docker.io".to_string(),
                },
                RegistryCacheStatus {
                    upstream: "my-registry.io:5000".to_string(),
                    endpoint: "http://10.4.26.127:5000".to_string(),
                    remote_url: "http://my-registry.io:5000".to_string(),
                },
            ],
            ca_secret_name: Some("ca-extension-registry-cache-bundle-0f1e2d3c".to_string()),
        }
    }

    #[test]
    fn tls_hosts_trust_the_ca_bundle() {
        let registries = registry_configs(&status());
        assert_eq!(registries.len(), 2);

        let docker = &registries[0];
        assert_eq!(docker.upstream, "docker.io");
        assert_eq!(docker.server.as_deref(), Some("https://registry-1.docker.io"));
        assert_eq!(docker.hosts[0].url, "https://10.4.246.205:5000");
        assert_eq!(docker.hosts[0].capabilities, vec!["pull", "resolve"]);
        assert_eq!(docker.hosts[0].ca_certs, vec![CA_BUNDLE_PATH]);

        assert!(registries[1].hosts[0].ca_certs.is_empty());
    }

    #[test]
    fn hosts_toml_has_server_and_one_table_per_host() {
        let registries = registry_configs(&status());
        let rendered = hosts_toml(&registries[0]).unwrap();
        let parsed: toml::Value = toml::from_str(&rendered).unwrap();

        assert_eq!(parsed["server"].as_str(), Some("https://registry-1.docker.io"));
        let host = &parsed["host"]["https://10.4.246.205:5000"];
        let caps: Vec<&str> = host["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(caps, vec!["pull", "resolve"]);
        assert_eq!(host["ca"][0].as_str(), Some(CA_BUNDLE_PATH));
    }

    #[test]
    fn plain_http_hosts_carry_no_ca() {
        let registries = registry_configs(&status());
        let parsed: toml::Value = toml::from_str(&hosts_toml(&registries[1]).unwrap()).unwrap();
        let host = &parsed["host"]["http://10.4.26.127:5000"];
        assert!(host.get("ca").is_none());
    }

    #[test]
    fn script_writes_every_upstream() {
        let script = configure_script(&registry_configs(&status())).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("mkdir -p \"/etc/containerd/certs.d/docker.io\""));
        assert!(script.contains("> \"/etc/containerd/certs.d/my-registry.io:5000/hosts.toml\""));
        assert!(script.contains("server = \"http://my-registry.io:5000\""));
        assert_eq!(script.matches("cat <<'EOF'").count(), 2);
    }

    #[test]
    fn unit_runs_the_script_after_containerd() {
        let unit = configure_unit();
        assert_eq!(unit.name, CONFIGURE_UNIT_NAME);
        assert_eq!(unit.file_paths, vec![CONFIGURE_SCRIPT_PATH]);
        let content = unit.content.unwrap();
        assert!(content.contains("After=containerd.service"));
        assert!(content.contains("Type=oneshot"));
        assert!(content.contains(&format!("ExecStart={CONFIGURE_SCRIPT_PATH}")));
    }
}
