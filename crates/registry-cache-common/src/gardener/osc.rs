use serde::{Deserialize, Serialize};

/// OperatingSystemConfig purpose for configs applied to running nodes
pub const OSC_PURPOSE_RECONCILE: &str = "reconcile";

/// containerd's per-registry configuration directory on nodes
pub const CONTAINERD_CERTS_DIR: &str = "/etc/containerd/certs.d";

/// Where nodes find the CA bundle of the caches
pub const CA_BUNDLE_PATH: &str = "/var/lib/registry-cache/ca-bundle.pem";

/// Script writing `hosts.toml` files on nodes ignoring the declarative config
pub const CONFIGURE_SCRIPT_PATH: &str = "/opt/bin/configure-containerd-registries.sh";

/// One-shot unit running [`CONFIGURE_SCRIPT_PATH`]
pub const CONFIGURE_UNIT_NAME: &str = "configure-containerd-registries.service";

/// A file entry in `spec.files` of an OperatingSystemConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OscFile {
    /// Absolute path on the node
    pub path: String,
    /// Unix permissions (decimal encoding of the octal mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    /// File content
    pub content: FileContent,
}

/// Content of an OSC file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// Inline content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<FileContentInline>,
}

/// Inline file content
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileContentInline {
    /// Encoding of `data` ("" or "b64")
    #[serde(default)]
    pub encoding: String,
    /// File data
    pub data: String,
}

/// A systemd unit entry in `spec.units`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OscUnit {
    /// Unit name
    pub name: String,
    /// Command issued on apply ("start", "restart", "stop")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the unit is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Unit file content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Paths of files the unit depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
}

/// Declarative containerd registry configuration
/// (`spec.criConfig.containerd.registries[]`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerdRegistryConfig {
    /// Upstream host the entry applies to
    pub upstream: String,
    /// Fallback server URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Mirror hosts tried before the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<RegistryHost>,
    /// Probe hosts before writing the configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<bool>,
}

/// A mirror host of a containerd registry entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHost {
    /// Host URL
    pub url: String,
    /// Capabilities, e.g. "pull" and "resolve"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// CA certificate paths trusted for this host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca_certs: Vec<String>,
}
