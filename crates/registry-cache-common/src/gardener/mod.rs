//! Host-platform resource types
//!
//! Only the subset of each API that the extension reads or writes is
//! modelled. Unknown fields are ignored on decode.

mod cluster;
mod extension;
mod managed_resource;
mod osc;
mod shoot;

pub use cluster::{Cluster, ClusterSpec};
pub use extension::{
    Extension, ExtensionSpec, ExtensionStatus, LastError, LastOperation, LastOperationState,
    LastOperationType,
};
pub use managed_resource::{
    Condition, LocalObjectReference, ManagedResource, ManagedResourceSpec, ManagedResourceStatus,
    CONDITION_RESOURCES_APPLIED, CONDITION_RESOURCES_HEALTHY,
};
pub use osc::{
    ContainerdRegistryConfig, FileContent, FileContentInline, OscFile, OscUnit, RegistryHost,
    CA_BUNDLE_PATH, CONFIGURE_SCRIPT_PATH, CONFIGURE_UNIT_NAME, CONTAINERD_CERTS_DIR,
    OSC_PURPOSE_RECONCILE,
};
pub use shoot::{
    CaRotation, CrossVersionObjectReference, Hibernation, NamedResourceReference, Shoot,
    ShootCredentials, ShootCredentialsRotation, ShootExtension, ShootKubernetes, ShootProvider,
    ShootSpec, ShootStatus, VerticalPodAutoscaler, Worker, WorkerCri, CRI_CONTAINERD,
    CA_ROTATION_COMPLETED, CA_ROTATION_COMPLETING, CA_ROTATION_PREPARED, CA_ROTATION_PREPARING,
};
