//! Common types and plumbing for the registry cache extension
//!
//! This crate holds what every other crate in the workspace needs:
//! the shared error type, the host-platform resource types (Extension,
//! Cluster, Shoot, ManagedResource, OperatingSystemConfig pieces), Kubernetes
//! helpers, telemetry, metrics and leader election.

#![deny(missing_docs)]

pub mod error;
pub mod gardener;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result alias using the crate's error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extension type handled by this controller
pub const EXTENSION_TYPE: &str = "registry-cache";

/// Namespace in the shoot where caches and their services live
pub const SHOOT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "gardener-extension-registry-cache";

/// Finalizer placed on Extension objects managed by this controller
pub const FINALIZER: &str = "extensions.gardener.cloud/registry-cache";

/// Annotation carrying the requested lifecycle operation
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Operation annotation value requesting an immediate reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Operation annotation value requesting migration
pub const OPERATION_MIGRATE: &str = "migrate";

/// Operation annotation value requesting restoration
pub const OPERATION_RESTORE: &str = "restore";

/// Shoot annotation that confirms forceful deletion
pub const FORCE_DELETION_ANNOTATION: &str = "confirmation.gardener.cloud/force-deletion";

/// Name of the secret holding the shoot kubeconfig in the extension namespace
pub const SHOOT_ACCESS_SECRET_NAME: &str = "gardener";

/// Prefix the host platform uses when copying referenced resources to the seed
pub const REFERENCED_RESOURCE_PREFIX: &str = "ref-";

/// Label added to every shoot object so the platform leaves it alone on cleanup
pub const NO_CLEANUP_LABEL: &str = "shoot.gardener.cloud/no-cleanup";
