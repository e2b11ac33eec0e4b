//! RegistryConfig API for the registry cache extension
//!
//! Users write a `RegistryConfig` in one of three external versions
//! (`v1alpha1`, `v1alpha2`, `v1alpha3`). Everything inside the extension works
//! on the internal shape in [`types`]; [`codec`] decodes any external version
//! strictly (unknown fields are rejected), applies that version's defaults and
//! converts. Status is always written as `v1alpha3`.

#![deny(missing_docs)]

pub mod codec;
pub mod duration;
pub mod field;
pub mod helper;
pub mod quantity;
pub mod types;
pub mod v1alpha1;
pub mod v1alpha2;
pub mod v1alpha3;
pub mod validation;

pub use codec::{
    decode_registry_config, decode_registry_config_value, decode_registry_status,
    encode_registry_config, encode_registry_config_as, encode_registry_status, ApiVersion,
    DecodeError, VersionedRegistryConfig,
};
pub use duration::GoDuration;
pub use field::{ErrorList, FieldError, FieldErrorType, Path};
pub use validation::{
    semantically_equal, validate_registry_config, validate_registry_config_update,
    validate_upstream_registry_secret,
};
pub use types::{
    GarbageCollection, HighAvailability, Http, Proxy, RegistryCache, RegistryCacheStatus,
    RegistryConfig, RegistryStatus, Volume,
};

/// API group of all RegistryConfig versions
pub const GROUP: &str = "registry.extensions.gardener.cloud";

/// Kind of the provider configuration
pub const KIND_REGISTRY_CONFIG: &str = "RegistryConfig";

/// Kind of the provider status
pub const KIND_REGISTRY_STATUS: &str = "RegistryStatus";
