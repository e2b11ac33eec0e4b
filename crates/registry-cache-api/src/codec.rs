//! Strict decoding and encoding of the provider config and status
//!
//! The raw document is first read as a generic value so `apiVersion` and
//! `kind` can pick the external version. The versioned shape is then decoded
//! with unknown fields rejected, defaulted, and converted to the internal
//! shape. Encoding always produces `v1alpha3` unless a version is asked for.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::types;
use crate::{v1alpha1, v1alpha2, v1alpha3, KIND_REGISTRY_CONFIG, KIND_REGISTRY_STATUS};

/// Failure to turn a raw document into the internal shape
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A required field is absent
    #[error("required field {field} is missing")]
    Missing {
        /// Name of the missing field
        field: String,
    },

    /// The document is not valid for its declared version
    #[error("failed to decode {kind}: {message}")]
    Decode {
        /// Kind being decoded
        kind: String,
        /// Decoder message
        message: String,
    },

    /// The apiVersion/kind pair is not one this API serves
    #[error("no kind {kind:?} is registered for version {api_version:?}")]
    SchemaMismatch {
        /// Declared apiVersion
        api_version: String,
        /// Declared kind
        kind: String,
    },
}

impl DecodeError {
    fn from_serde(kind: &str, err: serde_json::Error) -> Self {
        let message = err.to_string();
        if let Some(field) = missing_field(&message) {
            return DecodeError::Missing { field };
        }
        DecodeError::Decode {
            kind: kind.to_string(),
            message,
        }
    }
}

// serde reports absent required fields as "missing field `name` at ..."
fn missing_field(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

/// External versions of the registry API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    /// `v1alpha1`
    V1alpha1,
    /// `v1alpha2`
    V1alpha2,
    /// `v1alpha3`
    V1alpha3,
}

impl ApiVersion {
    /// Full `group/version` string
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1alpha1 => v1alpha1::API_VERSION,
            ApiVersion::V1alpha2 => v1alpha2::API_VERSION,
            ApiVersion::V1alpha3 => v1alpha3::API_VERSION,
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            v1alpha1::API_VERSION => Ok(ApiVersion::V1alpha1),
            v1alpha2::API_VERSION => Ok(ApiVersion::V1alpha2),
            v1alpha3::API_VERSION => Ok(ApiVersion::V1alpha3),
            _ => Err(()),
        }
    }
}

/// A provider config in any external version
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedRegistryConfig {
    /// `v1alpha1`
    V1alpha1(v1alpha1::RegistryConfig),
    /// `v1alpha2`
    V1alpha2(v1alpha2::RegistryConfig),
    /// `v1alpha3`
    V1alpha3(v1alpha3::RegistryConfig),
}

impl VersionedRegistryConfig {
    /// Strictly decode a config value, dispatching on `apiVersion`
    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let version = resolve_version(value, KIND_REGISTRY_CONFIG)?;
        Ok(match version {
            ApiVersion::V1alpha1 => Self::V1alpha1(strict(value, KIND_REGISTRY_CONFIG)?),
            ApiVersion::V1alpha2 => Self::V1alpha2(strict(value, KIND_REGISTRY_CONFIG)?),
            ApiVersion::V1alpha3 => Self::V1alpha3(strict(value, KIND_REGISTRY_CONFIG)?),
        })
    }

    /// Version this config was written in
    pub fn api_version(&self) -> ApiVersion {
        match self {
            Self::V1alpha1(_) => ApiVersion::V1alpha1,
            Self::V1alpha2(_) => ApiVersion::V1alpha2,
            Self::V1alpha3(_) => ApiVersion::V1alpha3,
        }
    }

    /// Apply the defaults of the config's own version
    pub fn set_defaults(&mut self) {
        match self {
            Self::V1alpha1(c) => v1alpha1::set_defaults(c),
            Self::V1alpha2(c) => v1alpha2::set_defaults(c),
            Self::V1alpha3(c) => v1alpha3::set_defaults(c),
        }
    }

    /// Convert into the given external version
    pub fn from_internal(config: &types::RegistryConfig, version: ApiVersion) -> Self {
        match version {
            ApiVersion::V1alpha1 => Self::V1alpha1(config.into()),
            ApiVersion::V1alpha2 => Self::V1alpha2(config.into()),
            ApiVersion::V1alpha3 => Self::V1alpha3(config.into()),
        }
    }
}

impl From<VersionedRegistryConfig> for types::RegistryConfig {
    fn from(config: VersionedRegistryConfig) -> Self {
        match config {
            VersionedRegistryConfig::V1alpha1(c) => c.into(),
            VersionedRegistryConfig::V1alpha2(c) => c.into(),
            VersionedRegistryConfig::V1alpha3(c) => c.into(),
        }
    }
}

fn resolve_version(value: &Value, expected_kind: &str) -> Result<ApiVersion, DecodeError> {
    let obj = match value {
        Value::Null => {
            return Err(DecodeError::Missing {
                field: "providerConfig".to_string(),
            })
        }
        Value::Object(obj) => obj,
        other => {
            return Err(DecodeError::Decode {
                kind: expected_kind.to_string(),
                message: format!("expected an object, got {}", json_type(other)),
            })
        }
    };

    let api_version = string_field(obj, "apiVersion")?;
    let kind = string_field(obj, "kind")?;
    let mismatch = || DecodeError::SchemaMismatch {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
    };
    if kind != expected_kind {
        return Err(mismatch());
    }
    api_version.parse().map_err(|_| mismatch())
}

fn string_field<'a>(
    obj: &'a serde_json::Map<String, Value>,
    name: &str,
) -> Result<&'a str, DecodeError> {
    match obj.get(name) {
        None | Some(Value::Null) => Err(DecodeError::Missing {
            field: name.to_string(),
        }),
        Some(Value::String(s)) if s.is_empty() => Err(DecodeError::Missing {
            field: name.to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(DecodeError::Decode {
            kind: name.to_string(),
            message: format!("{name} must be a string, got {}", json_type(other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn strict<T: DeserializeOwned>(value: &Value, kind: &str) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|e| DecodeError::from_serde(kind, e))
}

fn parse_document(raw: &[u8], kind: &str) -> Result<Value, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Missing {
            field: "providerConfig".to_string(),
        });
    }
    serde_yaml::from_slice(raw).map_err(|e| DecodeError::Decode {
        kind: kind.to_string(),
        message: e.to_string(),
    })
}

/// Decode a raw JSON or YAML provider config into the internal shape
pub fn decode_registry_config(raw: &[u8]) -> Result<types::RegistryConfig, DecodeError> {
    let value = parse_document(raw, KIND_REGISTRY_CONFIG)?;
    decode_registry_config_value(&value)
}

/// Decode an already parsed provider config into the internal shape
pub fn decode_registry_config_value(value: &Value) -> Result<types::RegistryConfig, DecodeError> {
    let mut versioned = VersionedRegistryConfig::decode(value)?;
    versioned.set_defaults();
    Ok(versioned.into())
}

/// Encode the internal config as `v1alpha3`
pub fn encode_registry_config(config: &types::RegistryConfig) -> serde_json::Result<Value> {
    encode_registry_config_as(config, ApiVersion::V1alpha3)
}

/// Encode the internal config in the given external version
pub fn encode_registry_config_as(
    config: &types::RegistryConfig,
    version: ApiVersion,
) -> serde_json::Result<Value> {
    match VersionedRegistryConfig::from_internal(config, version) {
        VersionedRegistryConfig::V1alpha1(c) => serde_json::to_value(c),
        VersionedRegistryConfig::V1alpha2(c) => serde_json::to_value(c),
        VersionedRegistryConfig::V1alpha3(c) => serde_json::to_value(c),
    }
}

/// Decode a provider status written in any version
pub fn decode_registry_status(value: &Value) -> Result<types::RegistryStatus, DecodeError> {
    let status = match resolve_version(value, KIND_REGISTRY_STATUS)? {
        ApiVersion::V1alpha1 => {
            strict::<v1alpha1::RegistryStatus>(value, KIND_REGISTRY_STATUS)?.into()
        }
        ApiVersion::V1alpha2 => {
            strict::<v1alpha2::RegistryStatus>(value, KIND_REGISTRY_STATUS)?.into()
        }
        ApiVersion::V1alpha3 => {
            strict::<v1alpha3::RegistryStatus>(value, KIND_REGISTRY_STATUS)?.into()
        }
    };
    Ok(status)
}

/// Encode the internal status as `v1alpha3`
pub fn encode_registry_status(status: &types::RegistryStatus) -> serde_json::Result<Value> {
    serde_json::to_value(v1alpha3::RegistryStatus::from(status))
}
