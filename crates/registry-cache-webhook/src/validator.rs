//! Shoot admission validator
//!
//! Rejects Shoots whose registry-cache extension block cannot work: workers
//! without containerd, a missing or undecodable provider config, field rule
//! violations (including the update rules against the previous config) and
//! credential references that do not resolve to a well-formed Secret.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use registry_cache_api::{
    decode_registry_config_value, semantically_equal, validate_registry_config,
    validate_registry_config_update, validate_upstream_registry_secret, ErrorList, FieldError,
    Path, RegistryConfig,
};
use registry_cache_common::gardener::{Shoot, CRI_CONTAINERD};
use registry_cache_common::metrics::record_admission;

use crate::error::WebhookError;
use crate::readers::SecretReader;

/// Path the validator is served on
pub const VALIDATOR_PATH: &str = "/webhooks/registry-cache";

/// Deadline for reading a referenced credentials secret
pub const SECRET_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const WEBHOOK_NAME: &str = "shoot-validator";

/// Shared state of the validator
pub struct ValidatorState {
    /// Direct secret reads in the garden cluster
    pub secrets: Arc<dyn SecretReader>,
}

/// Handle a validating admission review for Shoots
pub async fn validate_handler(
    State(state): State<Arc<ValidatorState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(review_shoot(&state, &req).await.into_review())
}

#[instrument(skip_all, fields(uid = %request.uid, shoot = %request.name))]
async fn review_shoot(
    state: &ValidatorState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let result = match request.operation {
        Operation::Create | Operation::Update => admit(state, request).await,
        _ => Ok(()),
    };

    match result {
        Ok(()) => {
            record_admission(WEBHOOK_NAME, true);
            AdmissionResponse::from(request)
        }
        Err(e) => {
            info!(error = %e, kind = e.kind(), "Rejecting shoot");
            record_admission(WEBHOOK_NAME, false);
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

async fn admit(
    state: &ValidatorState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(), WebhookError> {
    let Some(object) = &request.object else {
        debug!("No shoot in request, allowing");
        return Ok(());
    };
    let shoot = decode_shoot(object)?;
    let old = request.old_object.as_ref().map(decode_shoot).transpose()?;
    validate_shoot(state.secrets.as_ref(), &shoot, old.as_ref()).await
}

fn decode_shoot(object: &DynamicObject) -> Result<Shoot, WebhookError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Validate the registry-cache extension block of a Shoot
///
/// `old` is the previous Shoot on update. Shoots without an enabled
/// registry-cache extension are accepted as they are.
pub async fn validate_shoot(
    secrets: &dyn SecretReader,
    shoot: &Shoot,
    old: Option<&Shoot>,
) -> Result<(), WebhookError> {
    let Some((index, extension)) = shoot.registry_cache_extension() else {
        return Ok(());
    };
    let path = Path::new("spec")
        .child("extensions")
        .index(index)
        .child("providerConfig");

    validate_workers(shoot).into_result()?;

    let Some(raw) = extension.provider_config.as_ref().filter(|v| !v.is_null()) else {
        return Err(ErrorList::from(FieldError::required(
            &path,
            "providerConfig is required for the registry-cache extension",
        ))
        .into());
    };
    let config = decode_registry_config_value(raw).map_err(|source| WebhookError::Decode {
        what: "providerConfig",
        source,
    })?;

    let mut errs = ErrorList::new();
    if let Some(previous) = old.and_then(previous_config) {
        if semantically_equal(&previous, &config) {
            return Ok(());
        }
        errs.extend(validate_registry_config_update(&previous, &config, &path));
    }
    errs.extend(validate_registry_config(&config, &path));
    errs.into_result()?;

    validate_secret_references(secrets, shoot, &config, &path).await
}

fn validate_workers(shoot: &Shoot) -> ErrorList {
    let workers = Path::new("spec").child("provider").child("workers");
    ErrorList(
        shoot
            .spec
            .provider
            .workers
            .iter()
            .enumerate()
            .filter_map(|(i, worker)| {
                let cri = worker.cri.as_ref().map(|c| c.name.as_str());
                (cri != Some(CRI_CONTAINERD)).then(|| {
                    FieldError::invalid(
                        &workers.index(i).child("cri").child("name"),
                        cri.unwrap_or_default(),
                        "container runtime needs to be containerd when the registry-cache extension is enabled",
                    )
                })
            })
            .collect(),
    )
}

/// Config of the previous Shoot; an undecodable one is treated as absent
fn previous_config(old: &Shoot) -> Option<RegistryConfig> {
    let (_, extension) = old.registry_cache_extension()?;
    let raw = extension.provider_config.as_ref()?;
    match decode_registry_config_value(raw) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(error = %e, "Previous providerConfig is undecodable, skipping update rules");
            None
        }
    }
}

async fn validate_secret_references(
    secrets: &dyn SecretReader,
    shoot: &Shoot,
    config: &RegistryConfig,
    path: &Path,
) -> Result<(), WebhookError> {
    let mut errs = ErrorList::new();
    let caches = path.child("caches");
    let namespace = shoot.namespace();

    for (i, cache) in config.caches.iter().enumerate() {
        let Some(name) = cache.secret_reference_name.as_deref() else {
            continue;
        };
        let ref_path = caches.index(i).child("secretReferenceName");

        let Some(resource) = shoot.find_resource(name) else {
            errs.push(FieldError::invalid(
                &ref_path,
                name,
                format!("referenced resource with name {name:?} not found in spec.resources"),
            ));
            continue;
        };
        if resource.resource_ref.kind != "Secret" {
            errs.push(FieldError::invalid(
                &ref_path,
                name,
                format!(
                    "referenced resource with name {name:?} should be of kind Secret, got {:?}",
                    resource.resource_ref.kind
                ),
            ));
            continue;
        }

        let secret_name = resource.resource_ref.name.as_str();
        let secret_ref = format!("{namespace}/{secret_name}");
        let secret = timeout(SECRET_LOOKUP_TIMEOUT, secrets.get_secret(namespace, secret_name))
            .await
            .map_err(|_| WebhookError::Timeout(format!("reading secret {secret_ref:?}")))??
            .ok_or_else(|| WebhookError::NotFound {
                kind: "Secret",
                name: secret_ref.clone(),
            })?;
        errs.extend(validate_upstream_registry_secret(&secret, &ref_path, &secret_ref));
    }

    Ok(errs.into_result()?)
}
