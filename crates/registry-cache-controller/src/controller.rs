//! Extension controller
//!
//! Watches `Extension` objects of type `registry-cache`, dispatches each one
//! to the matching actuator operation and reports the outcome in
//! `status.lastOperation` / `status.lastError`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::runtime::controller::{Action, Config as ControllerRuntimeConfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use registry_cache_common::gardener::{
    Extension, LastError, LastOperation, LastOperationState, LastOperationType, Shoot,
};
use registry_cache_common::metrics::OperationTimer;
use registry_cache_common::error::ERR_CONFIGURATION_PROBLEM;
use registry_cache_common::{
    Error, Result, EXTENSION_TYPE, FINALIZER, OPERATION_MIGRATE,
    OPERATION_RESTORE,
};

use crate::actuator;
use crate::cleaner::CleanerImages;
use crate::clients::{KubeSeedClient, KubeShootClientFactory, SeedClient, ShootClientFactory};
use crate::managed_resources::{KubeManagedResources, ManagedResourceClient};
use crate::secrets::{KubeSecretStore, SecretStore};

/// Requeue delay after a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue delay after a failure that needs a configuration fix
pub const CONFIGURATION_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Interval of periodic reconciles of healthy extensions
pub const SYNC_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Extension class used when none is set
pub const DEFAULT_EXTENSION_CLASS: &str = "shoot";

/// Static controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Image of the cache workloads
    pub registry_image: String,
    /// Images of the configuration cleaner
    pub cleaner_images: CleanerImages,
    /// Only handle extensions of this class
    pub extension_class: Option<String>,
}

/// Shared context for the extension controller
pub struct Context {
    /// Seed API operations
    pub seed: Arc<dyn SeedClient>,
    /// Shoot client construction
    pub shoots: Arc<dyn ShootClientFactory>,
    /// Managed-resource delivery
    pub managed_resources: Arc<dyn ManagedResourceClient>,
    /// Storage of managed secrets
    pub secrets: Arc<dyn SecretStore>,
    /// Static settings
    pub config: ControllerConfig,
}

impl Context {
    /// Production context talking to the seed through `client`
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            seed: Arc::new(KubeSeedClient::new(client.clone())),
            shoots: Arc::new(KubeShootClientFactory::new(client.clone())),
            managed_resources: Arc::new(KubeManagedResources::new(client.clone())),
            secrets: Arc::new(KubeSecretStore::new(client)),
            config,
        }
    }

    /// Context backed by mocks
    #[cfg(test)]
    pub fn for_testing(
        seed: Arc<dyn SeedClient>,
        shoots: Arc<dyn ShootClientFactory>,
        managed_resources: Arc<dyn ManagedResourceClient>,
        secrets: Arc<dyn SecretStore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            seed,
            shoots,
            managed_resources,
            secrets,
            config,
        }
    }
}

/// Actuator operation selected for an extension
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Bring the shoot in line with the provider config
    Reconcile,
    /// Reconcile after a migration
    Restore,
    /// Remove everything, waiting for the shoot
    Delete,
    /// Remove everything without waiting
    ForceDelete,
    /// Release the shoot objects to another seed
    Migrate,
}

impl Operation {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Reconcile => "reconcile",
            Operation::Restore => "restore",
            Operation::Delete => "delete",
            Operation::ForceDelete => "force_delete",
            Operation::Migrate => "migrate",
        }
    }

    /// `lastOperation.type` for this operation on `ext`
    pub fn last_operation_type(&self, ext: &Extension) -> LastOperationType {
        match self {
            Operation::Reconcile => {
                let created = ext
                    .status
                    .as_ref()
                    .and_then(|s| s.last_operation.as_ref())
                    .is_some();
                if created {
                    LastOperationType::Reconcile
                } else {
                    LastOperationType::Create
                }
            }
            Operation::Restore => LastOperationType::Restore,
            Operation::Delete | Operation::ForceDelete => LastOperationType::Delete,
            Operation::Migrate => LastOperationType::Migrate,
        }
    }

    /// Whether the finalizer goes away after success
    pub fn releases_extension(&self) -> bool {
        matches!(
            self,
            Operation::Delete | Operation::ForceDelete | Operation::Migrate
        )
    }

    fn verb(&self) -> &'static str {
        match self {
            Operation::Reconcile => "reconciliation",
            Operation::Restore => "restoration",
            Operation::Delete | Operation::ForceDelete => "deletion",
            Operation::Migrate => "migration",
        }
    }
}

/// Whether this controller instance handles `ext`
pub fn is_responsible(ext: &Extension, class: Option<&str>) -> bool {
    ext.spec.type_ == EXTENSION_TYPE
        && ext.spec.class.as_deref().unwrap_or(DEFAULT_EXTENSION_CLASS)
            == class.unwrap_or(DEFAULT_EXTENSION_CLASS)
}

/// Pick the operation for `ext`
pub fn determine_operation(ext: &Extension, shoot: &Shoot) -> Operation {
    if ext.is_being_deleted() {
        return if shoot.is_force_deletion() {
            Operation::ForceDelete
        } else {
            Operation::Delete
        };
    }
    match ext.requested_operation() {
        Some(OPERATION_MIGRATE) => Operation::Migrate,
        Some(OPERATION_RESTORE) => Operation::Restore,
        _ => Operation::Reconcile,
    }
}

/// Time until `ext` needs work again, `None` if it needs work now
///
/// Status-only updates (including our own) trigger the watch. A healthy,
/// unchanged extension waits for the sync period; one whose last operation
/// failed on its current generation waits out the retry interval.
pub fn time_until_resync(ext: &Extension, now: DateTime<Utc>) -> Option<Duration> {
    if ext.requested_operation().is_some() {
        return None;
    }
    let status = ext.status.as_ref()?;
    if status.observed_generation.is_none() || status.observed_generation != ext.metadata.generation {
        return None;
    }
    let last = status.last_operation.as_ref()?;
    let deleting = ext.is_being_deleted();
    let interval = match last.state {
        LastOperationState::Error if deleting == (last.type_ == LastOperationType::Delete) => {
            retry_interval(status.last_error.as_ref())
        }
        LastOperationState::Succeeded
            if !deleting
                && !matches!(last.type_, LastOperationType::Delete | LastOperationType::Migrate) =>
        {
            SYNC_PERIOD
        }
        _ => return None,
    };
    let updated = DateTime::parse_from_rfc3339(&last.last_update_time).ok()?;
    let elapsed = (now - updated.with_timezone(&Utc)).to_std().unwrap_or_default();
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Requeue delay matching the recorded error
fn retry_interval(last_error: Option<&LastError>) -> Duration {
    let configuration_problem = last_error
        .is_some_and(|e| e.codes.iter().any(|c| c == ERR_CONFIGURATION_PROBLEM));
    if configuration_problem {
        CONFIGURATION_RETRY_INTERVAL
    } else {
        RETRY_INTERVAL
    }
}

fn last_operation(
    type_: LastOperationType,
    state: LastOperationState,
    description: String,
    progress: i32,
    now: DateTime<Utc>,
) -> LastOperation {
    LastOperation {
        type_,
        state,
        description,
        last_update_time: now.to_rfc3339(),
        progress,
    }
}

async fn patch_status(ctx: &Context, ext: &Extension, status: Value) -> Result<()> {
    ctx.seed
        .patch_extension_status(&ext.namespace().unwrap_or_default(), &ext.name_any(), status)
        .await
}

async fn run_operation(ctx: &Context, op: Operation, ext: &Extension, shoot: &Shoot) -> Result<()> {
    match op {
        Operation::Reconcile | Operation::Restore => actuator::reconcile(ctx, ext, shoot).await,
        Operation::Delete => actuator::delete(ctx, ext, shoot).await,
        Operation::ForceDelete => actuator::force_delete(ctx, ext).await,
        Operation::Migrate => actuator::migrate(ctx, ext).await,
    }
}

/// Reconcile one Extension
#[instrument(skip(ext, ctx), fields(extension = %ext.name_any(), namespace = %ext.namespace().unwrap_or_default()))]
pub async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    if !is_responsible(&ext, ctx.config.extension_class.as_deref()) {
        return Ok(Action::await_change());
    }
    if ext.is_being_deleted() && !ext.has_finalizer(FINALIZER) {
        debug!("extension is being deleted and already released");
        return Ok(Action::await_change());
    }
    if let Some(wait) = time_until_resync(&ext, Utc::now()) {
        debug!(?wait, "extension is up to date");
        return Ok(Action::requeue(wait));
    }

    let namespace = ext.namespace().unwrap_or_default();
    let name = ext.name_any();

    if !ext.is_being_deleted() && !ext.has_finalizer(FINALIZER) {
        ctx.seed.add_finalizer(&namespace, &name).await?;
    }

    let shoot = ctx.seed.get_cluster(&namespace).await?.shoot()?;
    let op = determine_operation(&ext, &shoot);
    let type_ = op.last_operation_type(&ext);
    info!(operation = op.as_str(), "starting operation");

    let processing = last_operation(
        type_,
        LastOperationState::Processing,
        format!("Processing the {} of the registry-cache extension", op.verb()),
        1,
        Utc::now(),
    );
    patch_status(&ctx, &ext, json!({ "lastOperation": processing })).await?;

    let timer = OperationTimer::start(op.as_str());
    match run_operation(&ctx, op, &ext, &shoot).await {
        Ok(()) => {
            timer.success();
            let now = Utc::now();
            let succeeded = last_operation(
                type_,
                LastOperationState::Succeeded,
                format!("Successfully finished the {} of the registry-cache extension", op.verb()),
                100,
                now,
            );
            patch_status(
                &ctx,
                &ext,
                json!({
                    "lastOperation": succeeded,
                    "lastError": null,
                    "observedGeneration": ext.metadata.generation,
                }),
            )
            .await?;

            if ext.requested_operation().is_some() {
                ctx.seed.remove_operation_annotation(&namespace, &name).await?;
            }
            if op.releases_extension() {
                ctx.seed.remove_finalizer(&namespace, &name).await?;
                return Ok(Action::await_change());
            }
            info!(operation = op.as_str(), "operation succeeded");
            Ok(Action::requeue(SYNC_PERIOD))
        }
        Err(err) => {
            timer.error(err.kind());
            let now = Utc::now();
            let failed = last_operation(
                type_,
                LastOperationState::Error,
                format!("Error during the {} of the registry-cache extension: {}", op.verb(), err),
                50,
                now,
            );
            let last_error = LastError {
                description: err.to_string(),
                codes: err.codes(),
                last_update_time: Some(now.to_rfc3339()),
            };
            let status = json!({
                "lastOperation": failed,
                "lastError": last_error,
                "observedGeneration": ext.metadata.generation,
            });
            if let Err(patch_err) = patch_status(&ctx, &ext, status).await {
                warn!(error = %patch_err, "failed to record the operation error");
            }
            Err(err)
        }
    }
}

/// Requeue policy for failed reconciles
pub fn error_policy(ext: Arc<Extension>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = if error.is_retryable() {
        RETRY_INTERVAL
    } else {
        CONFIGURATION_RETRY_INTERVAL
    };
    error!(
        %error,
        extension = %ext.name_any(),
        namespace = %ext.namespace().unwrap_or_default(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Run the controller until the watch stream ends
pub async fn run(client: Client, ctx: Arc<Context>, max_concurrent_reconciles: u16) {
    let extensions: Api<Extension> = Api::all(client);
    Controller::new(extensions, WatcherConfig::default())
        .with_config(ControllerRuntimeConfig::default().concurrency(max_concurrent_reconciles))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(extension = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile loop error"),
            }
        })
        .await;
}
