//! Registry cache actuator
//!
//! Reconcile order: services, service health, certificates, cleanup of
//! removed upstreams, cache workloads, monitoring, status, secret cleanup.
//! Each step is idempotent; a failed step is retried from the start on the
//! next reconcile and nothing is rolled back.

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::Utc;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use registry_cache_api::helper::compute_upstream_label_value;
use registry_cache_api::{
    decode_registry_config_value, decode_registry_status, encode_registry_status,
    validate_registry_config, Path, RegistryCache, RegistryConfig, RegistryStatus,
};
use registry_cache_common::gardener::{Extension, Shoot};
use registry_cache_common::{Error, Result, REFERENCED_RESOURCE_PREFIX};

use crate::cleaner;
use crate::clients::SeedClient;
use crate::composer::cache::{compose_caches, CacheInputs, ComposeOptions, UpstreamCredentials};
use crate::composer::monitoring::compose_monitoring;
use crate::composer::services::{
    cluster_ip, compose_services, compute_status, find_service, is_cache_service,
};
use crate::controller::Context;
use crate::managed_resources::{
    destroy, destroy_now, BundleOptions, CACHES_BUNDLE, DEFAULT_TIMEOUT, SERVICES_BUNDLE,
};
use crate::secrets::{purge, SecretsManager, ServerCertificate};

/// Key of the user name in an upstream credentials secret
pub const USERNAME_KEY: &str = "username";

/// Key of the password in an upstream credentials secret
pub const PASSWORD_KEY: &str = "password";

/// Decode and validate the provider config of an extension
pub fn registry_config(ext: &Extension) -> Result<RegistryConfig> {
    let raw = ext
        .spec
        .provider_config
        .as_ref()
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::decode("providerConfig is required for the registry-cache extension"))?;

    let config = decode_registry_config_value(raw)
        .map_err(|e| Error::decode(format!("failed to decode providerConfig: {}", e)))?;

    let errs = validate_registry_config(&config, &Path::new("providerConfig"));
    if let Some(first) = errs.iter().next() {
        return Err(Error::validation_for_field(
            ext.name_any(),
            first.field.clone(),
            errs.to_string(),
        ));
    }
    Ok(config)
}

/// Decode the provider status last written for an extension
pub fn previous_status(ext: &Extension) -> Result<Option<RegistryStatus>> {
    ext.provider_status()
        .filter(|v| !v.is_null())
        .map(|v| {
            decode_registry_status(v)
                .map_err(|e| Error::decode(format!("failed to decode providerStatus: {}", e)))
        })
        .transpose()
}

/// Upstreams present in `previous` but not in `config`, in status order
pub fn removed_upstreams(previous: &RegistryStatus, config: &RegistryConfig) -> Vec<String> {
    let current: BTreeSet<&str> = config.upstreams().into_iter().collect();
    previous
        .upstreams()
        .into_iter()
        .filter(|u| !current.contains(u))
        .map(str::to_string)
        .collect()
}

fn secret_string(data: &k8s_openapi::ByteString, secret: &str, key: &str) -> Result<String> {
    String::from_utf8(data.0.clone())
        .map_err(|_| Error::decode(format!("secret {} key {} is not valid UTF-8", secret, key)))
}

/// Resolve the credentials referenced by a cache
pub async fn resolve_credentials(
    seed: &dyn SeedClient,
    namespace: &str,
    shoot: &Shoot,
    cache: &RegistryCache,
) -> Result<Option<UpstreamCredentials>> {
    let Some(reference) = cache.secret_reference_name.as_deref() else {
        return Ok(None);
    };

    let resource = shoot
        .find_resource(reference)
        .filter(|r| r.resource_ref.kind == "Secret")
        .ok_or_else(|| {
            Error::decode(format!(
                "failed to find referenced resource with name {} and kind Secret",
                reference
            ))
        })?;

    let name = format!("{}{}", REFERENCED_RESOURCE_PREFIX, resource.resource_ref.name);
    let secret = seed
        .get_secret(namespace, &name)
        .await?
        .ok_or_else(|| Error::decode(format!("referenced secret {}/{} not found", namespace, name)))?;

    let data = secret.data.unwrap_or_default();
    let field = |key: &str| {
        data.get(key)
            .ok_or_else(|| Error::decode(format!("secret {} is missing key {}", name, key)))
            .and_then(|v| secret_string(v, &name, key))
    };

    Ok(Some(UpstreamCredentials {
        username: field(USERNAME_KEY)?,
        password: field(PASSWORD_KEY)?,
    }))
}

fn service_ip(services: &[Service], upstream: &str) -> Result<IpAddr> {
    find_service(services, upstream)
        .and_then(cluster_ip)
        .ok_or_else(|| Error::not_ready(format!("no cluster IP for the service of {}", upstream)))
}

/// Reconcile (and restore) the caches of one extension
#[instrument(skip(ctx, ext, shoot), fields(extension = %ext.name_any(), namespace = %ext.namespace().unwrap_or_default()))]
pub async fn reconcile(ctx: &Context, ext: &Extension, shoot: &Shoot) -> Result<()> {
    let namespace = ext.namespace().unwrap_or_default();
    let config = registry_config(ext)?;

    if shoot.is_hibernated() {
        info!("shoot is hibernated, skipping reconcile");
        return Ok(());
    }

    ctx.managed_resources
        .deploy(
            &namespace,
            SERVICES_BUNDLE,
            compose_services(&config)?,
            BundleOptions::for_shoot(),
        )
        .await
        .map_err(|e| e.in_step("deploy the registry cache services component"))?;
    ctx.managed_resources
        .wait_until_healthy(&namespace, SERVICES_BUNDLE, DEFAULT_TIMEOUT)
        .await
        .map_err(|e| e.in_step("wait for the registry cache services to become healthy"))?;

    let shoot_client = ctx.shoots.shoot_client(&namespace).await?;
    let services: Vec<Service> = shoot_client
        .list_cache_services()
        .await
        .map_err(|e| e.in_step("list the registry cache services"))?
        .into_iter()
        .filter(is_cache_service)
        .collect();
    if services.len() != config.caches.len() {
        return Err(Error::not_ready(format!(
            "not all services for all configured caches exist: found {}, expected {}",
            services.len(),
            config.caches.len()
        )));
    }

    let mut secrets = SecretsManager::load(ctx.secrets.as_ref(), &namespace, Utc::now()).await?;
    let mut ca_bundle = None;
    let mut certificates: Vec<Option<ServerCertificate>> = Vec::with_capacity(config.caches.len());
    if config.any_tls_enabled() {
        ca_bundle = Some(
            secrets
                .ensure_ca(shoot.ca_rotation())
                .await
                .map_err(|e| e.in_step("generate the CA certificate"))?,
        );
    }
    for cache in &config.caches {
        if !cache.tls_enabled() {
            certificates.push(None);
            continue;
        }
        let ip = service_ip(&services, &cache.upstream)?;
        let base = format!("{}-tls", compute_upstream_label_value(&cache.upstream));
        let cert = secrets
            .server_certificate(&base, &format!("{}-tls", cache.upstream), &[ip])
            .await
            .map_err(|e| e.in_step("generate the server certificates"))?;
        certificates.push(Some(cert));
    }

    let mut inputs = Vec::with_capacity(config.caches.len());
    for (cache, tls) in config.caches.iter().zip(certificates) {
        let credentials = resolve_credentials(ctx.seed.as_ref(), &namespace, shoot, cache)
            .await
            .map_err(|e| e.in_step("read the upstream credentials"))?;
        inputs.push(CacheInputs {
            cache,
            credentials,
            tls,
        });
    }

    if let Some(previous) = previous_status(ext)? {
        let removed = removed_upstreams(&previous, &config);
        if !removed.is_empty() {
            cleaner::clean(
                ctx.managed_resources.as_ref(),
                &namespace,
                &ctx.config.cleaner_images,
                false,
                &removed,
            )
            .await
            .map_err(|e| e.in_step("remove the configuration of removed upstreams"))?;
        }
    }

    let options = ComposeOptions {
        image: ctx.config.registry_image.clone(),
        vpa_enabled: shoot.is_vpa_enabled(),
    };
    ctx.managed_resources
        .deploy(
            &namespace,
            CACHES_BUNDLE,
            compose_caches(&inputs, &options)?,
            BundleOptions::for_shoot(),
        )
        .await
        .map_err(|e| e.in_step("deploy the registry caches component"))?;

    ctx.seed
        .apply_monitoring(&namespace, compose_monitoring(&namespace))
        .await
        .map_err(|e| e.in_step("deploy the monitoring configuration"))?;

    let status = compute_status(&config, &services, ca_bundle)?;
    let encoded = encode_registry_status(&status)?;
    ctx.seed
        .patch_extension_status(&namespace, &ext.name_any(), json!({ "providerStatus": encoded }))
        .await
        .map_err(|e| e.in_step("update the provider status"))?;

    secrets
        .cleanup()
        .await
        .map_err(|e| e.in_step("clean up obsolete secrets"))?;

    info!(caches = config.caches.len(), "reconciled registry caches");
    Ok(())
}

/// Remove the caches of an extension and wait for them to be gone
#[instrument(skip(ctx, ext, shoot), fields(extension = %ext.name_any(), namespace = %ext.namespace().unwrap_or_default()))]
pub async fn delete(ctx: &Context, ext: &Extension, shoot: &Shoot) -> Result<()> {
    let namespace = ext.namespace().unwrap_or_default();

    match previous_status(ext) {
        Ok(Some(previous)) if !previous.caches.is_empty() => {
            if shoot.is_hibernated() || shoot.is_being_deleted() {
                debug!("shoot has no nodes to clean, skipping the cleaner");
            } else {
                let upstreams: Vec<String> =
                    previous.upstreams().into_iter().map(str::to_string).collect();
                cleaner::clean(
                    ctx.managed_resources.as_ref(),
                    &namespace,
                    &ctx.config.cleaner_images,
                    true,
                    &upstreams,
                )
                .await
                .map_err(|e| e.in_step("remove the containerd configuration from nodes"))?;
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "ignoring undecodable provider status on delete"),
    }

    for (bundle, step) in [
        (CACHES_BUNDLE, "delete the registry caches component"),
        (SERVICES_BUNDLE, "delete the registry cache services component"),
    ] {
        destroy(ctx.managed_resources.as_ref(), &namespace, bundle, DEFAULT_TIMEOUT)
            .await
            .map_err(|e| e.in_step(step))?;
    }

    ctx.seed
        .delete_monitoring(&namespace)
        .await
        .map_err(|e| e.in_step("delete the monitoring configuration"))?;
    purge(ctx.secrets.as_ref(), &namespace)
        .await
        .map_err(|e| e.in_step("delete the managed secrets"))?;

    info!("deleted registry caches");
    Ok(())
}

/// Remove everything without waiting for the shoot side
#[instrument(skip(ctx, ext), fields(extension = %ext.name_any(), namespace = %ext.namespace().unwrap_or_default()))]
pub async fn force_delete(ctx: &Context, ext: &Extension) -> Result<()> {
    let namespace = ext.namespace().unwrap_or_default();
    for bundle in [CACHES_BUNDLE, SERVICES_BUNDLE] {
        destroy_now(ctx.managed_resources.as_ref(), &namespace, bundle)
            .await
            .map_err(|e| e.in_step("force delete the managed resources"))?;
    }
    ctx.seed.delete_monitoring(&namespace).await?;
    purge(ctx.secrets.as_ref(), &namespace).await?;
    info!("force deleted registry caches");
    Ok(())
}

/// Hand the shoot objects over to another seed
#[instrument(skip(ctx, ext), fields(extension = %ext.name_any(), namespace = %ext.namespace().unwrap_or_default()))]
pub async fn migrate(ctx: &Context, ext: &Extension) -> Result<()> {
    let namespace = ext.namespace().unwrap_or_default();
    for bundle in [CACHES_BUNDLE, SERVICES_BUNDLE] {
        ctx.managed_resources
            .set_keep_objects(&namespace, bundle, true)
            .await
            .map_err(|e| e.in_step("keep the shoot objects"))?;
    }
    for bundle in [CACHES_BUNDLE, SERVICES_BUNDLE] {
        destroy(ctx.managed_resources.as_ref(), &namespace, bundle, DEFAULT_TIMEOUT)
            .await
            .map_err(|e| e.in_step("delete the managed resources"))?;
    }
    ctx.seed
        .delete_monitoring(&namespace)
        .await
        .map_err(|e| e.in_step("delete the monitoring configuration"))?;
    info!("migrated registry caches");
    Ok(())
}
