//! Leader election over a `coordination.k8s.io/v1` Lease
//!
//! Only the leader runs the Extension controller; webhooks are served by
//! every replica. Writes carry the lease's resourceVersion, so two replicas
//! racing for the same lease see a 409 Conflict and one of them backs off.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kube_utils::is_not_found;

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("lease request failed: {0}")]
    Kube(#[from] kube::Error),

    /// The stored lease cannot be updated safely
    #[error("lease {name} has no resourceVersion")]
    MissingResourceVersion {
        /// Lease name
        name: String,
    },
}

/// Lease timing, mirroring the usual controller defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Pause between acquire and renew attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// What to do with the lease as it currently stands
#[derive(Debug, PartialEq)]
enum Claim {
    /// No lease exists yet
    Create(Lease),
    /// Renew our lease or take over a stale one
    Update(Lease),
    /// Another replica holds a valid lease
    Held(String),
}

fn lease_is_valid(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.holder_identity, &spec.renew_time, spec.lease_duration_seconds) {
        (Some(holder), Some(renewed), Some(secs)) if !holder.is_empty() => {
            now <= renewed.0 + chrono::Duration::seconds(i64::from(secs))
        }
        _ => false,
    }
}

fn claim(
    existing: Option<&Lease>,
    name: &str,
    identity: &str,
    timing: &LeaseTiming,
    now: DateTime<Utc>,
) -> Result<Claim, LeaderElectionError> {
    let duration_secs = i32::try_from(timing.lease_duration.as_secs()).unwrap_or(i32::MAX);
    let ours = |acquired: DateTime<Utc>, transitions: i32| LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(duration_secs),
        acquire_time: Some(MicroTime(acquired)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..Default::default()
    };

    let Some(lease) = existing else {
        return Ok(Claim::Create(Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ours(now, 0)),
        }));
    };

    let current = lease.spec.clone().unwrap_or_default();
    let held_by_us = current.holder_identity.as_deref() == Some(identity);
    if !held_by_us && lease_is_valid(&current, now) {
        return Ok(Claim::Held(current.holder_identity.unwrap_or_default()));
    }

    let resource_version = lease.metadata.resource_version.clone().ok_or_else(|| {
        LeaderElectionError::MissingResourceVersion {
            name: name.to_string(),
        }
    })?;
    let transitions = current.lease_transitions.unwrap_or(0);
    let spec = if held_by_us {
        let acquired = current.acquire_time.map(|t| t.0).unwrap_or(now);
        ours(acquired, transitions)
    } else {
        ours(now, transitions + 1)
    };
    Ok(Claim::Update(Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some(resource_version),
            ..Default::default()
        },
        spec: Some(spec),
    }))
}

/// Competes for one Lease as one identity
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    /// Elector for lease `namespace/lease_name` competing as `identity`
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timing: LeaseTiming,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing,
        }
    }

    /// Wait until the lease is ours, then keep renewing it in the background
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");
        loop {
            match self.try_claim().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(identity = %self.identity, error = %e, "failed to claim lease"),
            }
            tokio::time::sleep(self.timing.retry_period).await;
        }
        info!(identity = %self.identity, "leadership acquired");

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renewal = tokio::spawn(async move {
            elector.keep_renewing().await;
            let _ = lost_tx.send(());
        });
        LeaderGuard {
            elector: self,
            renewal,
            lost: Some(lost_rx),
        }
    }

    /// Create, renew or take over the lease; `false` while someone else holds it
    async fn try_claim(&self) -> Result<bool, LeaderElectionError> {
        let existing = self.api.get_opt(&self.lease_name).await?;
        let result = match claim(
            existing.as_ref(),
            &self.lease_name,
            &self.identity,
            &self.timing,
            Utc::now(),
        )? {
            Claim::Held(holder) => {
                debug!(%holder, "lease held by another replica");
                return Ok(false);
            }
            Claim::Create(lease) => self.api.create(&PostParams::default(), &lease).await,
            Claim::Update(lease) => {
                self.api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
        };
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("lost the race for the lease");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew until another replica takes over or renewal keeps failing past
    /// the renew deadline
    async fn keep_renewing(&self) {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.timing.retry_period).await;
            match self.try_claim().await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken over by another replica");
                    return;
                }
                Err(e) if last_renewal.elapsed() > self.timing.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "renew deadline exceeded");
                    return;
                }
                Err(e) => debug!(error = %e, "lease renewal failed, retrying"),
            }
        }
    }

    /// Hand the lease back so a standby takes over without waiting for expiry
    async fn release(&self) -> Result<(), LeaderElectionError> {
        let lease = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut spec = lease.spec.unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));

        let released = Lease {
            metadata: lease.metadata,
            spec: Some(spec),
        };
        self.api
            .replace(&self.lease_name, &PostParams::default(), &released)
            .await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Leadership held by this replica; renewal stops when dropped
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost.take() {
            let _ = rx.await;
        }
    }

    /// Stop renewing and release the lease
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.renewal.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
