//! Leader election on a coordination.k8s.io/v1 Lease
//!
//! Only the replica holding the lease runs controllers. Writes carry the
//! lease's resourceVersion so two replicas racing on an expired lease
//! cannot both win: the loser gets a 409 and keeps waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kube_utils::{is_conflict, is_not_found};
use crate::FIELD_MANAGER;

/// Lease name shared by all operator replicas
pub const LEADER_LEASE_NAME: &str = "tenancy-controllers";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as currently observed
#[derive(Debug, PartialEq, Eq)]
enum LeaseAction {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

/// Decide how to proceed given the current lease, if any
fn decide(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = existing else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration) {
        (Some(rt), Some(d)) => now > rt.0 + chrono::Duration::seconds(i64::from(d)),
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Lease-based leader elector
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard that keeps
    /// renewing the lease
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };

        let action = decide(existing.as_ref(), &self.identity, now);
        let write = match (action, existing) {
            (LeaseAction::Wait, _) => return Ok(false),
            (LeaseAction::Create, _) | (_, None) => api
                .create(&PostParams::default(), &self.lease(None, now, now, 0))
                .await
                .map(|_| ()),
            (action, Some(current)) => {
                let rv = current.metadata.resource_version.clone().ok_or_else(|| {
                    LeaderElectionError::MissingResourceVersion(self.lease_name.clone())
                })?;
                let spec = current.spec.unwrap_or_default();
                let (acquired, transitions) = match action {
                    LeaseAction::TakeOver { transitions } => (now, transitions + 1),
                    _ => (
                        spec.acquire_time.map(|t| t.0).unwrap_or(now),
                        spec.lease_transitions.unwrap_or(0),
                    ),
                };
                api.replace(
                    &self.lease_name,
                    &PostParams::default(),
                    &self.lease(Some(rv), acquired, now, transitions),
                )
                .await
                .map(|_| ())
            }
        };

        match write {
            Ok(()) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lease write conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for
    /// expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard held while this replica is leader
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership during graceful shutdown
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
    }
}
