//! Removes policies that reference applications the inventory no longer
//! knows about.

use crate::lease;
use netpol_policy_server_core::{
    Claim, Error, Filter, Group, GroupKind, Inventory, Policy, PolicyStore, StaleCleanup,
    UpstreamError,
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PolicyStore>,
    inventory: Arc<dyn Inventory>,
    chunk_size: usize,
    timeout: Duration,
    metrics: ReconcileMetrics,
}

/// What a reconciliation removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub deleted: Vec<Policy>,
    pub released: Vec<Group>,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("reconciliation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("inventory lookup failed: {0}")]
    Inventory(#[from] UpstreamError),

    #[error("store operation failed: {0}")]
    Store(#[from] Error),
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    cycles: Family<CycleLabels, Counter>,
    deleted: Counter,
    released: Counter,
    leading: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CycleLabels {
    outcome: &'static str,
}

// === impl Reconciler ===

impl Reconciler {
    /// Each cycle is abandoned if it runs longer than `timeout`.
    pub fn new(
        store: Arc<dyn PolicyStore>,
        inventory: Arc<dyn Inventory>,
        chunk_size: usize,
        timeout: Duration,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inventory,
                chunk_size: chunk_size.max(1),
                timeout,
                metrics,
            }),
        }
    }

    /// Reconciles every `interval` while `owner` holds the lease.
    ///
    /// Losing the lease cancels the running cycle; the reconciler then waits
    /// to reacquire it. Returns when `shutdown` fires.
    pub async fn run(
        self,
        mut claims: watch::Receiver<Arc<Claim>>,
        owner: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            if !lease::acquired(&mut claims, &owner, &shutdown).await {
                return;
            }
            info!(%owner, "Leading reconciliation");
            self.inner.metrics.leading.set(1);

            let leading = shutdown.child_token();
            tokio::select! {
                () = self.lead(interval, &leading) => {}
                () = lease::lost(claims.clone(), &owner) => info!("Lease lost; standing by"),
                () = shutdown.cancelled() => {}
            }
            leading.cancel();
            self.inner.metrics.leading.set(0);

            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    async fn lead(&self, interval: Duration, leading: &CancellationToken) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let _ = self.cycle(&leading.child_token()).await;
        }
    }

    /// Runs one reconciliation bounded by the cycle timeout.
    pub async fn cycle(&self, cancel: &CancellationToken) -> Result<Outcome, CycleError> {
        let timeout = self.inner.timeout;
        let result = match time::timeout(timeout, self.reconcile(cancel)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(CycleError::TimedOut(timeout))
            }
        };

        let outcome = match &result {
            Ok(Outcome { deleted, released }) => {
                self.inner.metrics.deleted.inc_by(deleted.len() as u64);
                self.inner.metrics.released.inc_by(released.len() as u64);
                if deleted.is_empty() && released.is_empty() {
                    debug!("Nothing stale");
                } else {
                    info!(
                        policies = deleted.len(),
                        groups = released.len(),
                        "Removed stale policies and groups"
                    );
                }
                "ok"
            }
            Err(CycleError::Cancelled) => {
                debug!("Reconciliation cancelled");
                "cancelled"
            }
            Err(error @ CycleError::TimedOut(_)) => {
                warn!(%error, "Reconciliation abandoned");
                "timeout"
            }
            Err(error) => {
                warn!(%error, "Reconciliation failed");
                "error"
            }
        };
        self.inner
            .metrics
            .cycles
            .get_or_create(&CycleLabels { outcome })
            .inc();
        result
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> Result<Outcome, CycleError> {
        let Inner {
            store, inventory, ..
        } = &*self.inner;

        let snapshot = store.snapshot(Filter::any()).await?;
        // Router and other groups belong to the platform, not to an app.
        let keys = store
            .groups()
            .await?
            .into_iter()
            .filter(|g| g.kind == GroupKind::App)
            .map(|g| g.key)
            .collect::<Vec<_>>();

        let mut missing = BTreeSet::new();
        for chunk in keys.chunks(self.inner.chunk_size) {
            let live = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CycleError::Cancelled),
                res = inventory.live_apps(chunk) => res?,
            };
            missing.extend(chunk.iter().filter(|k| !live.contains(*k)).cloned());
        }
        if missing.is_empty() {
            return Ok(Outcome::default());
        }

        let stale = snapshot
            .into_iter()
            .map(|t| t.policy)
            .filter(|p| missing.contains(&p.source) || missing.contains(&p.destination))
            .collect::<Vec<_>>();
        debug!(keys = missing.len(), policies = stale.len(), "Found stale references");

        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        let deleted = if stale.is_empty() {
            Vec::new()
        } else {
            store.delete(stale).await?
        };
        let released = store.release_tags(missing.into_iter().collect()).await?;
        Ok(Outcome { deleted, released })
    }
}

#[async_trait::async_trait]
impl StaleCleanup for Reconciler {
    async fn delete_stale(&self) -> anyhow::Result<Vec<Policy>> {
        let outcome = self.cycle(&CancellationToken::new()).await?;
        Ok(outcome.deleted)
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "cycles",
            "Total number of reconciliation cycles by outcome",
            metrics.cycles.clone(),
        );
        reg.register(
            "deleted_policies",
            "Total number of stale policies deleted",
            metrics.deleted.clone(),
        );
        reg.register(
            "released_groups",
            "Total number of group tags released",
            metrics.released.clone(),
        );
        reg.register(
            "leading",
            "Whether this replica holds the reconciliation lease",
            metrics.leading.clone(),
        );
        metrics
    }
}

#[cfg(test)]
mod tests;
