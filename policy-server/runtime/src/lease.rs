use netpol_policy_server_core::{Claim, LockService};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub const LOCK_KEY: &str = "policy-owner";

/// Holds a named lease in the lock service on behalf of one replica.
pub struct LeaseManager {
    locks: Arc<dyn LockService>,
    key: String,
    owner: String,
    ttl: Duration,
}

// === impl LeaseManager ===

impl LeaseManager {
    pub fn new(locks: Arc<dyn LockService>, key: String, owner: String, ttl: Duration) -> Self {
        Self {
            locks,
            key,
            owner,
            ttl,
        }
    }

    /// Claims the lease and renews it at a third of its TTL until `shutdown`
    /// fires, publishing the current holder on the returned channel.
    ///
    /// A held lease is released on shutdown so another replica can take over
    /// without waiting for it to expire.
    pub fn spawn(self, shutdown: CancellationToken) -> (watch::Receiver<Arc<Claim>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Arc::new(Claim::vacant()));
        let span = info_span!("lease", key = %self.key);
        let task = tokio::spawn(self.run(tx, shutdown).instrument(span));
        (rx, task)
    }

    async fn run(self, tx: watch::Sender<Arc<Claim>>, shutdown: CancellationToken) {
        let renew = self.ttl / 3;
        loop {
            match self.locks.claim(&self.key, &self.owner, self.ttl).await {
                Ok(claim) => self.publish(&tx, claim),
                Err(error) => warn!(%error, "Failed to claim lease"),
            }

            tokio::select! {
                () = time::sleep(renew) => {}
                () = shutdown.cancelled() => break,
            }
        }

        let held = tx.borrow().holder == self.owner;
        if held {
            match self.locks.release(&self.key, &self.owner).await {
                Ok(()) => info!("Released lease"),
                Err(error) => warn!(%error, "Failed to release lease"),
            }
        }
        tx.send_replace(Arc::new(Claim::vacant()));
    }

    fn publish(&self, tx: &watch::Sender<Arc<Claim>>, claim: Claim) {
        tx.send_if_modified(|current| {
            let held = claim.holder == self.owner;
            if held != (current.holder == self.owner) {
                if held {
                    info!(owner = %self.owner, "Acquired lease");
                } else {
                    info!(holder = %claim.holder, "Lease held by another replica");
                }
            }
            if **current == claim {
                return false;
            }
            *current = Arc::new(claim);
            true
        });
    }
}

/// Waits until `owner` holds a current claim. Returns false if the lease
/// manager stops or `shutdown` fires first.
pub(crate) async fn acquired(
    claims: &mut watch::Receiver<Arc<Claim>>,
    owner: &str,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        if claims.borrow_and_update().is_current_for(owner) {
            return true;
        }
        tokio::select! {
            res = claims.changed() => {
                if res.is_err() {
                    return false;
                }
            }
            () = shutdown.cancelled() => return false,
        }
    }
}

/// Completes once `owner` no longer holds a current claim, either because
/// another holder was published or because the claim expired unrenewed.
pub(crate) async fn lost(mut claims: watch::Receiver<Arc<Claim>>, owner: &str) {
    loop {
        let claim = claims.borrow_and_update().clone();
        if !claim.is_current_for(owner) {
            return;
        }
        let remaining = claim
            .expiry
            .duration_since(std::time::SystemTime::now())
            .unwrap_or_default();
        tokio::select! {
            res = claims.changed() => {
                if res.is_err() {
                    return;
                }
            }
            () = time::sleep(remaining) => {}
        }
    }
}
