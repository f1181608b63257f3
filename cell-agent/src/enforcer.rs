//! Replaces the policy chain without ever leaving the parent chain without
//! one.
//!
//! Each generation of rules lives in its own chain named `<prefix><suffix>`.
//! A new generation is fully populated before it is jumped to from the head
//! of the parent chain; only then are older generations detached and
//! destroyed.

use netpol_cell::{IpTables, Result, Rule};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Where managed chains live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSpec {
    pub table: String,
    pub parent: String,
    pub prefix: String,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct Enforcer<T> {
    iptables: T,
    chain: ChainSpec,
    clock: Clock,
    last: Mutex<u64>,
}

// === impl ChainSpec ===

impl ChainSpec {
    fn name(&self, suffix: u64) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Parses the generation of a managed chain.
    fn suffix(&self, chain: &str) -> Option<u64> {
        let digits = chain.strip_prefix(&self.prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

// === impl Enforcer ===

impl<T: IpTables> Enforcer<T> {
    pub fn new(iptables: T, chain: ChainSpec) -> Self {
        Self::with_clock(iptables, chain, Arc::new(unix_seconds))
    }

    pub fn with_clock(iptables: T, chain: ChainSpec, clock: Clock) -> Self {
        Self {
            iptables,
            chain,
            clock,
            last: Mutex::new(0),
        }
    }

    pub fn chain(&self) -> &ChainSpec {
        &self.chain
    }

    /// Installs `rules` as a new generation and returns its chain name.
    ///
    /// On failure the previous generation stays attached.
    pub async fn enforce(&self, rules: &[Rule]) -> Result<String> {
        let ChainSpec { table, parent, .. } = &self.chain;

        let existing = self.iptables.list_chains(table).await?;
        let newest = existing.iter().filter_map(|c| self.chain.suffix(c)).max();
        let suffix = {
            let mut last = self.last.lock();
            let next = (self.clock)()
                .max(*last + 1)
                .max(newest.map_or(0, |n| n + 1));
            *last = next;
            next
        };
        let chain = self.chain.name(suffix);

        self.iptables.new_chain(table, &chain).await?;
        if let Err(error) = self.iptables.append_all(table, &chain, rules).await {
            self.discard(&chain).await;
            return Err(error);
        }
        let jump = Rule::default().jump(chain.as_str());
        if let Err(error) = self.iptables.insert(table, parent, 1, &jump).await {
            self.discard(&chain).await;
            return Err(error);
        }
        info!(%chain, rules = rules.len(), "Attached policy chain");

        self.prune(suffix).await;
        Ok(chain)
    }

    /// Detaches and destroys every older generation, including ones left
    /// unattached by an earlier failure. Failures are logged; the next
    /// generation retries them.
    async fn prune(&self, current: u64) {
        let ChainSpec { table, parent, .. } = &self.chain;

        let jumps = match self.iptables.list(table, parent).await {
            Ok(jumps) => jumps,
            Err(error) => {
                warn!(%parent, %error, "Failed to list parent chain");
                return;
            }
        };
        let mut attached = Vec::new();
        for jump in jumps {
            let Some(target) = jump.target() else { continue };
            if !self.chain.suffix(target).is_some_and(|s| s < current) {
                continue;
            }
            let target = target.to_string();
            if let Err(error) = self.iptables.delete(table, parent, &jump).await {
                warn!(chain = %target, %error, "Failed to detach policy chain");
                attached.push(target);
                continue;
            }
            self.destroy(&target).await;
        }

        let chains = match self.iptables.list_chains(table).await {
            Ok(chains) => chains,
            Err(error) => {
                warn!(%table, %error, "Failed to list chains");
                return;
            }
        };
        for chain in chains {
            if self.chain.suffix(&chain).is_some_and(|s| s < current) && !attached.contains(&chain)
            {
                debug!(%chain, "Removing unattached policy chain");
                self.destroy(&chain).await;
            }
        }
    }

    async fn destroy(&self, chain: &str) {
        let table = &self.chain.table;
        if let Err(error) = self.iptables.flush_chain(table, chain).await {
            warn!(%chain, %error, "Failed to flush policy chain");
            return;
        }
        if let Err(error) = self.iptables.delete_chain(table, chain).await {
            warn!(%chain, %error, "Failed to delete policy chain");
        }
    }

    /// Removes a generation that was never attached.
    async fn discard(&self, chain: &str) {
        warn!(%chain, "Discarding incomplete policy chain");
        self.destroy(chain).await;
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
