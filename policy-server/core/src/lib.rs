#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod group;
mod policy;

pub use self::{
    error::{Error, Result, UpstreamError},
    group::{Group, GroupKind, InvalidTagWidth, Tag, TagWidth},
    policy::{Filter, InvalidPortRange, Policy, PortRange, Protocol, TaggedPolicy},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::time::{Duration, SystemTime};

/// Models the durable policy store shared by all policy-server replicas.
///
/// Every mutating operation runs in its own serializable transaction; callers
/// observe either all of a batch or none of it.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Lists policies matching `filter`, ordered by source, destination,
    /// protocol and port range.
    async fn list(&self, filter: Filter) -> Result<Vec<TaggedPolicy>>;

    /// Inserts `policies`, ignoring ones that already exist.
    ///
    /// When `max_per_source` is set, fails with [`Error::QuotaExceeded`] if any
    /// source group would be referenced by more policies than allowed.
    async fn create(&self, policies: Vec<Policy>, max_per_source: Option<usize>) -> Result<()>;

    /// Removes `policies`, returning the ones that actually existed.
    async fn delete(&self, policies: Vec<Policy>) -> Result<Vec<Policy>>;

    /// Reads every policy matching `filter` together with both endpoint tags
    /// in a single consistent read.
    async fn snapshot(&self, filter: Filter) -> Result<Vec<TaggedPolicy>>;

    /// Lists every group that currently holds a tag.
    async fn groups(&self) -> Result<Vec<Group>>;

    /// Returns the group for `key`, allocating the smallest free tag if the
    /// group does not exist yet.
    async fn ensure_tag(&self, key: String, kind: GroupKind) -> Result<Group>;

    /// Removes the groups named by `keys` that no policy references, releasing
    /// their tags. Returns the released groups.
    async fn release_tags(&self, keys: Vec<String>) -> Result<Vec<Group>>;
}

/// Answers questions about the platform's live application inventory.
#[async_trait::async_trait]
pub trait Inventory: Send + Sync {
    /// Returns the subset of `keys` naming applications that still exist.
    async fn live_apps(&self, keys: &[String]) -> Result<HashSet<String>, UpstreamError>;

    /// Maps each known application in `keys` to the space that owns it.
    async fn app_spaces(&self, keys: &[String]) -> Result<HashMap<String, String>, UpstreamError>;

    /// Returns the spaces in which `user_id` holds a developer role.
    async fn developer_spaces(&self, user_id: &str) -> Result<HashSet<String>, UpstreamError>;
}

/// Validates bearer tokens against the authorization service.
#[async_trait::async_trait]
pub trait Introspect: Send + Sync {
    /// Returns `None` when the authorization service rejects the token.
    async fn check_token(&self, token: &str) -> Result<Option<TokenInfo>, UpstreamError>;
}

/// The subject and scopes carried by a validated token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenInfo {
    pub scopes: Vec<String>,
    pub user_id: String,
    pub user_name: String,
}

/// A TTL lease on a named lock.
#[async_trait::async_trait]
pub trait LockService: Send + Sync {
    /// Acquires or renews `key` on behalf of `owner`.
    ///
    /// The returned claim describes whoever holds the lock after the attempt,
    /// which is not necessarily `owner`.
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<Claim>;

    /// Gives up `key` if `owner` currently holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub holder: String,
    pub expiry: SystemTime,
}

/// Removes policies that reference groups the inventory no longer knows.
#[async_trait::async_trait]
pub trait StaleCleanup: Send + Sync {
    async fn delete_stale(&self) -> anyhow::Result<Vec<Policy>>;
}

// === impl TokenInfo ===

impl TokenInfo {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

// === impl Claim ===

impl Claim {
    /// A claim that nobody holds.
    pub fn vacant() -> Self {
        Self {
            holder: String::new(),
            expiry: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_current(&self) -> bool {
        self.expiry > SystemTime::now()
    }

    pub fn is_current_for(&self, holder: &str) -> bool {
        self.holder == holder && self.is_current()
    }
}
