use crate::metrics::AuthMetrics;
use ahash::AHashMap;
use http::{header, HeaderMap};
use netpol_policy_server_core::{Error, Introspect, Result, TokenInfo};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

pub const ADMIN_SCOPE: &str = "network.admin";
pub const WRITE_SCOPE: &str = "network.write";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// May manage any policy.
    Admin,
    /// May manage policies touching the subject's own spaces.
    Write,
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub token: TokenInfo,
    pub role: Role,
}

/// Validates bearer tokens, remembering successful validations for `ttl`.
#[derive(Clone)]
pub struct Authenticator {
    introspect: Arc<dyn Introspect>,
    cache: Arc<Mutex<AHashMap<String, Cached>>>,
    ttl: Duration,
    metrics: AuthMetrics,
}

#[derive(Clone, Debug)]
struct Cached {
    info: TokenInfo,
    expires: Instant,
}

// === impl Authenticator ===

impl Authenticator {
    pub fn new(introspect: Arc<dyn Introspect>, ttl: Duration, metrics: AuthMetrics) -> Self {
        Self {
            introspect,
            cache: Default::default(),
            ttl,
            metrics,
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Subject> {
        let token = bearer_token(headers)?;
        let info = self.token_info(token).await?;
        let role = if info.has_scope(ADMIN_SCOPE) {
            Role::Admin
        } else if info.has_scope(WRITE_SCOPE) {
            Role::Write
        } else {
            return Err(Error::Forbidden(format!(
                "provided scopes do not include {ADMIN_SCOPE} or {WRITE_SCOPE}"
            )));
        };
        Ok(Subject { token: info, role })
    }

    async fn token_info(&self, token: &str) -> Result<TokenInfo> {
        let now = Instant::now();
        if let Some(cached) = self.cache.lock().get(token) {
            if cached.expires > now {
                self.metrics.cache_hit();
                return Ok(cached.info.clone());
            }
        }
        self.metrics.cache_miss();

        let info = self
            .introspect
            .check_token(token)
            .await?
            .ok_or_else(|| Error::Unauthenticated("invalid bearer token".to_string()))?;

        let mut cache = self.cache.lock();
        cache.retain(|_, c| c.expires > now);
        cache.insert(
            token.to_string(),
            Cached {
                info: info.clone(),
                expires: now + self.ttl,
            },
        );
        Ok(info)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| Error::Unauthenticated("missing authorization header".to_string()))?;
    let malformed = || Error::Unauthenticated("invalid authorization header".to_string());
    let value = value.to_str().map_err(|_| malformed())?;
    let (scheme, token) = value.split_once(' ').ok_or_else(malformed)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(malformed());
    }
    Ok(token)
}
