//! Client for the platform's authorization service (UAA).

use crate::upstream;
use netpol_policy_server_core::{Introspect, TokenInfo, UpstreamError};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use url::Url;

const SERVICE: &str = "uaa";

/// Service tokens are replaced this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct UaaClient {
    http: reqwest::Client,
    base: Url,
    client_id: String,
    client_secret: String,
    service_token: Arc<Mutex<Option<ServiceToken>>>,
}

#[derive(Clone, Debug)]
struct ServiceToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct CheckTokenResponse {
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    user_name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

// === impl UaaClient ===

impl UaaClient {
    pub fn new(http: reqwest::Client, base: Url, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            base,
            client_id,
            client_secret,
            service_token: Default::default(),
        }
    }

    /// Returns a client-credentials token for calls made on the server's own
    /// behalf, fetching a new one when the cached token is close to expiry.
    pub async fn service_token(&self) -> Result<String, UpstreamError> {
        if let Some(token) = self.service_token.lock().as_ref() {
            if token.refresh_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = upstream::endpoint(SERVICE, &self.base, "oauth/token")?;
        let rsp = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| upstream::request_failed(SERVICE, e))?;
        let TokenResponse {
            access_token,
            expires_in,
        } = upstream::json(SERVICE, rsp).await?;

        let lifetime = Duration::from_secs(expires_in).saturating_sub(REFRESH_MARGIN);
        tracing::debug!(expires_in, "Fetched service token");
        *self.service_token.lock() = Some(ServiceToken {
            value: access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }
}

#[async_trait::async_trait]
impl Introspect for UaaClient {
    async fn check_token(&self, token: &str) -> Result<Option<TokenInfo>, UpstreamError> {
        let url = upstream::endpoint(SERVICE, &self.base, "check_token")?;
        let rsp = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| upstream::request_failed(SERVICE, e))?;

        // The UAA answers 400 for malformed and expired tokens alike.
        let status = rsp.status();
        if status == http::StatusCode::BAD_REQUEST || status == http::StatusCode::UNAUTHORIZED {
            let body = rsp.text().await.unwrap_or_default();
            tracing::debug!(%status, body = %body.trim(), "Token rejected");
            return Ok(None);
        }

        let CheckTokenResponse {
            scope,
            user_id,
            user_name,
        } = upstream::json(SERVICE, rsp).await?;
        Ok(Some(TokenInfo {
            scopes: scope,
            user_id,
            user_name,
        }))
    }
}
