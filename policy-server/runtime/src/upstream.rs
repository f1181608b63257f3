use http::StatusCode;
use netpol_policy_server_core::UpstreamError;
use serde::de::DeserializeOwned;
use std::{path::Path, time::Duration};
use url::Url;

/// Builds the HTTP client shared by the inventory and UAA clients.
pub(crate) fn client(timeout: Duration, ca: Option<&Path>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("netpol-policy-server/", env!("CARGO_PKG_VERSION")));
    if let Some(path) = ca {
        let pem = std::fs::read(path)?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
            builder = builder.add_root_certificate(cert);
        }
    }
    Ok(builder.build()?)
}

/// Parses `base` so that relative paths resolve beneath it.
pub(crate) fn base_url(base: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn endpoint(
    service: &'static str,
    base: &Url,
    path: &str,
) -> Result<Url, UpstreamError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|error| UpstreamError::fatal(service, format!("invalid url {path}: {error}")))
}

pub(crate) fn request_failed(service: &'static str, error: reqwest::Error) -> UpstreamError {
    if error.is_decode() {
        return UpstreamError::fatal(service, format!("invalid response: {error}"));
    }
    UpstreamError::retryable(service, error)
}

/// Classifies an unexpected status: server-side failures may be retried.
pub(crate) fn bad_status(service: &'static str, status: StatusCode, body: &str) -> UpstreamError {
    let message = format!("unexpected status {status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        UpstreamError::retryable(service, message)
    } else {
        UpstreamError::fatal(service, message)
    }
}

pub(crate) async fn json<T: DeserializeOwned>(
    service: &'static str,
    rsp: reqwest::Response,
) -> Result<T, UpstreamError> {
    let status = rsp.status();
    if !status.is_success() {
        let body = rsp.text().await.unwrap_or_default();
        return Err(bad_status(service, status, &body));
    }
    rsp.json().await.map_err(|e| request_failed(service, e))
}
