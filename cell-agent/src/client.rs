//! Fetches tagged policies from the policy server's internal API.

use netpol_policy_server_core::{Policy, PortRange, Protocol, Tag, TaggedPolicy, UpstreamError};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use url::Url;

const SERVICE: &str = "policy-server";

/// A source of the policies that apply to this cell.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    /// Returns every policy whose source or destination is one of `keys`,
    /// with both endpoint tags.
    async fn policies(&self, keys: &[String]) -> Result<Vec<TaggedPolicy>, UpstreamError>;
}

/// Calls the internal API over mutually-authenticated TLS.
#[derive(Clone, Debug)]
pub struct InternalClient {
    http: reqwest::Client,
    url: Url,
}

#[derive(Debug, Deserialize)]
struct PoliciesJson {
    #[serde(default)]
    policies: Vec<PolicyJson>,
}

#[derive(Debug, Deserialize)]
struct PolicyJson {
    source: EndpointJson,
    destination: DestinationJson,
}

#[derive(Debug, Deserialize)]
struct EndpointJson {
    id: String,
    tag: String,
}

#[derive(Debug, Deserialize)]
struct DestinationJson {
    id: String,
    tag: String,
    protocol: String,
    ports: PortsJson,
}

#[derive(Debug, Deserialize)]
struct PortsJson {
    start: u16,
    end: u16,
}

// === impl InternalClient ===

impl InternalClient {
    pub fn new(http: reqwest::Client, base: &Url) -> anyhow::Result<Self> {
        let url = base.join("v1/internal/policies")?;
        Ok(Self { http, url })
    }

    /// Builds a client that presents `cert`/`key` and trusts only `ca`.
    pub fn mtls_client(
        cert: &Path,
        key: &Path,
        ca: &Path,
        timeout: Duration,
    ) -> anyhow::Result<reqwest::Client> {
        let mut identity = std::fs::read(cert)?;
        identity.push(b'\n');
        identity.extend(std::fs::read(key)?);
        let ca = std::fs::read(ca)?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .tls_built_in_root_certs(false)
            .identity(reqwest::Identity::from_pem(&identity)?)
            .user_agent(concat!("netpol-cell-agent/", env!("CARGO_PKG_VERSION")));
        for cert in reqwest::Certificate::from_pem_bundle(&ca)? {
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder.build()?)
    }

    fn request_url(&self, keys: &[String]) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("id", &keys.join(","));
        url
    }
}

#[async_trait::async_trait]
impl PolicySource for InternalClient {
    async fn policies(&self, keys: &[String]) -> Result<Vec<TaggedPolicy>, UpstreamError> {
        // An empty filter would select every policy.
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let rsp = self
            .http
            .get(self.request_url(keys))
            .send()
            .await
            .map_err(|error| UpstreamError::retryable(SERVICE, error))?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            let message = format!("unexpected status {status}: {}", body.trim());
            return Err(if status.is_server_error() {
                UpstreamError::retryable(SERVICE, message)
            } else {
                UpstreamError::fatal(SERVICE, message)
            });
        }
        let bytes = rsp
            .bytes()
            .await
            .map_err(|error| UpstreamError::retryable(SERVICE, error))?;
        decode(&bytes)
    }
}

fn decode(bytes: &[u8]) -> Result<Vec<TaggedPolicy>, UpstreamError> {
    let invalid = |message: String| UpstreamError::fatal(SERVICE, message);
    let json = serde_json::from_slice::<PoliciesJson>(bytes)
        .map_err(|error| invalid(format!("invalid response: {error}")))?;
    json.policies
        .into_iter()
        .map(|p| {
            let protocol = p
                .destination
                .protocol
                .parse::<Protocol>()
                .map_err(|error| invalid(error.to_string()))?;
            let ports = PortRange::new(p.destination.ports.start, p.destination.ports.end)
                .map_err(|error| invalid(error.to_string()))?;
            let source_tag = parse_tag(&p.source.tag).map_err(&invalid)?;
            let destination_tag = parse_tag(&p.destination.tag).map_err(&invalid)?;
            let policy = Policy::new(p.source.id, p.destination.id, protocol, ports)
                .map_err(|error| invalid(error.to_string()))?;
            Ok(TaggedPolicy {
                policy,
                source_tag,
                destination_tag,
            })
        })
        .collect()
}

fn parse_tag(hex: &str) -> Result<Tag, String> {
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(Tag::new)
        .ok_or_else(|| format!("invalid tag {hex:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_tagged_policies() {
        let body = json!({
            "total_policies": 1,
            "policies": [{
                "source": {"id": "app-a", "tag": "0001"},
                "destination": {
                    "id": "app-b",
                    "tag": "00ff",
                    "protocol": "tcp",
                    "ports": {"start": 8080, "end": 8090}
                }
            }]
        });
        let policies = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(
            policies,
            vec![TaggedPolicy {
                policy: Policy::new(
                    "app-a".to_string(),
                    "app-b".to_string(),
                    Protocol::Tcp,
                    PortRange::new(8080, 8090).unwrap(),
                )
                .unwrap(),
                source_tag: Tag::new(1).unwrap(),
                destination_tag: Tag::new(0xff).unwrap(),
            }]
        );
    }

    #[test]
    fn rejects_untagged_policies() {
        let body = json!({
            "policies": [{
                "source": {"id": "app-a", "tag": "0000"},
                "destination": {
                    "id": "app-b", "tag": "0002", "protocol": "tcp",
                    "ports": {"start": 80, "end": 80}
                }
            }]
        });
        let error = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(!error.is_retryable());
    }

    #[test]
    fn filters_by_group_keys() {
        let base = Url::parse("https://policy-server.internal:4003/").unwrap();
        let client = InternalClient::new(reqwest::Client::new(), &base).unwrap();
        let url = client.request_url(&["app-a".to_string(), "app-b".to_string()]);
        assert_eq!(
            url.as_str(),
            "https://policy-server.internal:4003/v1/internal/policies?id=app-a%2Capp-b"
        );
    }

    #[tokio::test]
    async fn no_groups_means_no_request() {
        // Nothing listens on this address; a request would fail.
        let base = Url::parse("https://127.0.0.1:1/").unwrap();
        let client = InternalClient::new(reqwest::Client::new(), &base).unwrap();
        assert_eq!(client.policies(&[]).await.unwrap(), vec![]);
    }
}
