//! JSON shapes of the HTTP APIs and the per-version policy mappers.

use netpol_policy_server_core::{
    Error, Group, Policy, PortRange, Protocol, Result, TagWidth, TaggedPolicy,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The API version named by the first path segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    /// Destinations carry a single `port`.
    V0,
    /// Destinations carry a `ports` range.
    V1,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct PolicyJson {
    #[serde(default)]
    pub(crate) source: SourceJson,
    #[serde(default)]
    pub(crate) destination: DestinationJson,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct SourceJson {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tag: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct DestinationJson {
    #[serde(default)]
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tag: Option<String>,
    #[serde(default)]
    pub(crate) protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ports: Option<PortsJson>,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub(crate) struct PortsJson {
    pub(crate) start: u16,
    pub(crate) end: u16,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PoliciesRequest {
    #[serde(default)]
    pub(crate) policies: Vec<PolicyJson>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PoliciesResponse {
    pub(crate) total_policies: usize,
    pub(crate) policies: Vec<PolicyJson>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct TagJson {
    pub(crate) id: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) tag: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TagsResponse {
    pub(crate) tags: Vec<TagJson>,
}

// === impl ApiVersion ===

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V0 => "v0",
            Self::V1 => "v1",
        }
    }

    /// Converts a request object into a policy, validating every field.
    pub(crate) fn decode(&self, json: PolicyJson) -> Result<Policy> {
        let PolicyJson {
            source,
            destination,
        } = json;
        if source.id.is_empty() {
            return Err(Error::bad_request("missing source id"));
        }
        if destination.id.is_empty() {
            return Err(Error::bad_request("missing destination id"));
        }
        let protocol = Protocol::from_str(&destination.protocol)?;
        let ports = match self {
            Self::V0 => {
                let port = destination
                    .port
                    .ok_or_else(|| Error::bad_request("missing destination port"))?;
                PortRange::single(port)?
            }
            Self::V1 => {
                let ports = destination
                    .ports
                    .ok_or_else(|| Error::bad_request("missing destination ports"))?;
                PortRange::new(ports.start, ports.end)?
            }
        };
        Policy::new(source.id, destination.id, protocol, ports)
    }

    pub(crate) fn decode_all(&self, policies: Vec<PolicyJson>) -> Result<Vec<Policy>> {
        if policies.is_empty() {
            return Err(Error::bad_request("missing policies"));
        }
        policies.into_iter().map(|p| self.decode(p)).collect()
    }

    /// Renders a policy in this version's shape, optionally with tags.
    ///
    /// Fails for a v0 client when the policy spans more than one port.
    pub(crate) fn encode(
        &self,
        policy: &Policy,
        tags: Option<(&str, &str)>,
    ) -> Result<PolicyJson> {
        let (port, ports) = match self {
            Self::V0 if policy.ports.is_single() => (Some(policy.ports.start()), None),
            Self::V0 => {
                return Err(Error::UnsupportedByClientVersion(format!(
                    "policy from {} to {} uses port range {}, which API {} cannot express",
                    policy.source,
                    policy.destination,
                    policy.ports,
                    self.as_str(),
                )))
            }
            Self::V1 => (
                None,
                Some(PortsJson {
                    start: policy.ports.start(),
                    end: policy.ports.end(),
                }),
            ),
        };
        Ok(PolicyJson {
            source: SourceJson {
                id: policy.source.clone(),
                tag: tags.map(|(s, _)| s.to_string()),
            },
            destination: DestinationJson {
                id: policy.destination.clone(),
                tag: tags.map(|(_, d)| d.to_string()),
                protocol: policy.protocol.as_str().to_string(),
                port,
                ports,
            },
        })
    }

    pub(crate) fn encode_tagged(
        &self,
        policies: &[TaggedPolicy],
        width: TagWidth,
    ) -> Result<PoliciesResponse> {
        let policies = policies
            .iter()
            .map(|p| {
                let src = p.source_tag.to_hex(width);
                let dst = p.destination_tag.to_hex(width);
                self.encode(&p.policy, Some((&src, &dst)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PoliciesResponse {
            total_policies: policies.len(),
            policies,
        })
    }

    pub(crate) fn encode_untagged(&self, policies: &[Policy]) -> Result<PoliciesResponse> {
        let policies = policies
            .iter()
            .map(|p| self.encode(p, None))
            .collect::<Result<Vec<_>>>()?;
        Ok(PoliciesResponse {
            total_policies: policies.len(),
            policies,
        })
    }
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v0" => Ok(Self::V0),
            "v1" => Ok(Self::V1),
            _ => Err(Error::NotFound(format!("unsupported API version: {s}"))),
        }
    }
}

// === impl TagJson ===

impl TagJson {
    pub(crate) fn from_group(group: &Group, width: TagWidth) -> Self {
        Self {
            id: group.key.clone(),
            kind: group.kind.as_str().to_string(),
            tag: group.tag.to_hex(width),
        }
    }
}
