use crate::{Error, Tag};
use std::{collections::BTreeSet, fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// An inclusive, non-empty range of ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    start: u16,
    end: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid port range")]
pub struct InvalidPortRange(());

/// A directed allow record: containers of `source` may connect to containers
/// of `destination` over `protocol` on `ports`.
///
/// Field order matters: the derived ordering is the stable listing order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Policy {
    pub source: String,
    pub destination: String,
    pub protocol: Protocol,
    pub ports: PortRange,
}

/// A policy together with the tags of both of its endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedPolicy {
    pub policy: Policy,
    pub source_tag: Tag,
    pub destination_tag: Tag,
}

/// Restricts a listing to policies whose source or destination is one of the
/// given group keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter(Option<BTreeSet<String>>);

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(Error::bad_request("invalid destination protocol")),
        }
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, InvalidPortRange> {
        if start == 0 || start > end {
            return Err(InvalidPortRange(()));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Result<Self, InvalidPortRange> {
        Self::new(port, port)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

impl From<InvalidPortRange> for Error {
    fn from(e: InvalidPortRange) -> Self {
        Error::bad_request(e)
    }
}

// === impl Policy ===

impl Policy {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        protocol: Protocol,
        ports: PortRange,
    ) -> Result<Self, Error> {
        let source = source.into();
        if source.is_empty() {
            return Err(Error::bad_request("missing source id"));
        }
        let destination = destination.into();
        if destination.is_empty() {
            return Err(Error::bad_request("missing destination id"));
        }
        Ok(Self {
            source,
            destination,
            protocol,
            ports,
        })
    }

    /// Indicates whether either endpoint of this policy is `key`.
    pub fn involves(&self, key: &str) -> bool {
        self.source == key || self.destination == key
    }
}

// === impl Filter ===

impl Filter {
    /// Matches every policy.
    pub fn any() -> Self {
        Self(None)
    }

    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Some(keys.into_iter().map(Into::into).collect()))
    }

    pub fn as_keys(&self) -> Option<&BTreeSet<String>> {
        self.0.as_ref()
    }

    pub fn matches(&self, policy: &Policy) -> bool {
        match &self.0 {
            None => true,
            Some(keys) => keys.contains(&policy.source) || keys.contains(&policy.destination),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_policy(src: &str, dst: &str, start: u16, end: u16) -> Policy {
        Policy::new(src, dst, Protocol::Tcp, PortRange::new(start, end).unwrap()).unwrap()
    }

    #[test]
    fn port_ranges() {
        assert!(PortRange::new(8080, 8080).is_ok());
        assert!(PortRange::new(8000, 9000).is_ok());
        assert!(PortRange::new(0, 10).is_err());
        let err = PortRange::new(9000, 8000).unwrap_err();
        assert_eq!(err.to_string(), "invalid port range");
        assert_eq!(PortRange::single(53).unwrap().to_string(), "53");
        assert_eq!(PortRange::new(1, 3).unwrap().to_string(), "1:3");
    }

    #[test]
    fn policies_require_endpoints() {
        let ports = PortRange::single(80).unwrap();
        assert!(matches!(
            Policy::new("", "b", Protocol::Tcp, ports),
            Err(Error::BadRequest(msg)) if msg == "missing source id"
        ));
        assert!(matches!(
            Policy::new("a", "", Protocol::Udp, ports),
            Err(Error::BadRequest(msg)) if msg == "missing destination id"
        ));
    }

    #[test]
    fn protocols_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn policies_sort_by_endpoints_then_protocol_then_ports() {
        let mut policies = vec![
            mk_policy("b", "a", 80, 80),
            mk_policy("a", "b", 90, 95),
            mk_policy("a", "b", 80, 80),
            mk_policy("a", "a", 443, 443),
        ];
        policies.sort();
        let order = policies
            .iter()
            .map(|p| (p.source.as_str(), p.destination.as_str(), p.ports.start()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![("a", "a", 443), ("a", "b", 80), ("a", "b", 90), ("b", "a", 80)]
        );
    }

    #[test]
    fn filters_match_either_endpoint() {
        let policy = mk_policy("a", "b", 80, 80);
        assert!(Filter::any().matches(&policy));
        assert!(Filter::keys(["a"]).matches(&policy));
        assert!(Filter::keys(["b", "z"]).matches(&policy));
        assert!(!Filter::keys(["z"]).matches(&policy));
        assert!(!Filter::keys(Vec::<String>::new()).matches(&policy));
    }
}
