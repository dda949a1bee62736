//! Transport endpoints, listen keys and URI parsing

use crate::{Result, SessionError, SessionHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Transport protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// URI scheme for this protocol
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(SessionError::InvalidArgument(format!(
                "unsupported protocol: {}",
                other
            ))),
        }
    }
}

/// Transport-level endpoint (address and port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl TransportEndpoint {
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn is_ip4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Same port with the unspecified address of the same family
    pub fn wildcard(&self) -> Self {
        let ip = match self.ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self { ip, port: self.port }
    }
}

impl From<SocketAddr> for TransportEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}/{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]/{}", ip, self.port),
        }
    }
}

/// Key of the listener table: endpoint plus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenKey {
    pub endpoint: TransportEndpoint,
    pub proto: Protocol,
}

impl ListenKey {
    pub fn new(endpoint: TransportEndpoint, proto: Protocol) -> Self {
        Self { endpoint, proto }
    }

    /// Parse a session URI such as `tcp://1.2.3.4/80`.
    ///
    /// The port may be separated by `/` or `:`; IPv6 addresses may be
    /// bracketed (`udp://[::1]:53`) or bare with a `/` port (`udp://::1/53`).
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let invalid = |why: &str| SessionError::InvalidArgument(format!("uri {:?}: {}", uri, why));

        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let proto = scheme.parse::<Protocol>().map_err(|_| invalid("unknown scheme"))?;

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            let port = tail
                .strip_prefix('/')
                .or_else(|| tail.strip_prefix(':'))
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else if let Some(split) = rest.rsplit_once('/') {
            split
        } else {
            rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
        };

        let ip = host.parse::<IpAddr>().map_err(|_| invalid("bad address"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        Ok(Self::new(TransportEndpoint::new(ip, port), proto))
    }

    /// The wildcard listener key that would also accept this destination
    pub fn wildcard(&self) -> Self {
        Self::new(self.endpoint.wildcard(), self.proto)
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl FromStr for ListenKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_uri(s)
    }
}

impl fmt::Display for ListenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto.scheme(), self.endpoint)
    }
}

/// Destination of a bind or connect: a URI or an explicit endpoint.
///
/// Exactly one of the two forms is carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointArg {
    Uri(String),
    Endpoint {
        endpoint: TransportEndpoint,
        proto: Protocol,
    },
}

impl EndpointArg {
    pub fn uri(uri: impl Into<String>) -> Self {
        EndpointArg::Uri(uri.into())
    }

    pub fn endpoint(endpoint: impl Into<TransportEndpoint>, proto: Protocol) -> Self {
        EndpointArg::Endpoint {
            endpoint: endpoint.into(),
            proto,
        }
    }

    /// Validate and turn into a listen key
    pub fn resolve(&self) -> Result<ListenKey> {
        match self {
            EndpointArg::Uri(uri) => ListenKey::parse_uri(uri),
            EndpointArg::Endpoint { endpoint, proto } => {
                if endpoint.port == 0 {
                    return Err(SessionError::InvalidArgument(format!(
                        "endpoint {} has no port",
                        endpoint
                    )));
                }
                Ok(ListenKey::new(*endpoint, *proto))
            }
        }
    }
}

/// What an unbind names: the listen key in either form, or the listener handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnbindTarget {
    Key(EndpointArg),
    Handle(SessionHandle),
}

impl From<EndpointArg> for UnbindTarget {
    fn from(arg: EndpointArg) -> Self {
        UnbindTarget::Key(arg)
    }
}

impl From<SessionHandle> for UnbindTarget {
    fn from(handle: SessionHandle) -> Self {
        UnbindTarget::Handle(handle)
    }
}
