//! Listener and peer addresses.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Scheme used when an address carries no `scheme://` prefix.
pub const DEFAULT_SCHEME: &str = "http";

/// Address of either end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    Tcp(SocketAddr),
    Unix(PathBuf),
    /// Address of something that never binds a socket (in-memory or forwarded connections).
    Virtual(String),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(addr) => write!(f, "{}", addr),
            Addr::Unix(path) => write!(f, "unix:{}", path.display()),
            Addr::Virtual(name) => write!(f, "virtual:{}", name),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr::Tcp(addr)
    }
}

/// A parsed `[scheme://]host:port` listen address.
///
/// The scheme selects the protocol builder in a
/// [`ProtocolRegistry`](crate::server::ProtocolRegistry); the remainder is
/// handed to that builder untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    scheme: String,
    address: String,
}

impl ListenAddr {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The address without its scheme prefix.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Error returned when a listen address cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    #[error("listen address is empty")]
    Empty,
    #[error("listen address {0:?} has an empty scheme")]
    EmptyScheme(String),
    #[error("listen address {0:?} has no host or path")]
    MissingAddress(String),
}

impl FromStr for ListenAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrParseError::Empty);
        }

        let (scheme, address) = match s.split_once("://") {
            Some(("", _)) => return Err(AddrParseError::EmptyScheme(s.to_string())),
            Some((scheme, address)) => (scheme.to_ascii_lowercase(), address),
            None => (DEFAULT_SCHEME.to_string(), s),
        };

        if address.is_empty() {
            return Err(AddrParseError::MissingAddress(s.to_string()));
        }

        Ok(Self {
            scheme,
            address: address.to_string(),
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_defaults_to_http() {
        let addr: ListenAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr.scheme(), "http");
        assert_eq!(addr.address(), "127.0.0.1:8080");
    }

    #[test]
    fn explicit_scheme_is_lowercased() {
        let addr: ListenAddr = "TCP://0.0.0.0:9000".parse().unwrap();
        assert_eq!(addr.scheme(), "tcp");
        assert_eq!(addr.address(), "0.0.0.0:9000");

        let unix: ListenAddr = "unix:///run/hotline.sock".parse().unwrap();
        assert_eq!(unix.scheme(), "unix");
        assert_eq!(unix.address(), "/run/hotline.sock");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("".parse::<ListenAddr>(), Err(AddrParseError::Empty));
        assert!(matches!("://x:1".parse::<ListenAddr>(), Err(AddrParseError::EmptyScheme(_))));
        assert!(matches!("tcp://".parse::<ListenAddr>(), Err(AddrParseError::MissingAddress(_))));
    }
}
