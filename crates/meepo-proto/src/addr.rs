//! Teleportation endpoint addresses
//!
//! On the wire an endpoint is a pair of strings: the network kind and the
//! address text. [`Addr`] is the typed form once the pair has been resolved.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address {address} does not belong to network {network}")]
    FamilyMismatch { network: Network, address: SocketAddr },
}

/// Network kinds the data path knows how to listen on and dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    /// Whether a socket address may be used on this network
    pub fn accepts(&self, address: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => address.is_ipv4(),
            Network::Tcp6 => address.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(AddrError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// A resolved teleportation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    network: Network,
    address: SocketAddr,
}

impl Addr {
    pub fn new(network: Network, address: SocketAddr) -> Result<Self, AddrError> {
        if !network.accepts(&address) {
            return Err(AddrError::FamilyMismatch { network, address });
        }
        Ok(Self { network, address })
    }

    pub fn tcp(address: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            address,
        }
    }

    /// Build from the wire pair when the address is a literal socket address
    pub fn from_parts(network: &str, address: &str) -> Result<Self, AddrError> {
        let network: Network = network.parse()?;
        let address: SocketAddr = address
            .parse()
            .map_err(|_| AddrError::InvalidAddress(address.to_string()))?;
        Self::new(network, address)
    }

    /// Network text, as carried in `localNetwork` / `remoteNetwork`
    pub fn network(&self) -> &'static str {
        self.network.as_str()
    }

    pub fn kind(&self) -> Network {
        self.network
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn with_port(&self, port: u16) -> Self {
        let mut address = self.address;
        address.set_port(port);
        Self {
            network: self.network,
            address,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Accepts `tcp://127.0.0.1:80`, `tcp6://[::1]:80` or a bare `127.0.0.1:80`
impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((network, address)) => Self::from_parts(network, address),
            None => Self::from_parts(Network::Tcp.as_str(), s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_scheme() {
        let addr: Addr = "tcp://10.0.0.5:9000".parse().unwrap();
        assert_eq!(addr.network(), "tcp");
        assert_eq!(addr.to_string(), "10.0.0.5:9000");
        assert_eq!(addr.socket_addr().port(), 9000);
    }

    #[test]
    fn test_parse_bare_defaults_to_tcp() {
        let addr: Addr = "127.0.0.1:5432".parse().unwrap();
        assert_eq!(addr.kind(), Network::Tcp);
    }

    #[test]
    fn test_unsupported_network() {
        assert_eq!(
            "udp://10.0.0.5:53".parse::<Addr>(),
            Err(AddrError::UnsupportedNetwork("udp".to_string()))
        );
        assert!(matches!(
            Addr::from_parts("unix", "/tmp/sock"),
            Err(AddrError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn test_family_mismatch() {
        assert!(matches!(
            "tcp6://10.0.0.5:9000".parse::<Addr>(),
            Err(AddrError::FamilyMismatch { .. })
        ));
        assert!("tcp6://[::1]:9000".parse::<Addr>().is_ok());
    }

    #[test]
    fn test_with_port() {
        let addr: Addr = "127.0.0.1:0".parse().unwrap();
        assert_eq!(addr.with_port(4000).to_string(), "127.0.0.1:4000");
    }
}
