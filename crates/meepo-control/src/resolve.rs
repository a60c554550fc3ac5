//! Address resolution and local listen address allocation

use crate::error::{MeepoError, MeepoResult};
use meepo_proto::{Addr, AddrError, Network};
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener};
use tracing::trace;

/// Resolve a wire `(network, address)` pair into an [`Addr`]
///
/// Host names are looked up; `tcp` prefers an IPv4 result, the family
/// specific networks only take their own family.
pub async fn resolve_addr(network: &str, address: &str) -> MeepoResult<Addr> {
    let network: Network = network.parse()?;
    let candidates = lookup_host(address)
        .await
        .map_err(|_| AddrError::InvalidAddress(address.to_string()))?;

    let chosen = pick(network, candidates)
        .ok_or_else(|| AddrError::InvalidAddress(address.to_string()))?;
    trace!(%network, address, resolved = %chosen, "address resolved");
    Ok(Addr::new(network, chosen)?)
}

fn pick(network: Network, candidates: impl Iterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut fallback = None;
    for candidate in candidates.filter(|a| network.accepts(a)) {
        if candidate.is_ipv4() || network == Network::Tcp6 {
            return Some(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    fallback
}

/// Resolve the initiator's local listen address as carried in a request
pub async fn resolve_teleportation_source_addr(network: &str, address: &str) -> MeepoResult<Addr> {
    resolve_addr(network, address).await
}

/// Resolve the address the sink will dial
pub async fn resolve_teleportation_sink_addr(network: &str, address: &str) -> MeepoResult<Addr> {
    resolve_addr(network, address).await
}

/// Bind a caller-chosen local address
///
/// The returned listener is the one the teleportation serves on, so the
/// address cannot be taken between the check and its use.
pub async fn check_addr_is_listenable(local: Addr) -> MeepoResult<(TcpListener, Addr)> {
    let listener = TcpListener::bind(local.socket_addr()).await?;
    let bound = Addr::new(local.kind(), listener.local_addr()?)?;
    Ok((listener, bound))
}

/// Bind an ephemeral port on `host`
pub async fn get_listenable_addr(host: &str) -> MeepoResult<(TcpListener, Addr)> {
    let candidates = lookup_host((host, 0))
        .await
        .map_err(|_| MeepoError::Addr(AddrError::InvalidAddress(host.to_string())))?;
    let ip = pick(Network::Tcp, candidates)
        .ok_or_else(|| AddrError::InvalidAddress(host.to_string()))?;
    check_addr_is_listenable(Addr::tcp(ip)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve_addr("tcp", "10.0.0.5:9000").await.unwrap();
        assert_eq!(addr.network(), "tcp");
        assert_eq!(addr.to_string(), "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn test_resolve_unsupported_network() {
        let err = resolve_addr("udp", "10.0.0.5:9000").await.unwrap_err();
        assert!(matches!(
            err,
            MeepoError::Addr(AddrError::UnsupportedNetwork(n)) if n == "udp"
        ));
    }

    #[tokio::test]
    async fn test_resolve_malformed_address() {
        assert!(resolve_addr("tcp", "not an address").await.is_err());
        assert!(resolve_addr("tcp6", "10.0.0.5:9000").await.is_err());
    }

    #[test]
    fn test_pick_prefers_ipv4_for_tcp() {
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();

        assert_eq!(pick(Network::Tcp, [v6, v4].into_iter()), Some(v4));
        assert_eq!(pick(Network::Tcp, [v6].into_iter()), Some(v6));
        assert_eq!(pick(Network::Tcp6, [v4, v6].into_iter()), Some(v6));
        assert_eq!(pick(Network::Tcp4, [v6].into_iter()), None);
    }

    #[tokio::test]
    async fn test_ephemeral_listener() {
        let (listener, addr) = get_listenable_addr("127.0.0.1").await.unwrap();
        assert_ne!(addr.socket_addr().port(), 0);
        assert_eq!(listener.local_addr().unwrap(), addr.socket_addr());
        assert_eq!(addr.network(), "tcp");
    }

    #[tokio::test]
    async fn test_taken_address_is_not_listenable() {
        let (_held, addr) = get_listenable_addr("127.0.0.1").await.unwrap();
        assert!(matches!(
            check_addr_is_listenable(addr).await,
            Err(MeepoError::Io(_))
        ));
    }
}
