use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Turns server names into the IPv4 address the tunnels will target
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait HostResolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> io::Result<Ipv4Addr>;
}

/// Resolver backed by the system's name service
pub(crate) struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> io::Result<Ipv4Addr> {
        if let Ok(address) = host.parse::<Ipv4Addr>() {
            return Ok(address);
        }
        tokio::net::lookup_host((host, 0))
            .await?
            .find_map(|address| match address {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_lookup() {
        let address = SystemResolver.resolve_ipv4("10.1.2.3").await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback() {
        let address = SystemResolver.resolve_ipv4("localhost").await.unwrap();
        assert!(address.is_loopback());
    }
}
