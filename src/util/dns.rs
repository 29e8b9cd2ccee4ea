//! Timeout-bounded destination resolution.
//!
//! Domain names are handed to the platform resolver directly: one
//! lookup per call, no cache and no custom resolver configuration.

use crate::error::{ProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;
use tokio::time::{Duration, timeout};

const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve `host` (an IP literal or a domain name) plus `port` to a
/// concrete socket address, bounded by [`DNS_TIMEOUT`].
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = timeout(DNS_TIMEOUT, lookup_host((host, port)))
        .await
        .map_err(|_| ProxyError::Resolve(format!("timeout resolving {host}")))?
        .map_err(|err| ProxyError::Resolve(format!("{host}: {err}")))?;

    lookup
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::Resolve(format!("no address found for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ip_literal_without_a_lookup() {
        let addr = resolve_host("127.0.0.1", 9).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse().unwrap());
    }

    #[tokio::test]
    async fn resolves_ipv6_literal() {
        let addr = resolve_host("::1", 9).await.unwrap();
        assert_eq!(addr, "[::1]:9".parse().unwrap());
    }
}
