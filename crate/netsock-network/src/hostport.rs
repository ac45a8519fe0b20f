use crate::error::ResolveError;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// HostPort represents a host and port, together with the addresses
/// the host resolved to.
///
/// The host is kept as given, as it's needed as TLS server name.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct HostPort {
    host: String,
    port: u16,
    addr: SocketAddr,
    others: Vec<SocketAddr>,
}

impl HostPort {
    /// Resolve the given host, which can be a host name or an IP
    /// address, and return a HostPort for it.
    ///
    /// IPv6 addresses may be written between [], as in URLs.
    pub async fn resolve(host: &str, port: u16) -> Result<Self, ResolveError> {
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(HostPort {
                host: host.to_string(),
                port,
                addr: SocketAddr::new(ip, port),
                others: vec![],
            });
        }

        let resolve_error = |source| ResolveError {
            host: host.to_string(),
            source,
        };
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(resolve_error)?;
        let addr = addrs.next().ok_or_else(|| {
            resolve_error(io::Error::new(
                io::ErrorKind::NotFound,
                "no address found",
            ))
        })?;

        Ok(HostPort {
            host: host.to_string(),
            port,
            addr,
            others: addrs.filter(|a| *a != addr).collect(),
        })
    }

    /// Address of the IPv4 loopback interface with the given port.
    pub fn localhost(port: u16) -> Self {
        HostPort {
            host: "localhost".to_string(),
            port,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            others: vec![],
        }
    }

    #[cfg(test)]
    pub(crate) fn with_addrs(host: &str, addr: SocketAddr, others: Vec<SocketAddr>) -> Self {
        HostPort {
            host: host.to_string(),
            port: addr.port(),
            addr,
            others,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }

    /// First address the host resolved to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All addresses the host resolved to, in resolver order.
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        std::iter::once(self.addr).chain(self.others.iter().copied())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
            others: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_ipv4() -> anyhow::Result<()> {
        let hp = HostPort::resolve("127.0.0.2", 8000).await?;
        assert_eq!(hp.host(), "127.0.0.2");
        assert_eq!(hp.port(), 8000);
        assert_eq!(hp.addr(), SocketAddr::from(([127, 0, 0, 2], 8000)));

        Ok(())
    }

    #[tokio::test]
    async fn resolve_ipv6() -> anyhow::Result<()> {
        let hp = HostPort::resolve("[::1]", 8000).await?;
        assert_eq!(hp.host(), "::1");
        assert_eq!(hp.addr().port(), 8000);
        assert!(hp.addr().ip().is_loopback());

        let hp = HostPort::resolve("::1", 8000).await?;
        assert_eq!(hp.host(), "::1");

        Ok(())
    }

    #[tokio::test]
    async fn resolve_hostname() -> anyhow::Result<()> {
        let hp = HostPort::resolve("localhost", 1234).await?;
        assert_eq!(hp.host(), "localhost");
        assert_eq!(hp.port(), 1234);
        assert_eq!(hp.addr().port(), 1234);
        assert!(hp.addr().ip().is_loopback());
        assert_eq!(Some(hp.addr()), hp.addrs().next());
        assert!(hp.addrs().all(|a| a.port() == 1234 && a.ip().is_loopback()));

        Ok(())
    }

    #[tokio::test]
    async fn resolve_invalid() {
        assert!(HostPort::resolve("doesnotexist.invalid", 1000).await.is_err());
        assert!(HostPort::resolve("bad host", 1000).await.is_err());
    }

    #[tokio::test]
    async fn from_socketaddr() -> anyhow::Result<()> {
        let hp1 = HostPort::resolve("127.0.0.1", 8000).await?;
        let hp2 = HostPort::from(hp1.addr());
        assert_eq!(hp1, hp2);

        Ok(())
    }

    #[test]
    fn display() {
        assert_eq!(HostPort::localhost(8000).to_string(), "localhost:8000");
        assert_eq!(
            HostPort::from(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 80))).to_string(),
            "[::1]:80"
        );
    }
}
