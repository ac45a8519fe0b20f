use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// One end of an established connection: a resolved IP address and a
/// port.
///
/// An [AddressInfo] always holds both parts; there is no "unresolved"
/// state. Sockets carry two of them, see `Socket::local_address` and
/// `Socket::remote_address` in netsock-network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct AddressInfo {
    ip: IpAddr,
    port: u16,
}

impl AddressInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip_address(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }

    /// Check whether both addresses designate the same endpoint.
    ///
    /// Two loopback addresses with the same port are considered to be
    /// the same endpoint, whatever their family. This is what
    /// connecting to "localhost" looks like from both sides.
    pub fn same_endpoint(&self, other: &AddressInfo) -> bool {
        if self.port != other.port {
            return false;
        }
        if self.is_loopback() && other.is_loopback() {
            return true;
        }

        self.ip.to_canonical() == other.ip.to_canonical()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for AddressInfo {
    fn from(addr: SocketAddr) -> Self {
        AddressInfo {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<AddressInfo> for SocketAddr {
    fn from(addr: AddressInfo) -> Self {
        addr.to_socket_addr()
    }
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr takes care of putting IPv6 addresses between [].
        fmt::Display::fmt(&self.to_socket_addr(), f)
    }
}

/// Returned when parsing an [AddressInfo] from a string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address '{0}'; expected ip:port or [ipv6]:port")]
pub struct AddressParseError(String);

impl FromStr for AddressInfo {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(AddressInfo::from)
            .map_err(|_| AddressParseError(s.to_string()))
    }
}

impl serde::Serialize for AddressInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for AddressInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_ipv4() -> anyhow::Result<()> {
        let addr: AddressInfo = "127.0.0.1:1234".parse()?;
        assert_eq!(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.ip_address());
        assert_eq!(1234, addr.port());

        Ok(())
    }

    #[test]
    fn parse_ipv6() -> anyhow::Result<()> {
        let addr: AddressInfo = "[::1]:4043".parse()?;
        assert_eq!(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.ip_address());
        assert_eq!(4043, addr.port());
        assert_eq!("[::1]:4043", addr.to_string());

        Ok(())
    }

    #[test]
    fn parse_invalid() {
        assert!("localhost:1234".parse::<AddressInfo>().is_err());
        assert!("127.0.0.1".parse::<AddressInfo>().is_err());
        assert!("127.0.0.1:70000".parse::<AddressInfo>().is_err());
        assert!("".parse::<AddressInfo>().is_err());
    }

    #[test]
    fn socket_addr_conversion() {
        let socket_addr = SocketAddr::from(([10, 0, 0, 1], 9000));
        let addr = AddressInfo::from(socket_addr);
        assert_eq!("10.0.0.1:9000", addr.to_string());
        assert_eq!(socket_addr, SocketAddr::from(addr));
    }

    #[test]
    fn same_endpoint_ignores_loopback_family() {
        let v4 = AddressInfo::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234);
        let v6 = AddressInfo::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1234);
        assert!(v4.same_endpoint(&v6));
        assert!(!v4.same_endpoint(&AddressInfo::new(v4.ip_address(), 1235)));

        let mapped = AddressInfo::new(
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()),
            80,
        );
        let plain = AddressInfo::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80);
        assert!(mapped.same_endpoint(&plain));
        assert!(!plain.same_endpoint(&AddressInfo::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80
        )));
    }

    #[test]
    fn serde_as_string() -> anyhow::Result<()> {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Endpoint {
            addr: AddressInfo,
        }

        let endpoint: Endpoint = toml::from_str(r#"addr = "192.168.1.100:8080""#)?;
        assert_eq!(
            AddressInfo::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 8080),
            endpoint.addr
        );
        assert_eq!("addr = \"192.168.1.100:8080\"\n", toml::to_string(&endpoint)?);

        assert!(toml::from_str::<Endpoint>(r#"addr = "nope""#).is_err());

        Ok(())
    }
}
