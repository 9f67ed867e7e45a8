//! Endpoints and resolved addresses.

use crate::error::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// The socket kind an endpoint resolves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    /// Connection-oriented stream socket (TCP).
    #[default]
    Stream,
    /// Message-oriented datagram socket (UDP).
    Datagram,
}

/// The address family an endpoint resolves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// Accept both IPv4 and IPv6 results.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

/// A resolution request: host, service, socket kind, family, and whether
/// the result will be bound (passive) or connected (active).
///
/// Immutable once built; construction is the only mutation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    service: String,
    kind: SocketKind,
    family: AddressFamily,
    passive: bool,
}

impl Endpoint {
    /// Creates an active stream endpoint for `host`/`service`.
    ///
    /// `service` must be a numeric port.
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            kind: SocketKind::Stream,
            family: AddressFamily::Any,
            passive: false,
        }
    }

    /// Selects stream sockets (the default).
    #[must_use]
    pub fn stream(mut self) -> Self {
        self.kind = SocketKind::Stream;
        self
    }

    /// Selects datagram sockets.
    #[must_use]
    pub fn datagram(mut self) -> Self {
        self.kind = SocketKind::Datagram;
        self
    }

    /// Restricts results to IPv4.
    #[must_use]
    pub fn v4(mut self) -> Self {
        self.family = AddressFamily::V4;
        self
    }

    /// Restricts results to IPv6.
    #[must_use]
    pub fn v6(mut self) -> Self {
        self.family = AddressFamily::V6;
        self
    }

    /// Marks the endpoint passive: an empty host resolves to the wildcard
    /// address suitable for binding.
    #[must_use]
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Returns the host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the socket kind.
    #[must_use]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Returns the address family restriction.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Returns whether this endpoint is passive.
    #[must_use]
    pub fn is_passive(&self) -> bool {
        self.passive
    }

    fn port(&self) -> Result<u16> {
        self.service
            .parse::<u16>()
            .map_err(|_| Error::invalid_argument(format!("service is not a port: {}", self.service)))
    }

    /// Resolves the endpoint on the calling thread.
    ///
    /// Most callers should go through the
    /// [`Resolver`](crate::net::resolve::Resolver) worker instead, which
    /// keeps `getaddrinfo` off latency-sensitive threads.
    ///
    /// # Errors
    ///
    /// `invalid_argument` for a non-numeric service, `not_found` when
    /// resolution yields no usable address, `io_error` on resolver
    /// failures.
    pub fn resolve_blocking(&self) -> Result<AddressList> {
        let port = self.port()?;

        if self.passive && self.host.is_empty() {
            let wildcard: Vec<Address> = match self.family {
                AddressFamily::V4 => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into()],
                AddressFamily::V6 => vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into()],
                AddressFamily::Any => vec![
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into(),
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into(),
                ],
            };
            return Ok(wildcard);
        }

        let candidates = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::from_io(e, format!("resolving {}:{port}", self.host)))?;
        let family = self.family;
        let filtered: Vec<Address> = candidates
            .filter(|addr| match family {
                AddressFamily::Any => true,
                AddressFamily::V4 => addr.is_ipv4(),
                AddressFamily::V6 => addr.is_ipv6(),
            })
            .map(Address::from)
            .collect();
        if filtered.is_empty() {
            return Err(Error::not_found(format!(
                "no addresses for {}:{}",
                self.host, self.service
            )));
        }
        Ok(filtered)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.service)
    }
}

/// A resolved socket address.
///
/// Displays as `host:port`, or `[host]:port` for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(SocketAddr);

impl Address {
    /// Returns the underlying socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Returns the IP part.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port part.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns true for IPv4 addresses.
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Candidate addresses in resolver preference order.
pub type AddressList = Vec<Address>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_addresses_display_as_host_port() {
        let addr: Address = "127.0.0.1:8080".parse::<SocketAddr>().unwrap().into();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn v6_addresses_display_bracketed() {
        let addr: Address = "[::1]:443".parse::<SocketAddr>().unwrap().into();
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[test]
    fn numeric_host_resolves_without_dns() {
        let list = Endpoint::new("127.0.0.1", "9000").resolve_blocking().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].port(), 9000);
        assert!(list[0].is_ipv4());
    }

    #[test]
    fn family_filter_applies() {
        let err = Endpoint::new("127.0.0.1", "9000").v6().resolve_blocking();
        assert!(err.is_err());
    }

    #[test]
    fn non_numeric_service_is_invalid() {
        let err = Endpoint::new("localhost", "http").resolve_blocking().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn passive_empty_host_yields_wildcards() {
        let list = Endpoint::new("", "0").passive().v4().resolve_blocking().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].ip().is_unspecified());
    }
}
