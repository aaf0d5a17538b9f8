//! Textual `A.B.C.D:port` address codec.
//!
//! Parsing is lenient: a host that is not exactly four dotted octets becomes
//! `0.0.0.0`, an unparsable octet becomes `0`, and a missing or invalid port
//! becomes `0`.

use std::convert::Infallible;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// IPv4 host and port, as written on command lines and in configuration.
///
/// ## Example
///
/// ```rust
/// use tether_protocol::SocketAddress;
///
/// let address = SocketAddress::parse("127.0.0.1:4014");
/// assert_eq!(address.host(), [127, 0, 0, 1]);
/// assert_eq!(address.port(), 4014);
///
/// // Missing pieces default to zero
/// assert_eq!(SocketAddress::parse("10.0.0.2").port(), 0);
/// assert_eq!(SocketAddress::parse("localhost:80").host(), [0, 0, 0, 0]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketAddress
{
    host: [u8; 4],
    port: u16,
}

impl SocketAddress
{
    /// Create an address from its parts.
    #[must_use]
    pub const fn new(host: [u8; 4], port: u16) -> Self
    {
        Self { host, port }
    }

    /// Decode `A.B.C.D:port`, defaulting missing or malformed parts to zero.
    #[must_use]
    pub fn parse(text: &str) -> Self
    {
        let text = text.trim();
        let (host_part, port_part) = match text.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (text, None),
        };

        let octets: Vec<&str> = host_part.split('.').collect();
        let mut host = [0u8; 4];
        if octets.len() == 4 {
            for (slot, octet) in host.iter_mut().zip(&octets) {
                *slot = octet.trim().parse().unwrap_or(0);
            }
        }

        let port = port_part.and_then(|port| port.trim().parse().ok()).unwrap_or(0);
        Self { host, port }
    }

    /// The four host octets.
    #[must_use]
    pub const fn host(&self) -> [u8; 4]
    {
        self.host
    }

    /// The port number.
    #[must_use]
    pub const fn port(&self) -> u16
    {
        self.port
    }
}

impl FromStr for SocketAddress
{
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for SocketAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let [a, b, c, d] = self.host;
        write!(f, "{a}.{b}.{c}.{d}:{}", self.port)
    }
}

impl From<SocketAddress> for SocketAddrV4
{
    fn from(address: SocketAddress) -> Self
    {
        SocketAddrV4::new(Ipv4Addr::from(address.host), address.port)
    }
}

impl From<SocketAddrV4> for SocketAddress
{
    fn from(address: SocketAddrV4) -> Self
    {
        Self::new(address.ip().octets(), address.port())
    }
}
