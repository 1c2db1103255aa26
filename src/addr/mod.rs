pub mod resolver;

use std::fmt::{Debug, Display, Formatter};
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use anyhow::bail;
use bytes::{Buf, BufMut};

/// An IPv4 address and a port, the addressing unit of the packet protocol (headers carry the
///  origin as a u32 IP and a u16 port). Used both as a send destination and as a lookup key for
///  cached connections and leader mappings.
///
/// Addresses in 224.0.0.0/4 are multicast 'group' addresses that stand for all instances of a
///  module type rather than for a single host.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct IpPort {
    ip: u32,
    port: u16,
}

impl Debug for IpPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl Display for IpPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl IpPort {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + size_of::<u16>();

    pub const fn new(ip: u32, port: u16) -> IpPort {
        IpPort { ip, port }
    }

    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> IpPort {
        IpPort {
            ip: ip.to_bits(),
            port,
        }
    }

    pub fn ip_bits(&self) -> u32 {
        self.ip
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.ip)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// An address with IP 0 marks 'unknown' in headers and control packets
    pub fn is_unset(&self) -> bool {
        self.ip == 0
    }

    pub fn is_multicast(&self) -> bool {
        self.ip().is_multicast()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ip);
        buf.put_u16(self.port);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IpPort> {
        let ip = buf.try_get_u32()?;
        let port = buf.try_get_u16()?;
        Ok(IpPort { ip, port })
    }
}

impl From<SocketAddrV4> for IpPort {
    fn from(addr: SocketAddrV4) -> Self {
        IpPort::from_ipv4(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for IpPort {
    type Error = anyhow::Error;

    fn try_from(addr: SocketAddr) -> anyhow::Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => {
                if let Some(mapped) = v6.ip().to_ipv4_mapped() {
                    return Ok(IpPort::from_ipv4(mapped, v6.port()));
                }
                bail!("the packet protocol is IPv4 only, got {:?}", addr)
            }
        }
    }
}
