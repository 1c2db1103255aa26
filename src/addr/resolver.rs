use std::net::Ipv4Addr;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::addr::IpPort;
use crate::util::properties::Properties;

/// The kinds of cooperating server processes. Each module type has its own pair of multicast
///  groups: one that only the current leader listens to, and one for all available instances.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ModuleType {
    Map = 0,
    Route = 1,
    Search = 2,
    User = 3,
    Info = 4,
    Sms = 5,
    Smtp = 6,
    Traffic = 7,
    Gfx = 8,
    Tile = 9,
}

/// Source of destination addresses for module types, as consumed by request senders
pub trait DestinationResolver: Send + Sync {
    /// The group address of the leader of `module_type` serving `map_set`
    fn leader_addr(&self, module_type: ModuleType, map_set: u32) -> IpPort;

    /// The group address that all available (non-leader) instances listen to
    fn available_addr(&self, module_type: ModuleType, map_set: u32) -> IpPort;
}

/// Derives multicast group addresses arithmetically from a base address and port: each module
///  type gets two consecutive IPs (leader, available) and two consecutive ports, and each map
///  set shifts the ports by a fixed offset so that shards of the same module type never share a
///  group.
#[derive(Clone, Debug)]
pub struct MulticastResolver {
    pub base_ip: Ipv4Addr,
    pub base_port: u16,
    pub map_set_port_offset: u16,
}

impl Default for MulticastResolver {
    fn default() -> Self {
        MulticastResolver {
            base_ip: Ipv4Addr::new(225, 1, 1, 0),
            base_port: 8000,
            map_set_port_offset: 100,
        }
    }
}

impl MulticastResolver {
    pub fn from_properties(props: &Properties) -> anyhow::Result<MulticastResolver> {
        let defaults = Self::default();
        let result = MulticastResolver {
            base_ip: props.get_ipv4("MULTICAST_BASE_IP", defaults.base_ip)?,
            base_port: props.get_u16("MULTICAST_BASE_PORT", defaults.base_port)?,
            map_set_port_offset: props.get_u16("MAP_SET_PORT_OFFSET", defaults.map_set_port_offset)?,
        };
        if !result.base_ip.is_multicast() {
            anyhow::bail!("MULTICAST_BASE_IP {} is not a multicast address", result.base_ip);
        }
        Ok(result)
    }

    fn group(&self, module_type: ModuleType, map_set: u32, available: bool) -> IpPort {
        let index: u32 = module_type.into();
        let slot = index * 2 + u32::from(available);

        let ip = self.base_ip.to_bits().wrapping_add(slot);
        let port = self.base_port
            .wrapping_add(slot as u16)
            .wrapping_add((map_set as u16).wrapping_mul(self.map_set_port_offset));
        IpPort::new(ip, port)
    }
}

impl DestinationResolver for MulticastResolver {
    fn leader_addr(&self, module_type: ModuleType, map_set: u32) -> IpPort {
        self.group(module_type, map_set, false)
    }

    fn available_addr(&self, module_type: ModuleType, map_set: u32) -> IpPort {
        self.group(module_type, map_set, true)
    }
}
