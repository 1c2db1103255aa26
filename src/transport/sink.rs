#[cfg(test)] use mockall::automock;
use crate::addr::IpPort;
use crate::packet::Packet;
use crate::transport::{PacketTransport, TransportHint};

/// The part of the transport the resend engine sends through, introduced to facilitate testing
///  the engine without sockets
#[cfg_attr(test, automock)]
pub trait PacketSink: Send + Sync + 'static {
    /// Fire-and-forget send; returns `false` if the transport is shut down
    fn enqueue(&self, packet: Packet, destination: IpPort, hint: TransportHint) -> bool;

    fn has_cached_connection(&self, destination: IpPort) -> bool;

    /// the address peers reply to
    fn local_addr(&self) -> IpPort;
}

impl PacketSink for PacketTransport {
    fn enqueue(&self, packet: Packet, destination: IpPort, hint: TransportHint) -> bool {
        PacketTransport::enqueue(self, packet, destination, hint)
    }

    fn has_cached_connection(&self, destination: IpPort) -> bool {
        PacketTransport::has_cached_connection(self, destination)
    }

    fn local_addr(&self) -> IpPort {
        self.addr()
    }
}
