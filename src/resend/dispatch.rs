use std::time::Instant;
use tracing::{debug, trace};
use crate::addr::IpPort;
use crate::packet::control::LeaderIpRequest;
use crate::packet::Packet;
use crate::resend::container::RequestContainer;
use crate::resend::leader::LeaderDirectory;
use crate::transport::sink::PacketSink;
use crate::transport::TransportHint;
use crate::util::safe_converter::SaturatingCast;

/// Decides how a tracked request goes on the wire:
///
/// * requests below the TCP limit go via TCP to the group's leader if it is known, otherwise
///   via UDP to their destination
/// * bigger requests go via TCP to the known leader or to their (unicast) destination. If the
///   destination is a multicast group with no known leader, a leader discovery is sent to the
///   group instead, and the request follows when the reply arrives.
pub struct Dispatcher<'a> {
    pub sink: &'a dyn PacketSink,
    pub tcp_limit_size: usize,
}

impl Dispatcher<'_> {
    pub fn send(&self, leaders: &mut LeaderDirectory, container: &mut RequestContainer, now: Instant) {
        self.stamp(container);

        let destination = container.destination();
        let leader = leaders.leader_for(destination, now, self.sink);

        if container.packet().len() < self.tcp_limit_size {
            match leader {
                Some(leader) => self.enqueue(container.packet().clone(), leader, TransportHint::Tcp),
                None => self.enqueue(container.packet().clone(), destination, TransportHint::Udp),
            }
            return;
        }

        if let Some(leader) = leader {
            self.enqueue(container.packet().clone(), leader, TransportHint::Tcp);
        }
        else if destination.is_multicast() {
            let key = container.request_key();
            if leaders.join_discovery(destination, key, now, container.resend_timeout()) {
                debug!("request {:?} of {} bytes needs TCP - asking {} for its leader", key, container.packet().len(), destination);
                let discovery = self.leader_ip_request(container);
                self.enqueue(discovery, destination, TransportHint::Udp);
            }
            else {
                trace!("request {:?} waits for leader discovery of {}", key, destination);
            }
        }
        else {
            self.enqueue(container.packet().clone(), destination, TransportHint::Tcp);
        }
    }

    /// Sends a request to an explicitly given address via TCP, e.g. to a leader that was just
    ///  discovered
    pub fn send_direct(&self, container: &mut RequestContainer, to: IpPort) {
        self.stamp(container);
        self.enqueue(container.packet().clone(), to, TransportHint::Tcp);
    }

    fn stamp(&self, container: &mut RequestContainer) {
        let timeout_secs = container.resend_timeout().as_millis().div_ceil(1000);
        let resend_count = container.resend_count();
        let origin = self.sink.local_addr();

        let header = &mut container.packet_mut().header;
        header.origin = origin;
        header.resend_nbr = resend_count;
        header.timeout_secs = timeout_secs.saturating_cast();
    }

    fn leader_ip_request(&self, container: &RequestContainer) -> Packet {
        let request = container.packet();
        let mut packet = LeaderIpRequest {
            request_id: request.header.request_id,
            packet_id: request.header.packet_id,
            map_id: request.map_id().unwrap_or_default(),
            map_set: request.header.map_set,
            module_type: container.module_type(),
            original_destination: container.destination(),
        }.to_packet();
        packet.header.origin = request.header.origin;
        packet.header.timeout_secs = request.header.timeout_secs;
        packet
    }

    fn enqueue(&self, packet: Packet, destination: IpPort, hint: TransportHint) {
        trace!("sending {:?} to {} via {:?}", packet.header, destination, hint);
        if !self.sink.enqueue(packet, destination, hint) {
            debug!("transport is shut down, not sending to {}", destination);
        }
    }
}
