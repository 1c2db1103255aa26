pub mod datagram;
pub mod framed;
pub mod listener;
pub mod multiplexer;
pub mod packet_receiver;
pub mod packet_sender;
pub mod selectable;

use std::net::SocketAddr;
use std::time::Instant;
use tracing::{span, trace, warn, Level};
use uuid::Uuid;
use crate::packet::Packet;
use crate::util::blocking_queue::BlockingQueue;

pub type PacketQueue = BlockingQueue<Packet>;

/// Decodes a packet taken off the wire and hands it to the receive queue. Returns `false` if
///  the data is not a valid packet.
pub(crate) fn deliver_packet(raw: &[u8], from: SocketAddr, max_packet_size: usize, receive_queue: &PacketQueue) -> bool {
    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "packet_received", ?correlation_id);
    let _entered = span.enter();

    match Packet::deser(raw, max_packet_size) {
        Ok(mut packet) => {
            packet.arrival_time = Some(Instant::now());
            trace!("received packet from {:?}: {:?}", from, packet);
            if !receive_queue.push(packet) {
                trace!("receive queue is closed - dropping packet");
            }
            true
        }
        Err(e) => {
            warn!("received invalid packet from {:?} ({} bytes), dropping: {}", from, raw.len(), e);
            false
        }
    }
}
