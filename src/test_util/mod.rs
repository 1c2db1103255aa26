//! Utilities for testing code on top of the packet transport without opening sockets. They are
//!  part of the regular (non-#[cfg(test)]) code so that applications can use them in their tests.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use rustc_hash::FxHashSet;
use crate::addr::IpPort;
use crate::packet::packet_type::PacketType;
use crate::packet::Packet;
use crate::transport::sink::PacketSink;
use crate::transport::{OutboundPacket, TransportHint};

pub const TEST_LOCAL_ADDR: IpPort = IpPort::new(0x7f00_0001, 7000);

/// A test request with `payload_len` bytes of payload
pub fn request_packet(request_id: u16, packet_id: u16, payload_len: usize) -> Packet {
    Packet::request(PacketType::TestRequest.into(), request_id, packet_id, 0, &vec![0u8; payload_len])
}

/// convenience for unit test code: an address on localhost, different numbers giving different
///  ports
pub fn test_addr_from_number(number: u16) -> IpPort {
    IpPort::new(0x7f00_0001, number)
}

/// A [PacketSink] that records all packets instead of sending them
pub struct TrackingPacketSink {
    local_addr: IpPort,
    sent: Mutex<Vec<OutboundPacket>>,
    sent_changed: Condvar,
    cached_connections: Mutex<FxHashSet<IpPort>>,
}

impl Default for TrackingPacketSink {
    fn default() -> Self {
        Self::new(TEST_LOCAL_ADDR)
    }
}

impl TrackingPacketSink {
    pub fn new(local_addr: IpPort) -> TrackingPacketSink {
        TrackingPacketSink {
            local_addr,
            sent: Default::default(),
            sent_changed: Condvar::new(),
            cached_connections: Default::default(),
        }
    }

    fn lock_sent(&self) -> MutexGuard<'_, Vec<OutboundPacket>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// makes [PacketSink::has_cached_connection] return `true` for `destination`
    pub fn add_cached_connection(&self, destination: IpPort) {
        self.cached_connections.lock().unwrap_or_else(|e| e.into_inner())
            .insert(destination);
    }

    pub fn remove_cached_connection(&self, destination: IpPort) {
        self.cached_connections.lock().unwrap_or_else(|e| e.into_inner())
            .remove(&destination);
    }

    pub fn num_sent(&self) -> usize {
        self.lock_sent().len()
    }

    /// a copy of everything sent so far, in the order it was sent
    pub fn sent(&self) -> Vec<OutboundPacket> {
        self.lock_sent().clone()
    }

    /// returns sent packets, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<OutboundPacket> {
        std::mem::take(&mut *self.lock_sent())
    }

    /// Waits until at least `num` packets were sent, returning `false` on timeout
    pub fn wait_for_sent(&self, num: usize, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut sent = self.lock_sent();
        while sent.len() < num {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sent = self.sent_changed.wait_timeout(sent, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

impl PacketSink for TrackingPacketSink {
    fn enqueue(&self, packet: Packet, destination: IpPort, hint: TransportHint) -> bool {
        self.lock_sent().push(OutboundPacket { packet, destination, hint });
        self.sent_changed.notify_all();
        true
    }

    fn has_cached_connection(&self, destination: IpPort) -> bool {
        self.cached_connections.lock().unwrap_or_else(|e| e.into_inner())
            .contains(&destination)
    }

    fn local_addr(&self) -> IpPort {
        self.local_addr
    }
}
