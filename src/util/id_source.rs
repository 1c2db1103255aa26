use std::sync::atomic::{AtomicU16, Ordering};
use rand::Rng;
use crate::packet::header::NO_PACKET_ID;

/// Hands out wrapping request IDs, starting at a random value so that a restarted process is
///  unlikely to reuse the IDs of its predecessor for replies that are still in flight.
///
/// The reserved 'no packet id' value is never returned.
pub struct RequestIdSource {
    next: AtomicU16,
}

impl Default for RequestIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdSource {
    pub fn new() -> RequestIdSource {
        Self::starting_at(rand::thread_rng().gen_range(0..NO_PACKET_ID))
    }

    pub fn starting_at(first: u16) -> RequestIdSource {
        RequestIdSource {
            next: AtomicU16::new(first),
        }
    }

    pub fn next_id(&self) -> u16 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != NO_PACKET_ID {
                return id;
            }
        }
    }
}
