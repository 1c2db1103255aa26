use std::time::{Duration, Instant};
use tracing::debug;
use crate::addr::resolver::ModuleType;
use crate::addr::IpPort;
use crate::packet::Packet;

/// A request that is tracked for resending, together with the state of its answer.
///
/// When the request's answer is complete or its resends are exhausted, the container is handed
///  back to the caller through the answer queue. [RequestContainer::is_answered] tells the two
///  outcomes apart.
#[derive(Debug)]
pub struct RequestContainer {
    packet: Packet,
    destination: IpPort,
    module_type: ModuleType,
    resend_timeout: Duration,
    max_resend: u8,
    resend_count: u8,
    server_timestamp: Instant,
    answer_parts: Vec<Option<Packet>>,
    failure_status: Option<u32>,
}

impl RequestContainer {
    pub fn new(packet: Packet, destination: IpPort, module_type: ModuleType, resend_timeout: Duration, max_resend: u8) -> RequestContainer {
        RequestContainer {
            packet,
            destination,
            module_type,
            resend_timeout,
            max_resend,
            resend_count: 0,
            server_timestamp: Instant::now(),
            answer_parts: Vec::new(),
            failure_status: None,
        }
    }

    pub fn request_key(&self) -> (u16, u16) {
        self.packet.request_key()
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub(crate) fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    pub fn destination(&self) -> IpPort {
        self.destination
    }

    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    pub fn resend_timeout(&self) -> Duration {
        self.resend_timeout
    }

    pub(crate) fn set_resend_timeout(&mut self, resend_timeout: Duration) {
        self.resend_timeout = resend_timeout;
    }

    pub fn max_resend(&self) -> u8 {
        self.max_resend
    }

    pub fn resend_count(&self) -> u8 {
        self.resend_count
    }

    pub(crate) fn can_resend(&self) -> bool {
        self.resend_count < self.max_resend
    }

    /// Prepares a resend: counts it, restarts the timeout and discards partial answers
    pub(crate) fn start_resend(&mut self, now: Instant) {
        self.resend_count += 1;
        self.server_timestamp = now;
        self.answer_parts.clear();
    }

    pub fn server_timestamp(&self) -> Instant {
        self.server_timestamp
    }

    pub(crate) fn set_server_timestamp(&mut self, now: Instant) {
        self.server_timestamp = now;
    }

    /// the point in time when the request is due for a resend
    pub fn deadline(&self) -> Instant {
        self.server_timestamp + self.resend_timeout
    }

    /// Adds a part of the answer and returns `true` if the answer is complete
    pub(crate) fn add_answer(&mut self, reply: Packet) -> bool {
        let nbr_packets = usize::from(reply.header.nbr_packets).max(1);
        if self.answer_parts.len() != nbr_packets {
            if !self.answer_parts.is_empty() {
                debug!("reply for {:?} changed the number of parts from {} to {} - discarding earlier parts",
                    self.request_key(), self.answer_parts.len(), nbr_packets);
            }
            self.answer_parts = vec![None; nbr_packets];
        }

        let index = usize::from(reply.header.packet_nbr);
        if index >= nbr_packets {
            debug!("reply part {} of {} for {:?} is out of range - ignoring", index, nbr_packets, self.request_key());
        }
        else {
            self.answer_parts[index] = Some(reply);
        }
        self.is_answered()
    }

    pub(crate) fn fail(&mut self, status: u32) {
        self.failure_status = Some(status);
    }

    pub fn is_answered(&self) -> bool {
        !self.answer_parts.is_empty() && self.answer_parts.iter().all(|p| p.is_some())
    }

    /// The reply, or the first part of a multi-part reply
    pub fn answer(&self) -> Option<&Packet> {
        if self.is_answered() {
            self.answer_parts.first().and_then(|p| p.as_ref())
        }
        else {
            None
        }
    }

    /// all parts of the answer, ordered by their part number
    pub fn answer_parts(&self) -> Vec<&Packet> {
        if !self.is_answered() {
            return Vec::new();
        }
        self.answer_parts.iter()
            .flatten()
            .collect()
    }

    pub fn into_answer_parts(self) -> Vec<Packet> {
        if !self.is_answered() {
            return Vec::new();
        }
        self.answer_parts.into_iter()
            .flatten()
            .collect()
    }

    /// The status of an acknowledge that ended the request without an answer
    pub fn failure_status(&self) -> Option<u32> {
        self.failure_status
    }
}
