pub mod control;
pub mod header;
pub mod packet_type;

use std::fmt::{Debug, Formatter};
use std::mem::size_of;
use std::time::Instant;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::packet::header::{PacketHeader, HEADER_SIZE};
use crate::packet::packet_type::{is_control, PacketType};

/// A packet: the fixed header followed by an opaque body. For requests the first four body
///  bytes are the map id, for replies they are the status code.
///
/// Packets are moved through queues and into the transport; resending a request sends a clone.
#[derive(Clone)]
pub struct Packet {
    pub header: PacketHeader,
    body: BytesMut,
    /// local only, set when the packet is taken off the wire
    pub arrival_time: Option<Instant>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}+{}b", self.header, self.body.len())
    }
}

impl Packet {
    pub fn new(header: PacketHeader, body: BytesMut) -> Packet {
        Packet {
            header,
            body,
            arrival_time: None,
        }
    }

    pub fn request(subtype: u16, request_id: u16, packet_id: u16, map_id: u32, payload: &[u8]) -> Packet {
        let mut header = PacketHeader::new(subtype);
        header.request_id = request_id;
        header.packet_id = packet_id;

        let mut body = BytesMut::with_capacity(size_of::<u32>() + payload.len());
        body.put_u32(map_id);
        body.put_slice(payload);
        Packet::new(header, body)
    }

    /// A reply to `request`, carrying its request key and map set so that the sender can match
    ///  it
    pub fn reply_to(request: &PacketHeader, subtype: u16, status: u32, payload: &[u8]) -> Packet {
        let mut header = PacketHeader::new(subtype);
        header.request_id = request.request_id;
        header.packet_id = request.packet_id;
        header.request_originator = request.request_originator;
        header.request_timestamp = request.request_timestamp;
        header.request_tag = request.request_tag;
        header.map_set = request.map_set;
        header.priority = request.priority;

        let mut body = BytesMut::with_capacity(size_of::<u32>() + payload.len());
        body.put_u32(status);
        body.put_slice(payload);
        Packet::new(header, body)
    }

    pub fn subtype(&self) -> u16 {
        self.header.subtype
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.header.subtype).ok()
    }

    pub fn is_control(&self) -> bool {
        is_control(self.header.subtype)
    }

    pub fn request_key(&self) -> (u16, u16) {
        self.header.request_key()
    }

    /// total serialized length, header included
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    fn leading_u32(&self) -> Option<u32> {
        let mut b: &[u8] = &self.body;
        b.try_get_u32().ok()
    }

    /// The map id of a request packet
    pub fn map_id(&self) -> Option<u32> {
        self.leading_u32()
    }

    /// The status code of a reply packet
    pub fn status(&self) -> Option<u32> {
        self.leading_u32()
    }

    /// the body after the leading map id / status field
    pub fn payload(&self) -> &[u8] {
        self.body.get(size_of::<u32>()..).unwrap_or(&[])
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(raw: &[u8], max_size: usize) -> anyhow::Result<Packet> {
        if raw.len() > max_size {
            bail!("packet of {} bytes exceeds the maximum of {}", raw.len(), max_size);
        }
        let mut buf = raw;
        let header = PacketHeader::deser(&mut buf)?;
        let body = BytesMut::from(buf.chunk());
        Ok(Packet::new(header, body))
    }
}
