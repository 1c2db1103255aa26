use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::addr::IpPort;

/// Marks 'no packet' in the packet id field, and is never handed out as a request id
pub const NO_PACKET_ID: u16 = u16::MAX;

pub const HEADER_SIZE: usize = 48;

pub const PROTOCOL_TAG: [u8; 3] = *b"MC2";
pub const PROTOCOL_MAJOR: u8 = 2;
pub const PROTOCOL_MINOR: u8 = 0;

/// The fixed 48 byte header in front of every packet, encoded big-endian:
///
/// ```ascii
/// 0:  tag 'MC2' (3 bytes)        3: major      4: minor       5: priority
/// 6:  subtype (u16)              8: origin ip (u32)           12: origin port (u16)
/// 14: request id (u16)           16: request timestamp (u32)  20: request originator (u16)
/// 22: packet nbr (u8)            23: reserved                 24: debit info (u32)
/// 28: packet id (u16)            30: nbr packets (u8)         31: resend nbr (u8)
/// 32: map set (u32)              36: request tag (u32)        40: timeout secs (u8)
/// 41: reserved (3 bytes)         44: cpu time (u32)
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub major: u8,
    pub minor: u8,
    pub priority: u8,
    pub subtype: u16,
    pub origin: IpPort,
    pub request_id: u16,
    pub request_timestamp: u32,
    pub request_originator: u16,
    /// index of this part in a multi-part answer
    pub packet_nbr: u8,
    pub debit_info: u32,
    pub packet_id: u16,
    pub nbr_packets: u8,
    pub resend_nbr: u8,
    pub map_set: u32,
    pub request_tag: u32,
    pub timeout_secs: u8,
    pub cpu_time: u32,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{V{}.{} subtype={} prio={} origin={} req={} pck={} part={}/{} resend={} map_set={} tag={} timeout={}s ts={} originator={} debit={} cpu={}}}",
               self.major, self.minor, self.subtype, self.priority, self.origin,
               self.request_id, self.packet_id, self.packet_nbr, self.nbr_packets,
               self.resend_nbr, self.map_set, self.request_tag, self.timeout_secs,
               self.request_timestamp, self.request_originator, self.debit_info, self.cpu_time,
        )
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        PacketHeader::new(0)
    }
}

impl PacketHeader {
    pub fn new(subtype: u16) -> PacketHeader {
        PacketHeader {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            priority: 0,
            subtype,
            origin: IpPort::default(),
            request_id: 0,
            request_timestamp: 0,
            request_originator: 0,
            packet_nbr: 0,
            debit_info: 0,
            packet_id: NO_PACKET_ID,
            nbr_packets: 1,
            resend_nbr: 0,
            map_set: 0,
            request_tag: 0,
            timeout_secs: 0,
            cpu_time: 0,
        }
    }

    /// the key by which replies are matched to the requests they answer
    pub fn request_key(&self) -> (u16, u16) {
        (self.request_id, self.packet_id)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&PROTOCOL_TAG);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u8(self.priority);
        buf.put_u16(self.subtype);
        self.origin.ser(buf);
        buf.put_u16(self.request_id);
        buf.put_u32(self.request_timestamp);
        buf.put_u16(self.request_originator);
        buf.put_u8(self.packet_nbr);
        buf.put_u8(0);
        buf.put_u32(self.debit_info);
        buf.put_u16(self.packet_id);
        buf.put_u8(self.nbr_packets);
        buf.put_u8(self.resend_nbr);
        buf.put_u32(self.map_set);
        buf.put_u32(self.request_tag);
        buf.put_u8(self.timeout_secs);
        buf.put_bytes(0, 3);
        buf.put_u32(self.cpu_time);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < HEADER_SIZE {
            bail!("packet of {} bytes is shorter than the header", buf.remaining());
        }

        let mut tag = [0u8; 3];
        buf.copy_to_slice(&mut tag);
        if tag != PROTOCOL_TAG {
            bail!("invalid protocol tag {:?}", tag);
        }

        let major = buf.get_u8();
        if major != PROTOCOL_MAJOR {
            bail!("unsupported protocol version {}, expected {}", major, PROTOCOL_MAJOR);
        }
        let minor = buf.get_u8();
        let priority = buf.get_u8();
        let subtype = buf.get_u16();
        let origin = IpPort::deser(buf)?;
        let request_id = buf.get_u16();
        let request_timestamp = buf.get_u32();
        let request_originator = buf.get_u16();
        let packet_nbr = buf.get_u8();
        buf.advance(1);
        let debit_info = buf.get_u32();
        let packet_id = buf.get_u16();
        let nbr_packets = buf.get_u8();
        let resend_nbr = buf.get_u8();
        let map_set = buf.get_u32();
        let request_tag = buf.get_u32();
        let timeout_secs = buf.get_u8();
        buf.advance(3);
        let cpu_time = buf.get_u32();

        Ok(PacketHeader {
            major,
            minor,
            priority,
            subtype,
            origin,
            request_id,
            request_timestamp,
            request_originator,
            packet_nbr,
            debit_info,
            packet_id,
            nbr_packets,
            resend_nbr,
            map_set,
            request_tag,
            timeout_secs,
            cpu_time,
        })
    }
}
