//! Typed views of the control packets the transport and the resend engine exchange among
//!  themselves.

use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crate::addr::resolver::ModuleType;
use crate::addr::IpPort;
use crate::packet::header::PacketHeader;
use crate::packet::packet_type::PacketType;
use crate::packet::Packet;
use crate::util::safe_converter::{SafeCast, SaturatingCast};

fn expect_type(packet: &Packet, expected: PacketType) -> anyhow::Result<()> {
    if packet.packet_type() != Some(expected) {
        bail!("expected {:?}, was subtype {}", expected, packet.subtype());
    }
    Ok(())
}

/// Sent by a receiver that can not answer a request right away. The status tells the sender
///  how to proceed, the ETA replaces the sender's resend timeout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcknowledgeReply {
    pub request_id: u16,
    pub packet_id: u16,
    pub status: u32,
    pub eta: Duration,
}

impl AcknowledgeReply {
    pub fn for_request(request: &PacketHeader, status: u32, eta: Duration) -> AcknowledgeReply {
        AcknowledgeReply {
            request_id: request.request_id,
            packet_id: request.packet_id,
            status,
            eta,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut header = PacketHeader::new(PacketType::Acknowledge.into());
        header.request_id = self.request_id;
        header.packet_id = self.packet_id;

        let mut body = BytesMut::with_capacity(8);
        body.put_u32(self.status);
        let eta_millis: u32 = self.eta.as_millis().saturating_cast();
        body.put_u32(eta_millis);
        Packet::new(header, body)
    }

    pub fn from_packet(packet: &Packet) -> anyhow::Result<AcknowledgeReply> {
        expect_type(packet, PacketType::Acknowledge)?;

        let mut body = packet.body();
        let status = body.try_get_u32()?;
        let eta_millis = body.try_get_u32()?;
        Ok(AcknowledgeReply {
            request_id: packet.header.request_id,
            packet_id: packet.header.packet_id,
            status,
            eta: Duration::from_millis(eta_millis.safe_cast()),
        })
    }
}

/// Asks whoever listens on a multicast group for the unicast address of the group's leader. It
///  carries the request key of the request that is waiting for the answer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderIpRequest {
    pub request_id: u16,
    pub packet_id: u16,
    pub map_id: u32,
    pub map_set: u32,
    pub module_type: ModuleType,
    pub original_destination: IpPort,
}

impl LeaderIpRequest {
    pub fn to_packet(&self) -> Packet {
        let mut header = PacketHeader::new(PacketType::LeaderIpRequest.into());
        header.request_id = self.request_id;
        header.packet_id = self.packet_id;
        header.map_set = self.map_set;

        let mut body = BytesMut::with_capacity(8 + IpPort::SERIALIZED_LEN);
        body.put_u32(self.map_id);
        body.put_u32(self.module_type.into());
        self.original_destination.ser(&mut body);
        Packet::new(header, body)
    }

    pub fn from_packet(packet: &Packet) -> anyhow::Result<LeaderIpRequest> {
        expect_type(packet, PacketType::LeaderIpRequest)?;

        let mut body = packet.body();
        let map_id = body.try_get_u32()?;
        let raw_module_type = body.try_get_u32()?;
        let module_type = ModuleType::try_from(raw_module_type)
            .map_err(|_| anyhow!("invalid module type {}", raw_module_type))?;
        let original_destination = IpPort::deser(&mut body)?;

        Ok(LeaderIpRequest {
            request_id: packet.header.request_id,
            packet_id: packet.header.packet_id,
            map_id,
            map_set: packet.header.map_set,
            module_type,
            original_destination,
        })
    }
}

/// The answer to a [LeaderIpRequest], naming the unicast address of the group's leader
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderIpReply {
    pub request_id: u16,
    pub packet_id: u16,
    pub status: u32,
    pub original_destination: IpPort,
    pub leader: IpPort,
}

impl LeaderIpReply {
    pub fn for_request(request: &LeaderIpRequest, status: u32, leader: IpPort) -> LeaderIpReply {
        LeaderIpReply {
            request_id: request.request_id,
            packet_id: request.packet_id,
            status,
            original_destination: request.original_destination,
            leader,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut header = PacketHeader::new(PacketType::LeaderIpReply.into());
        header.request_id = self.request_id;
        header.packet_id = self.packet_id;

        let mut body = BytesMut::with_capacity(4 + 2 * IpPort::SERIALIZED_LEN);
        body.put_u32(self.status);
        self.original_destination.ser(&mut body);
        self.leader.ser(&mut body);
        Packet::new(header, body)
    }

    pub fn from_packet(packet: &Packet) -> anyhow::Result<LeaderIpReply> {
        expect_type(packet, PacketType::LeaderIpReply)?;

        let mut body = packet.body();
        let status = body.try_get_u32()?;
        let original_destination = IpPort::deser(&mut body)?;
        let leader = IpPort::deser(&mut body)?;

        Ok(LeaderIpReply {
            request_id: packet.header.request_id,
            packet_id: packet.header.packet_id,
            status,
            original_destination,
            leader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::header::HEADER_SIZE;
    use crate::packet::packet_type::status;

    #[test]
    fn test_acknowledge_layout() {
        let ack = AcknowledgeReply {
            request_id: 3,
            packet_id: 4,
            status: status::OK,
            eta: Duration::from_millis(1500),
        };
        let raw = ack.to_packet().to_bytes();
        assert_eq!(raw.len(), HEADER_SIZE + 8);
        assert_eq!(&raw[HEADER_SIZE..HEADER_SIZE + 4], &[0, 0, 0, 0]);
        assert_eq!(&raw[HEADER_SIZE + 4..], &1500u32.to_be_bytes());

        let parsed = AcknowledgeReply::from_packet(&Packet::deser(&raw, 1000).unwrap()).unwrap();
        assert_eq!(parsed, ack);
    }

    #[test]
    fn test_leader_ip_request() {
        let req = LeaderIpRequest {
            request_id: 1,
            packet_id: 2,
            map_id: 7,
            map_set: 1,
            module_type: ModuleType::Route,
            original_destination: IpPort::new(0xe101_0102, 8002),
        };
        let p = req.to_packet();
        assert!(p.is_control());
        assert_eq!(p.request_key(), (1, 2));
        assert_eq!(LeaderIpRequest::from_packet(&p).unwrap(), req);
    }

    #[test]
    fn test_leader_ip_reply() {
        let req = LeaderIpRequest {
            request_id: 1,
            packet_id: 2,
            map_id: 7,
            map_set: 0,
            module_type: ModuleType::Map,
            original_destination: IpPort::new(0xe101_0100, 8000),
        };
        let reply = LeaderIpReply::for_request(&req, status::OK, IpPort::new(0x7f00_0001, 9000));
        let parsed = LeaderIpReply::from_packet(&reply.to_packet()).unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.original_destination, req.original_destination);
    }

    #[test]
    fn test_wrong_type() {
        let p = Packet::request(41, 1, 1, 1, b"");
        assert!(AcknowledgeReply::from_packet(&p).is_err());
        assert!(LeaderIpReply::from_packet(&p).is_err());
    }

    #[test]
    fn test_truncated_body() {
        let p = Packet::new(PacketHeader::new(PacketType::LeaderIpReply.into()), BytesMut::from(&[0u8, 0, 0, 0, 1][..]));
        assert!(LeaderIpReply::from_packet(&p).is_err());
    }
}
