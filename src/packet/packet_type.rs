use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Subtypes with this bit set are transport level control packets rather than module requests
pub const CTRL_PACKET_BIT: u16 = 0x8000;

/// The packet subtypes the transport itself interprets. All other subtype values belong to the
///  modules and are passed through as opaque numbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    Acknowledge = 1,
    TestRequest = 41,
    TestReply = 42,
    LeaderIpRequest = 0x8033,
    LeaderIpReply = 0x8034,
}

pub fn is_control(subtype: u16) -> bool {
    subtype & CTRL_PACKET_BIT != 0
}

/// Status codes carried in reply packets
pub mod status {
    pub const OK: u32 = 0;
    pub const NOT_OK: u32 = 1;
    pub const TIMEOUT_ERROR: u32 = 2;
    pub const MAP_NOT_FOUND: u32 = 3;
    /// sent in an acknowledge while the receiver loads the requested map: resend right away
    pub const MAP_LOADED: u32 = 4;
    pub const UNKNOWN_LEADER: u32 = 5;
}
