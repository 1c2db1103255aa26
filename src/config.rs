use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::bail;
use crate::packet::header::HEADER_SIZE;
use crate::util::properties::Properties;

/// Configuration of a [crate::transport::PacketTransport]
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// The first port to try for the TCP listen socket and the UDP receive socket. Both always
    ///  share a port: if it is taken, the next ports are tried, up to `port_search_attempts`
    ///  ports in total. Port 0 lets the OS pick the TCP port, and the UDP socket follows it.
    pub port: u16,
    pub port_search_attempts: u16,
    pub bind_ip: Ipv4Addr,
    /// The address that is stamped into outgoing packets as their origin, i.e. the address peers
    ///  send replies to. This must be reachable from peers, so it can not be `0.0.0.0`.
    pub advertised_ip: Ipv4Addr,

    /// Packets bigger than this are never sent as datagrams
    pub max_udp_packet_size: usize,
    /// Upper bound for framed packets on TCP connections; bigger frames are treated as a protocol
    ///  error and the connection is torn down
    pub max_packet_size: usize,

    /// outgoing TCP connections are closed after this time without traffic
    pub cached_connection_idle_timeout: Duration,
    /// accepted TCP connections are closed after this time without traffic
    pub received_connection_idle_timeout: Duration,
    /// time allowed for a connection attempt, or for a started write to make progress
    pub working_timeout: Duration,

    pub datagram_receive_buffer_size: usize,
}

impl TransportConfig {
    pub const MAX_UDP_PACKET_SIZE: usize = 65000;

    /// Defaults for a transport that talks to peers on the same host
    pub fn default_local() -> TransportConfig {
        TransportConfig {
            port: 0,
            port_search_attempts: 100,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            advertised_ip: Ipv4Addr::LOCALHOST,
            max_udp_packet_size: Self::MAX_UDP_PACKET_SIZE,
            max_packet_size: 16*1024*1024,
            cached_connection_idle_timeout: Duration::from_secs(60),
            received_connection_idle_timeout: Duration::from_secs(120),
            working_timeout: Duration::from_secs(10),
            datagram_receive_buffer_size: Self::MAX_UDP_PACKET_SIZE,
        }
    }

    pub fn from_properties(props: &Properties) -> anyhow::Result<TransportConfig> {
        let defaults = Self::default_local();
        let result = TransportConfig {
            port: props.get_u16("PACKET_PORT", defaults.port)?,
            port_search_attempts: props.get_u16("PORT_SEARCH_ATTEMPTS", defaults.port_search_attempts)?,
            bind_ip: props.get_ipv4("BIND_IP", defaults.bind_ip)?,
            advertised_ip: props.get_ipv4("ADVERTISED_IP", defaults.advertised_ip)?,
            max_udp_packet_size: props.get_usize("MAX_UDP_PACKET_SIZE", defaults.max_udp_packet_size)?,
            max_packet_size: props.get_usize("MAX_PACKET_SIZE", defaults.max_packet_size)?,
            cached_connection_idle_timeout: props.get_duration_millis("CACHED_CONNECTION_IDLE_TIMEOUT", defaults.cached_connection_idle_timeout)?,
            received_connection_idle_timeout: props.get_duration_millis("RECEIVED_CONNECTION_IDLE_TIMEOUT", defaults.received_connection_idle_timeout)?,
            working_timeout: props.get_duration_millis("CONNECTION_WORKING_TIMEOUT", defaults.working_timeout)?,
            datagram_receive_buffer_size: props.get_usize("DATAGRAM_RECEIVE_BUFFER_SIZE", defaults.datagram_receive_buffer_size)?,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_search_attempts == 0 {
            bail!("port search attempts must be at least 1");
        }
        if self.advertised_ip.is_unspecified() {
            bail!("advertised IP must be an address peers can reach");
        }
        if self.max_udp_packet_size < HEADER_SIZE || self.max_udp_packet_size > Self::MAX_UDP_PACKET_SIZE {
            bail!("max UDP packet size must be between {} and {}", HEADER_SIZE, Self::MAX_UDP_PACKET_SIZE);
        }
        if self.max_packet_size < self.max_udp_packet_size {
            bail!("max packet size must not be smaller than max UDP packet size");
        }
        if self.max_packet_size > u32::MAX as usize {
            bail!("max packet size must fit into the 4 byte length prefix");
        }
        if self.datagram_receive_buffer_size < self.max_udp_packet_size {
            bail!("datagram receive buffer must hold a packet of max UDP packet size");
        }
        if self.working_timeout.is_zero() || self.cached_connection_idle_timeout.is_zero() || self.received_connection_idle_timeout.is_zero() {
            bail!("connection timeouts must be positive");
        }
        Ok(())
    }
}

/// Configuration of a [crate::resend::ResendHandler]
#[derive(Clone, Debug)]
pub struct ResendConfig {
    /// Requests smaller than this go by UDP unless a leader connection is known. Bigger requests
    ///  are sent via TCP, with leader discovery if they are addressed to a multicast group.
    pub tcp_limit_size: usize,
    pub default_resend_timeout: Duration,
    pub default_max_resend: u8,
    /// upper bound for the receive thread's blocking wait, i.e. for the latency of shutdown
    pub receive_poll_interval: Duration,
    /// A discovered leader address is trusted for this long even without a cached connection
    ///  to it. After that, it is only trusted while the transport holds a cached connection.
    pub leader_mapping_grace: Duration,
}

impl Default for ResendConfig {
    fn default() -> Self {
        ResendConfig {
            tcp_limit_size: 30000,
            default_resend_timeout: Duration::from_millis(1000),
            default_max_resend: 3,
            receive_poll_interval: Duration::from_millis(100),
            leader_mapping_grace: Duration::from_secs(5),
        }
    }
}

impl ResendConfig {
    pub fn from_properties(props: &Properties) -> anyhow::Result<ResendConfig> {
        let defaults = Self::default();
        let raw_max_resend = props.get_u32("DEFAULT_MAX_RESEND", defaults.default_max_resend as u32)?;
        let result = ResendConfig {
            tcp_limit_size: props.get_usize("TCP_LIMIT_SIZE", defaults.tcp_limit_size)?,
            default_resend_timeout: props.get_duration_millis("DEFAULT_RESEND_TIMEOUT", defaults.default_resend_timeout)?,
            default_max_resend: u8::try_from(raw_max_resend)?,
            receive_poll_interval: props.get_duration_millis("RESEND_RECEIVE_POLL_INTERVAL", defaults.receive_poll_interval)?,
            leader_mapping_grace: props.get_duration_millis("LEADER_MAPPING_GRACE", defaults.leader_mapping_grace)?,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tcp_limit_size <= HEADER_SIZE {
            bail!("TCP limit size must be bigger than the packet header");
        }
        if self.default_resend_timeout.is_zero() {
            bail!("resend timeout must be positive");
        }
        if self.receive_poll_interval.is_zero() {
            bail!("receive poll interval must be positive");
        }
        Ok(())
    }
}
