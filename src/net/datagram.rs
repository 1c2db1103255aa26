use std::any::Any;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use bytes::Bytes;
use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};
use crate::addr::IpPort;
use crate::net::selectable::Selectable;
use crate::net::{deliver_packet, PacketQueue};

/// Receives one packet per datagram and pushes it to the receive queue
pub struct DatagramReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
    receive_queue: Arc<PacketQueue>,
    max_packet_size: usize,
}

impl DatagramReceiver {
    /// The buffer has one spare byte beyond both sizes, so that a datagram that fills it
    ///  completely is known to be truncated.
    pub fn new(socket: UdpSocket, receive_buffer_size: usize, max_packet_size: usize, receive_queue: Arc<PacketQueue>) -> DatagramReceiver {
        DatagramReceiver {
            socket,
            buf: vec![0; receive_buffer_size.max(max_packet_size) + 1],
            receive_queue,
            max_packet_size,
        }
    }

    /// A receiver for a multicast group. The socket is bound to the group's port with address
    ///  reuse, so that several processes on the same host can join the same group.
    pub fn join_multicast(group: IpPort, interface: Ipv4Addr, receive_buffer_size: usize, max_packet_size: usize, receive_queue: Arc<PacketQueue>) -> anyhow::Result<DatagramReceiver> {
        if !group.is_multicast() {
            anyhow::bail!("{} is not a multicast address", group);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())
            .with_context(|| format!("binding multicast receiver for {}", group))?;
        socket.join_multicast_v4(&group.ip(), &interface)
            .with_context(|| format!("joining multicast group {}", group))?;

        info!("joined multicast group {}", group);
        let socket = UdpSocket::from_std(socket.into());
        Ok(Self::new(socket, receive_buffer_size, max_packet_size, receive_queue))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Selectable for DatagramReceiver {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.socket
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn handle_io(&mut self, readable: bool, _writable: bool, _spawned: &mut Vec<Box<dyn Selectable>>) {
        if !readable {
            return;
        }

        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((num_read, from)) if num_read == self.buf.len() => {
                    warn!("dropping oversized datagram from {}: it does not fit into {} bytes", from, num_read - 1);
                }
                Ok((num_read, from)) => {
                    deliver_packet(&self.buf[..num_read], from, self.max_packet_size, &self.receive_queue);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    // e.g. ICMP 'port unreachable' for an earlier send. The next readiness event
                    //  resumes reading.
                    debug!("error receiving datagram: {}", e);
                    break;
                }
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sends packets as datagrams from a socket of its own. Packets are queued while the socket's
///  send buffer is full.
pub struct DatagramSender {
    socket: UdpSocket,
    queue: VecDeque<(Bytes, SocketAddr)>,
}

impl DatagramSender {
    pub fn bind(ip: Ipv4Addr) -> anyhow::Result<DatagramSender> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, 0)))
            .context("binding datagram sender")?;
        Ok(DatagramSender {
            socket,
            queue: VecDeque::new(),
        })
    }

    pub fn enqueue(&mut self, packet: Bytes, to: IpPort) {
        self.queue.push_back((packet, to.socket_addr()));
    }

    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }
}

impl Selectable for DatagramSender {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.socket
    }

    fn wants_read(&self) -> bool {
        false
    }

    fn wants_write(&self) -> bool {
        !self.queue.is_empty()
    }

    fn handle_io(&mut self, _readable: bool, _writable: bool, _spawned: &mut Vec<Box<dyn Selectable>>) {
        while let Some((packet, to)) = self.queue.pop_front() {
            match self.socket.send_to(&packet, to) {
                Ok(_) => trace!("sent datagram of {} bytes to {:?}", packet.len(), to),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.queue.push_front((packet, to));
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => self.queue.push_front((packet, to)),
                Err(e) => warn!("error sending datagram to {:?}, dropping it: {}", to, e),
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::multiplexer::Multiplexer;
    use crate::packet::header::HEADER_SIZE;
    use crate::packet::Packet;
    use crate::util::blocking_queue::BlockingQueue;

    #[test]
    fn test_send_and_receive() {
        let queue = Arc::new(BlockingQueue::new());
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = IpPort::try_from(socket.local_addr().unwrap()).unwrap();

        let mut multiplexer = Multiplexer::new().unwrap();
        multiplexer.add_permanent(Box::new(DatagramReceiver::new(socket, 65000, 65000, queue.clone()))).unwrap();
        let sender_id = multiplexer.add_permanent(Box::new(DatagramSender::bind(Ipv4Addr::LOCALHOST).unwrap())).unwrap();

        let packet = Packet::request(41, 7, 8, 9, b"hello");
        multiplexer.with_selectable::<DatagramSender, _>(sender_id, |s| s.enqueue(packet.to_bytes(), addr)).unwrap();
        multiplexer.update(sender_id);

        while queue.is_empty() {
            multiplexer.select().unwrap();
        }
        let received = queue.try_pop().unwrap();
        assert_eq!(received.header, packet.header);
        assert_eq!(received.payload(), b"hello");
        assert!(received.arrival_time.is_some());
        assert_eq!(multiplexer.with_selectable::<DatagramSender, _>(sender_id, |s| s.num_queued()), Some(0));
    }

    #[test]
    fn test_invalid_datagram_is_dropped() {
        let queue = Arc::new(BlockingQueue::new());
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();

        let mut multiplexer = Multiplexer::new().unwrap();
        multiplexer.add_permanent(Box::new(DatagramReceiver::new(socket, 65000, 65000, queue.clone()))).unwrap();

        let raw_sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw_sender.send_to(b"garbage", addr).unwrap();
        raw_sender.send_to(&Packet::request(41, 1, 1, 1, b"").to_bytes(), addr).unwrap();

        while queue.is_empty() {
            multiplexer.select().unwrap();
        }
        assert_eq!(queue.try_pop().unwrap().request_key(), (1, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_oversized_datagram_is_dropped() {
        let queue = Arc::new(BlockingQueue::new());
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();

        let mut multiplexer = Multiplexer::new().unwrap();
        multiplexer.add_permanent(Box::new(DatagramReceiver::new(socket, 200, 200, queue.clone()))).unwrap();

        let raw_sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw_sender.send_to(&Packet::request(41, 1, 1, 1, &[7u8; 300]).to_bytes(), addr).unwrap();
        let fitting = Packet::request(41, 2, 1, 1, &[8u8; 200 - HEADER_SIZE - 4]);
        assert_eq!(fitting.to_bytes().len(), 200);
        raw_sender.send_to(&fitting.to_bytes(), addr).unwrap();

        while queue.is_empty() {
            multiplexer.select().unwrap();
        }
        let received = queue.try_pop().unwrap();
        assert_eq!(received.request_key(), (2, 1));
        assert_eq!(received.payload(), &[8u8; 200 - HEADER_SIZE - 4][..]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_join_multicast_rejects_unicast() {
        let queue = Arc::new(BlockingQueue::new());
        assert!(DatagramReceiver::join_multicast(IpPort::from_ipv4(Ipv4Addr::LOCALHOST, 9000), Ipv4Addr::UNSPECIFIED, 100, 100, queue).is_err());
    }
}
