use std::any::Any;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::task::Poll;
use std::time::Duration;
use anyhow::Context;
use bytes::Bytes;
use mio::net::TcpStream;
use tracing::{debug, trace, warn};
use crate::addr::IpPort;
use crate::net::framed::{FramedWriter, WriteState};
use crate::net::selectable::Selectable;

/// An outgoing TCP connection that is kept in the connection cache and reused for all packets
///  to its destination. Packets are queued and written one frame after the other.
///
/// The connection is closed when it is idle for `idle_timeout`, or when connecting or a
///  started write does not complete within `working_timeout`. Packets still queued at that
///  point are dropped.
pub struct PacketSender {
    stream: TcpStream,
    destination: IpPort,
    writer: FramedWriter,
    queue: VecDeque<Bytes>,
    idle_timeout: Duration,
    working_timeout: Duration,
    closed_by_peer: bool,
}

impl PacketSender {
    /// Starts a non-blocking connect to `destination`
    pub fn connect(destination: IpPort, idle_timeout: Duration, working_timeout: Duration) -> anyhow::Result<PacketSender> {
        let stream = TcpStream::connect(destination.socket_addr())
            .with_context(|| format!("connecting to {}", destination))?;

        Ok(PacketSender {
            stream,
            destination,
            writer: FramedWriter::new_connecting(),
            queue: VecDeque::new(),
            idle_timeout,
            working_timeout,
            closed_by_peer: false,
        })
    }

    pub fn destination(&self) -> IpPort {
        self.destination
    }

    /// `packet` is a complete serialized packet, framing is added when it is written
    pub fn enqueue(&mut self, packet: Bytes) {
        self.queue.push_back(packet);
    }

    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }

    fn is_finished(&self) -> bool {
        self.closed_by_peer || matches!(self.writer.state(), WriteState::Error | WriteState::Done)
    }

    fn is_working(&self) -> bool {
        !self.queue.is_empty() || matches!(self.writer.state(), WriteState::Connecting | WriteState::Sending)
    }

    fn check_connected(&mut self) {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!("connecting to {} failed: {}", self.destination, e);
                self.writer.on_error();
                return;
            }
        }

        match self.stream.peer_addr() {
            Ok(_) => {
                trace!("connected to {}", self.destination);
                if let Err(e) = self.stream.set_nodelay(true) {
                    debug!("could not set TCP_NODELAY for connection to {}: {}", self.destination, e);
                }
                self.writer.on_connected();
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => {
                debug!("connecting to {} failed: {}", self.destination, e);
                self.writer.on_error();
            }
        }
    }

    /// Nothing is expected from the peer, reading only detects that it closed the connection
    fn drain_input(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!("connection to {} was closed by the peer", self.destination);
                    self.closed_by_peer = true;
                    break;
                }
                Ok(n) => trace!("ignoring {} unexpected bytes from {}", n, self.destination),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("error on connection to {}: {}", self.destination, e);
                    self.writer.on_error();
                    break;
                }
            }
        }
    }

    fn write_queued(&mut self) {
        loop {
            if self.writer.state() == WriteState::Ready {
                let Some(packet) = self.queue.pop_front() else { break };
                if let Err(e) = self.writer.start_frame(&packet) {
                    warn!("dropping packet for {}: {}", self.destination, e);
                    continue;
                }
            }

            match self.writer.write_step(&mut self.stream) {
                Poll::Pending => break,
                Poll::Ready(WriteState::Sending) | Poll::Ready(WriteState::Ready) => {}
                Poll::Ready(state) => {
                    debug!("connection to {} is unusable ({:?})", self.destination, state);
                    break;
                }
            }
        }
    }
}

impl Selectable for PacketSender {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.stream
    }

    fn wants_read(&self) -> bool {
        !self.is_finished() && self.writer.state() != WriteState::Connecting
    }

    fn wants_write(&self) -> bool {
        !self.is_finished() && self.is_working()
    }

    fn handle_io(&mut self, readable: bool, writable: bool, _spawned: &mut Vec<Box<dyn Selectable>>) {
        if self.writer.state() == WriteState::Connecting {
            if !writable && !readable {
                return;
            }
            self.check_connected();
        }
        if self.writer.state() == WriteState::Connecting || self.is_finished() {
            return;
        }

        if readable {
            self.drain_input();
        }
        if !self.is_finished() {
            self.write_queued();
        }
    }

    fn handle_timeout(&mut self) {
        if self.is_finished() {
            return;
        }
        if self.is_working() {
            warn!("connection to {} timed out while working, dropping {} queued packets", self.destination, self.queue.len());
        }
        else {
            trace!("closing idle connection to {}", self.destination);
        }
    }

    fn timeout(&self) -> Option<Duration> {
        if self.is_finished() {
            Some(Duration::ZERO)
        }
        else if self.is_working() {
            Some(self.working_timeout)
        }
        else {
            Some(self.idle_timeout)
        }
    }

    fn cached_destination(&self) -> Option<IpPort> {
        Some(self.destination)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
