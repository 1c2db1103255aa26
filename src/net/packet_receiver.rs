use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use mio::net::TcpStream;
use tracing::{debug, trace};
use crate::net::deliver_packet;
use crate::net::framed::{FramedReader, ReadState};
use crate::net::selectable::Selectable;
use crate::net::PacketQueue;

/// An accepted TCP connection: reads framed packets until the peer closes the connection or it
///  is idle for too long
pub struct PacketReceiver {
    stream: TcpStream,
    peer: SocketAddr,
    reader: FramedReader,
    receive_queue: Arc<PacketQueue>,
    max_packet_size: usize,
    idle_timeout: Duration,
    invalid_packet: bool,
}

impl PacketReceiver {
    pub fn new(stream: TcpStream, peer: SocketAddr, receive_queue: Arc<PacketQueue>, max_packet_size: usize, idle_timeout: Duration) -> PacketReceiver {
        PacketReceiver {
            stream,
            peer,
            reader: FramedReader::new(max_packet_size),
            receive_queue,
            max_packet_size,
            idle_timeout,
            invalid_packet: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.invalid_packet || matches!(self.reader.state(), ReadState::Error | ReadState::Done)
    }
}

impl Selectable for PacketReceiver {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.stream
    }

    fn wants_read(&self) -> bool {
        !self.is_finished()
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn handle_io(&mut self, readable: bool, _writable: bool, _spawned: &mut Vec<Box<dyn Selectable>>) {
        if !readable {
            return;
        }

        while !self.is_finished() {
            match self.reader.read_step(&mut self.stream) {
                Poll::Pending => break,
                Poll::Ready(ReadState::Receiving) => {}
                Poll::Ready(ReadState::Idle) => {
                    if let Some(frame) = self.reader.take_frame() {
                        if !deliver_packet(&frame, self.peer, self.max_packet_size, &self.receive_queue) {
                            self.invalid_packet = true;
                        }
                    }
                }
                Poll::Ready(ReadState::Done) => trace!("connection from {:?} closed by peer", self.peer),
                Poll::Ready(ReadState::Error) => debug!("error on connection from {:?}", self.peer),
            }
        }
    }

    fn handle_timeout(&mut self) {
        if !self.is_finished() {
            debug!("closing idle connection from {:?}", self.peer);
        }
    }

    fn timeout(&self) -> Option<Duration> {
        if self.is_finished() {
            Some(Duration::ZERO)
        }
        else {
            Some(self.idle_timeout)
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
