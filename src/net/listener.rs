use std::any::Any;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use mio::net::TcpListener;
use tracing::{debug, trace, warn};
use crate::net::packet_receiver::PacketReceiver;
use crate::net::selectable::Selectable;
use crate::net::PacketQueue;

/// The TCP listen socket. Every accepted connection becomes a [PacketReceiver] that feeds the
///  receive queue.
pub struct TcpListenerSelectable {
    listener: TcpListener,
    receive_queue: Arc<PacketQueue>,
    max_packet_size: usize,
    connection_idle_timeout: Duration,
}

impl TcpListenerSelectable {
    pub fn new(listener: TcpListener, receive_queue: Arc<PacketQueue>, max_packet_size: usize, connection_idle_timeout: Duration) -> TcpListenerSelectable {
        TcpListenerSelectable {
            listener,
            receive_queue,
            max_packet_size,
            connection_idle_timeout,
        }
    }
}

impl Selectable for TcpListenerSelectable {
    fn source(&mut self) -> &mut dyn mio::event::Source {
        &mut self.listener
    }

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn handle_io(&mut self, readable: bool, _writable: bool, spawned: &mut Vec<Box<dyn Selectable>>) {
        if !readable {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    trace!("accepted connection from {:?}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("could not set TCP_NODELAY for connection from {:?}: {}", peer, e);
                    }
                    spawned.push(Box::new(PacketReceiver::new(
                        stream,
                        peer,
                        self.receive_queue.clone(),
                        self.max_packet_size,
                        self.connection_idle_timeout,
                    )));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("error accepting connection: {}", e);
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
