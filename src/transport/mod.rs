//! The packet transport: a worker thread that owns all sockets and moves packets between
//!  thread-safe queues and the network.
//!
//! Callers push [OutboundPacket]s to the send queue (or call [PacketTransport::enqueue]), and
//!  consume received packets from the receive queue. The worker routes each outbound packet:
//!
//! * packets to multicast groups always go as datagrams (there are no TCP connections to groups)
//! * if there is a cached TCP connection to the destination, it is used regardless of the hint
//! * otherwise UDP-hinted packets go as datagrams if they fit, everything else opens a new TCP
//!   connection which is then cached for subsequent packets to the same destination
//!
//! There is at most one cached connection per destination. Connections are dropped when they
//!  fail or time out, and packets queued on them are lost: retrying is left to the layer above.

pub mod sink;
mod work_loop;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use anyhow::{anyhow, bail, Context};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};
use crate::addr::IpPort;
use crate::config::TransportConfig;
use crate::net::datagram::{DatagramReceiver, DatagramSender};
use crate::net::listener::TcpListenerSelectable;
use crate::net::multiplexer::{Multiplexer, SelectableId, SelectorHandle};
use crate::net::selectable::Selectable;
use crate::net::PacketQueue;
use crate::packet::Packet;
use crate::util::blocking_queue::BlockingQueue;
use crate::transport::work_loop::{Command, ConnectionCache, WorkLoop, WorkLoopSettings};

/// Which transport the caller prefers for a packet. This is a hint: multicast destinations
///  force UDP, cached connections and oversized packets force TCP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportHint {
    Udp,
    Tcp,
}

#[derive(Clone, Debug)]
pub struct OutboundPacket {
    pub packet: Packet,
    pub destination: IpPort,
    pub hint: TransportHint,
}

enum WorkerState {
    NotStarted(Box<WorkLoop>),
    Running(JoinHandle<()>),
    Stopped,
}

pub struct PacketTransport {
    addr: IpPort,
    send_queue: Arc<BlockingQueue<OutboundPacket>>,
    receive_queue: Arc<PacketQueue>,
    commands: Arc<BlockingQueue<Command>>,
    cache: ConnectionCache,
    terminated: Arc<AtomicBool>,
    selector: SelectorHandle,
    worker: Mutex<WorkerState>,
}

impl PacketTransport {
    /// Binds the TCP listen socket and the UDP receive socket to the same free port. Failing to
    ///  find one is fatal for the transport.
    pub fn new(config: TransportConfig) -> anyhow::Result<PacketTransport> {
        config.validate()?;

        let mut multiplexer = Multiplexer::new()?;
        let selector = multiplexer.handle();

        let notify_on_push = {
            let selector = selector.clone();
            Arc::new(move || selector.notify())
        };
        let send_queue = Arc::new(BlockingQueue::with_push_listener(notify_on_push.clone()));
        let commands = Arc::new(BlockingQueue::with_push_listener(notify_on_push));
        let receive_queue = Arc::new(PacketQueue::new());

        let (listener, udp_socket, port) = bind_free_port(&config)?;
        let addr = IpPort::from_ipv4(config.advertised_ip, port);
        info!("packet transport bound to port {}, advertised as {}", port, addr);

        multiplexer.add_permanent(Box::new(TcpListenerSelectable::new(
            listener,
            receive_queue.clone(),
            config.max_packet_size,
            config.received_connection_idle_timeout,
        )))?;
        multiplexer.add_permanent(Box::new(DatagramReceiver::new(
            udp_socket,
            config.datagram_receive_buffer_size,
            config.max_udp_packet_size,
            receive_queue.clone(),
        )))?;
        let datagram_sender = multiplexer.add_permanent(Box::new(DatagramSender::bind(config.bind_ip)?))?;

        let cache: ConnectionCache = Arc::new(RwLock::new(FxHashMap::default()));
        let terminated = Arc::new(AtomicBool::new(false));

        let work_loop = WorkLoop::new(
            multiplexer,
            datagram_sender,
            send_queue.clone(),
            commands.clone(),
            cache.clone(),
            terminated.clone(),
            WorkLoopSettings {
                local_addr: addr,
                max_udp_packet_size: config.max_udp_packet_size,
                cached_connection_idle_timeout: config.cached_connection_idle_timeout,
                working_timeout: config.working_timeout,
            },
        );

        Ok(PacketTransport {
            addr,
            send_queue,
            receive_queue,
            commands,
            cache,
            terminated,
            selector,
            worker: Mutex::new(WorkerState::NotStarted(Box::new(work_loop))),
        })
    }

    /// Binds and starts a transport
    pub fn start_new(config: TransportConfig) -> anyhow::Result<PacketTransport> {
        let result = Self::new(config)?;
        result.start()?;
        Ok(result)
    }

    /// the address this transport is reachable at, which is stamped into outgoing packets
    pub fn addr(&self) -> IpPort {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock()
            .unwrap_or_else(|e| e.into_inner());

        match std::mem::replace(&mut *worker, WorkerState::Stopped) {
            WorkerState::NotStarted(work_loop) => {
                let handle = thread::Builder::new()
                    .name(format!("packet-transport-{}", self.addr.port()))
                    .spawn(move || work_loop.run())
                    .context("spawning packet transport worker")?;
                *worker = WorkerState::Running(handle);
                Ok(())
            }
            other => {
                *worker = other;
                bail!("packet transport was already started")
            }
        }
    }

    /// Terminates the worker thread and closes all sockets. Packets that were not sent yet are
    ///  dropped. The receive queue is closed, so its consumers can take the remaining packets and
    ///  then see the end of the stream.
    pub fn stop(&self) {
        let previous = {
            let mut worker = self.worker.lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *worker, WorkerState::Stopped)
        };

        self.terminated.store(true, Ordering::Release);
        self.send_queue.close();
        self.commands.close();

        if let WorkerState::Running(handle) = previous {
            self.selector.force_timeout();
            if handle.join().is_err() {
                warn!("packet transport worker panicked");
            }
        }
        // releases callers waiting for commands that never ran
        drop(self.commands.drain());
        self.receive_queue.close();
        self.cache.write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("packet transport {} stopped", self.addr);
    }

    pub fn get_send_queue(&self) -> &Arc<BlockingQueue<OutboundPacket>> {
        &self.send_queue
    }

    pub fn get_receive_queue(&self) -> &Arc<PacketQueue> {
        &self.receive_queue
    }

    /// Fire-and-forget send. Returns `false` if the transport is stopped.
    pub fn enqueue(&self, packet: Packet, destination: IpPort, hint: TransportHint) -> bool {
        trace!("enqueueing packet for {} via {:?}", destination, hint);
        self.send_queue.push(OutboundPacket { packet, destination, hint })
    }

    pub fn has_cached_connection(&self, destination: IpPort) -> bool {
        self.cache.read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&destination)
    }

    /// Registers a selectable that lives until it is explicitly removed, e.g. a multicast
    ///  group receiver
    pub fn add_permanent_selectable(&self, selectable: Box<dyn Selectable>) -> anyhow::Result<SelectableId> {
        self.on_worker(move |work_loop| work_loop.multiplexer.add_permanent(selectable))?
    }

    /// Unregisters a permanent selectable and returns it
    pub fn remove_permanent_selectable(&self, id: SelectableId) -> anyhow::Result<Option<Box<dyn Selectable>>> {
        self.on_worker(move |work_loop| work_loop.multiplexer.remove(id))
    }

    /// Joins a multicast group, feeding the group's packets into the receive queue
    pub fn join_multicast_group(&self, group: IpPort, interface: Ipv4Addr, config: &TransportConfig) -> anyhow::Result<SelectableId> {
        let receiver = DatagramReceiver::join_multicast(
            group,
            interface,
            config.datagram_receive_buffer_size,
            config.max_udp_packet_size,
            self.receive_queue.clone(),
        )?;
        self.add_permanent_selectable(Box::new(receiver))
    }

    /// Closes all cached outgoing connections and all accepted incoming connections, leaving
    ///  the permanent sockets intact. Returns the number of closed connections.
    pub fn clear_idle_and_cached_connections(&self) -> anyhow::Result<usize> {
        self.on_worker(|work_loop| work_loop.clear_idle_and_cached_connections())
    }

    /// Runs `f` with exclusive access to the sockets: directly if the worker is not started yet,
    ///  otherwise on the worker thread, waiting for the result.
    fn on_worker<R: Send + 'static>(&self, f: impl FnOnce(&mut WorkLoop) -> R + Send + 'static) -> anyhow::Result<R> {
        let mut worker = self.worker.lock()
            .unwrap_or_else(|e| e.into_inner());

        if let WorkerState::NotStarted(work_loop) = &mut *worker {
            return Ok(f(work_loop));
        }
        if matches!(*worker, WorkerState::Stopped) {
            bail!("packet transport is stopped");
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let command: Command = Box::new(move |work_loop| {
            let _ = reply_tx.send(f(work_loop));
        });
        if !self.commands.push(command) {
            bail!("packet transport is stopped");
        }
        drop(worker);

        reply_rx.recv()
            .map_err(|_| anyhow!("packet transport worker terminated"))
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_free_port(config: &TransportConfig) -> anyhow::Result<(mio::net::TcpListener, mio::net::UdpSocket, u16)> {
    for attempt in 0..config.port_search_attempts {
        let candidate = if config.port == 0 {
            0
        }
        else {
            match config.port.checked_add(attempt) {
                Some(port) => port,
                None => break,
            }
        };

        let listener = match std::net::TcpListener::bind(SocketAddrV4::new(config.bind_ip, candidate)) {
            Ok(listener) => listener,
            Err(e) => {
                trace!("port {} not available for TCP: {}", candidate, e);
                continue;
            }
        };
        let port = listener.local_addr()?.port();

        let udp_socket = match std::net::UdpSocket::bind(SocketAddrV4::new(config.bind_ip, port)) {
            Ok(socket) => socket,
            Err(e) => {
                trace!("port {} not available for UDP: {}", port, e);
                continue;
            }
        };

        listener.set_nonblocking(true)?;
        udp_socket.set_nonblocking(true)?;
        debug!("found free port {} after {} attempts", port, attempt + 1);
        return Ok((
            mio::net::TcpListener::from_std(listener),
            mio::net::UdpSocket::from_std(udp_socket),
            port,
        ));
    }

    bail!("failed to open listening port for TCP and UDP on {:?} after {} attempts starting at {}",
        SocketAddr::V4(SocketAddrV4::new(config.bind_ip, config.port)), config.port_search_attempts, config.port)
}
