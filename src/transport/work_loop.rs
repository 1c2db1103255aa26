use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};
use crate::addr::IpPort;
use crate::net::datagram::DatagramSender;
use crate::net::multiplexer::{Multiplexer, SelectableId};
use crate::net::packet_sender::PacketSender;
use crate::net::selectable::Selectable;
use crate::transport::{OutboundPacket, TransportHint};
use crate::util::blocking_queue::BlockingQueue;

pub(crate) type ConnectionCache = Arc<RwLock<FxHashMap<IpPort, SelectableId>>>;

/// Work that other threads hand to the worker thread because it touches sockets
pub(crate) type Command = Box<dyn FnOnce(&mut WorkLoop) + Send>;

/// The state owned by the worker thread: the multiplexer with all sockets, and the routing of
///  outbound packets to datagrams or cached connections
pub(crate) struct WorkLoop {
    pub multiplexer: Multiplexer,
    local_addr: IpPort,
    datagram_sender: SelectableId,
    send_queue: Arc<BlockingQueue<OutboundPacket>>,
    commands: Arc<BlockingQueue<Command>>,
    cache: ConnectionCache,
    terminated: Arc<AtomicBool>,
    max_udp_packet_size: usize,
    cached_connection_idle_timeout: Duration,
    working_timeout: Duration,
}

pub(crate) struct WorkLoopSettings {
    pub local_addr: IpPort,
    pub max_udp_packet_size: usize,
    pub cached_connection_idle_timeout: Duration,
    pub working_timeout: Duration,
}

impl WorkLoop {
    pub fn new(
        multiplexer: Multiplexer,
        datagram_sender: SelectableId,
        send_queue: Arc<BlockingQueue<OutboundPacket>>,
        commands: Arc<BlockingQueue<Command>>,
        cache: ConnectionCache,
        terminated: Arc<AtomicBool>,
        settings: WorkLoopSettings,
    ) -> WorkLoop {
        WorkLoop {
            multiplexer,
            local_addr: settings.local_addr,
            datagram_sender,
            send_queue,
            commands,
            cache,
            terminated,
            max_udp_packet_size: settings.max_udp_packet_size,
            cached_connection_idle_timeout: settings.cached_connection_idle_timeout,
            working_timeout: settings.working_timeout,
        }
    }

    pub fn run(mut self) {
        info!("starting packet transport worker for {}", self.local_addr);

        while !self.terminated.load(Ordering::Acquire) {
            self.pass();
        }

        let num_dropped = self.send_queue.drain().len();
        if num_dropped > 0 {
            debug!("dropping {} unsent packets on shutdown", num_dropped);
        }
        info!("packet transport worker for {} terminated", self.local_addr);
    }

    fn pass(&mut self) {
        self.run_commands();
        self.dequeue_send_packets();

        match self.multiplexer.select() {
            Ok(timed_out) => {
                for (id, selectable) in timed_out {
                    self.on_timed_out(id, selectable.as_ref());
                }
            }
            Err(e) => {
                error!("error in multiplexer: {:#}", e);
                // avoid spinning on a persistent error
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    pub fn run_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            command(self);
        }
    }

    fn on_timed_out(&mut self, id: SelectableId, selectable: &dyn Selectable) {
        if let Some(destination) = selectable.cached_destination() {
            self.remove_cache_entry(destination, id);
        }
        trace!("destroyed selectable #{}", id);
    }

    fn remove_cache_entry(&self, destination: IpPort, id: SelectableId) {
        let mut cache = self.cache.write()
            .unwrap_or_else(|e| e.into_inner());
        if cache.get(&destination) == Some(&id) {
            trace!("removing cached connection to {}", destination);
            cache.remove(&destination);
        }
    }

    pub fn dequeue_send_packets(&mut self) {
        for outbound in self.send_queue.drain() {
            self.send(outbound);
        }
    }

    fn send(&mut self, outbound: OutboundPacket) {
        let OutboundPacket { mut packet, destination, hint } = outbound;
        if packet.header.origin.is_unset() {
            packet.header.origin = self.local_addr;
        }
        let raw = packet.to_bytes();
        trace!("sending {:?} to {} via {:?}", packet, destination, hint);

        if destination.is_multicast() {
            if raw.len() > self.max_udp_packet_size {
                error!("packet of {} bytes is too big for UDP to multicast group {}, dropping it: {:?}", raw.len(), destination, packet.header);
            }
            else {
                self.send_datagram(raw, destination);
            }
            return;
        }

        if self.send_with_cached(&raw, destination) {
            return;
        }

        if hint == TransportHint::Udp {
            if raw.len() <= self.max_udp_packet_size {
                self.send_datagram(raw, destination);
                return;
            }
            debug!("packet of {} bytes is too big for UDP, sending it to {} via TCP", raw.len(), destination);
        }

        self.send_with_new_connection(raw, destination);
    }

    fn send_datagram(&mut self, raw: Bytes, destination: IpPort) {
        let id = self.datagram_sender;
        self.multiplexer.with_selectable::<DatagramSender, _>(id, |s| s.enqueue(raw, destination));
        self.multiplexer.update(id);
    }

    fn send_with_cached(&mut self, raw: &Bytes, destination: IpPort) -> bool {
        let cached = self.cache.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&destination)
            .copied();
        let Some(id) = cached else {
            return false;
        };

        let enqueued = self.multiplexer.with_selectable::<PacketSender, _>(id, |s| s.enqueue(raw.clone()));
        if enqueued.is_none() {
            warn!("stale connection cache entry for {} - removing", destination);
            self.remove_cache_entry(destination, id);
            return false;
        }
        trace!("sending to {} via cached connection #{}", destination, id);
        self.multiplexer.update(id);
        true
    }

    fn send_with_new_connection(&mut self, raw: Bytes, destination: IpPort) {
        let mut sender = match PacketSender::connect(destination, self.cached_connection_idle_timeout, self.working_timeout) {
            Ok(sender) => sender,
            Err(e) => {
                warn!("can not connect, dropping packet: {:#}", e);
                return;
            }
        };
        sender.enqueue(raw);

        match self.multiplexer.add(Box::new(sender)) {
            Ok(id) => {
                debug!("opened connection #{} to {}", id, destination);
                self.cache.write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(destination, id);
            }
            Err(e) => warn!("can not register connection to {}, dropping packet: {:#}", destination, e),
        }
    }

    /// Closes all cached outgoing connections and all accepted connections
    pub fn clear_idle_and_cached_connections(&mut self) -> usize {
        let removed = self.multiplexer.remove_all_transient();
        self.cache.write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("closed {} connections", removed.len());
        removed.len()
    }
}
