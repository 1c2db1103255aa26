//! Tracks outstanding requests, resends them until they are answered or their resends are
//!  exhausted, and matches incoming replies to them.
//!
//! A [ResendHandler] runs two threads on top of a [PacketSink]: the receive thread consumes the
//!  transport's receive queue and matches acknowledges, leader replies and answers to pending
//!  requests by (request id, packet id). The timeout thread waits for the earliest resend
//!  deadline and resends or gives up. Both share one lock around the pending requests.
//!
//! Finished requests (answered or failed) are handed back through a FIFO answer queue.

pub mod container;
pub mod dispatch;
pub mod leader;
pub mod pending;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use anyhow::{bail, Context};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::addr::resolver::ModuleType;
use crate::addr::IpPort;
use crate::config::ResendConfig;
use crate::net::PacketQueue;
use crate::packet::control::{AcknowledgeReply, LeaderIpReply};
use crate::packet::packet_type::{status, PacketType};
use crate::packet::Packet;
use crate::resend::container::RequestContainer;
use crate::resend::dispatch::Dispatcher;
use crate::resend::leader::LeaderDirectory;
use crate::resend::pending::PendingRequests;
use crate::transport::sink::PacketSink;
use crate::transport::PacketTransport;
use crate::util::blocking_queue::BlockingQueue;
use crate::util::id_source::RequestIdSource;

struct ResendState {
    pending: PendingRequests,
    leaders: LeaderDirectory,
    started: bool,
    stopped: bool,
}

struct Shared {
    config: ResendConfig,
    sink: Arc<dyn PacketSink>,
    state: Mutex<ResendState>,
    changed: Condvar,
    answers: BlockingQueue<RequestContainer>,
    receive_queue: Arc<PacketQueue>,
}

pub struct ResendHandler {
    shared: Arc<Shared>,
    request_ids: RequestIdSource,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ResendHandler {
    /// `receive_queue` is where the transport behind `sink` delivers incoming packets. The
    ///  handler must be the only consumer of that queue.
    pub fn new(config: ResendConfig, sink: Arc<dyn PacketSink>, receive_queue: Arc<PacketQueue>) -> anyhow::Result<ResendHandler> {
        config.validate()?;

        let leaders = LeaderDirectory::new(config.leader_mapping_grace);
        Ok(ResendHandler {
            shared: Arc::new(Shared {
                config,
                sink,
                state: Mutex::new(ResendState {
                    pending: PendingRequests::default(),
                    leaders,
                    started: false,
                    stopped: false,
                }),
                changed: Condvar::new(),
                answers: BlockingQueue::new(),
                receive_queue,
            }),
            request_ids: RequestIdSource::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn with_transport(config: ResendConfig, transport: Arc<PacketTransport>) -> anyhow::Result<ResendHandler> {
        let receive_queue = transport.get_receive_queue().clone();
        Self::new(config, transport, receive_queue)
    }

    pub fn config(&self) -> &ResendConfig {
        &self.shared.config
    }

    /// A fresh request id for requests sent through this handler
    pub fn next_request_id(&self) -> u16 {
        self.request_ids.next_id()
    }

    /// Wraps a request with the configured default resend timeout and number of resends
    pub fn request(&self, packet: Packet, destination: IpPort, module_type: ModuleType) -> RequestContainer {
        RequestContainer::new(
            packet,
            destination,
            module_type,
            self.shared.config.default_resend_timeout,
            self.shared.config.default_max_resend,
        )
    }

    pub fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                bail!("resend handler was stopped");
            }
            if state.started {
                bail!("resend handler is already running");
            }
            state.started = true;
        }

        let mut threads = self.threads.lock()
            .unwrap_or_else(|e| e.into_inner());

        let shared = self.shared.clone();
        threads.push(thread::Builder::new()
            .name("resend-receive".to_string())
            .spawn(move || shared.receive_loop())
            .context("spawning resend receive thread")?);

        let shared = self.shared.clone();
        threads.push(thread::Builder::new()
            .name("resend-timeout".to_string())
            .spawn(move || shared.timeout_loop())
            .context("spawning resend timeout thread")?);

        info!("resend handler started");
        Ok(())
    }

    /// Stops both threads and releases callers blocked in [ResendHandler::get_answer]. Requests
    ///  that are still pending are dropped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            if !state.pending.is_empty() {
                debug!("dropping {} pending requests on shutdown", state.pending.len());
            }
        }
        self.shared.changed.notify_all();
        self.shared.answers.close();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in threads {
            if handle.join().is_err() {
                error!("resend thread panicked");
            }
        }
        info!("resend handler stopped");
    }

    /// Registers a request for resending and sends it. Fails if a request with the same request
    ///  id and packet id is already pending, or if the handler was stopped.
    pub fn add_and_send(&self, mut container: RequestContainer) -> anyhow::Result<()> {
        let now = Instant::now();
        container.set_server_timestamp(now);
        let key = container.request_key();

        {
            let mut state = self.shared.lock();
            if state.stopped {
                bail!("resend handler was stopped");
            }
            state.pending.insert(container)?;

            let ResendState { pending, leaders, .. } = &mut *state;
            if let Some(container) = pending.get_mut(key) {
                self.shared.dispatcher().send(leaders, container, now);
            }
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Blocks until a request is finished. Returns `None` once the handler is stopped and all
    ///  finished requests were taken.
    pub fn get_answer(&self) -> Option<RequestContainer> {
        self.shared.answers.pop()
    }

    pub fn get_answer_now(&self) -> Option<RequestContainer> {
        self.shared.answers.try_pop()
    }

    pub fn get_answer_timeout(&self, max_wait: Duration) -> Option<RequestContainer> {
        self.shared.answers.pop_timeout(max_wait)
    }

    pub fn num_pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl Drop for ResendHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ResendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            sink: self.sink.as_ref(),
            tcp_limit_size: self.config.tcp_limit_size,
        }
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn publish(&self, container: RequestContainer) {
        trace!("request {:?} finished after {} resends", container.request_key(), container.resend_count());
        if !self.answers.push(container) {
            debug!("answer queue is closed - dropping finished request");
        }
    }

    fn receive_loop(&self) {
        while !self.is_stopped() {
            match self.receive_queue.pop_timeout(self.config.receive_poll_interval) {
                Some(packet) => {
                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "reply_received", ?correlation_id);
                    let _entered = span.enter();

                    self.on_packet(packet);
                }
                None => {
                    if self.receive_queue.is_closed() {
                        debug!("receive queue was closed - terminating resend receive thread");
                        break;
                    }
                }
            }
        }
    }

    fn on_packet(&self, packet: Packet) {
        trace!("received {:?}", packet);

        match packet.packet_type() {
            Some(PacketType::Acknowledge) => self.on_acknowledge(&packet),
            Some(PacketType::LeaderIpReply) => self.on_leader_ip_reply(&packet),
            _ if packet.is_control() => {
                debug!("ignoring control packet {:?}", packet.header);
            }
            _ => self.on_reply(packet),
        }
    }

    fn on_acknowledge(&self, packet: &Packet) {
        let ack = match AcknowledgeReply::from_packet(packet) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("received invalid acknowledge {:?}: {}", packet.header, e);
                return;
            }
        };
        let key = (ack.request_id, ack.packet_id);

        let mut state = self.lock();
        let ResendState { pending, leaders, .. } = &mut *state;
        let Some(container) = pending.get_mut(key) else {
            debug!("acknowledge for unknown request {:?} - discarding", key);
            return;
        };

        match ack.status {
            status::OK => {
                trace!("request {:?} acknowledged, resend timeout is now {:?}", key, ack.eta);
                container.set_resend_timeout(ack.eta);
                pending.reschedule(key);
                drop(state);
                self.changed.notify_all();
            }
            status::MAP_LOADED => {
                debug!("map for request {:?} was loaded - resending", key);
                self.dispatcher().send(leaders, container, Instant::now());
            }
            other => {
                debug!("request {:?} was acknowledged with status {} - returning it", key, other);
                if let Some(mut container) = pending.remove(key) {
                    leaders.forget_request(key);
                    container.fail(other);
                    drop(state);
                    self.changed.notify_all();
                    self.publish(container);
                }
            }
        }
    }

    fn on_leader_ip_reply(&self, packet: &Packet) {
        let reply = match LeaderIpReply::from_packet(packet) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("received invalid leader IP reply {:?}: {}", packet.header, e);
                return;
            }
        };
        if reply.status != status::OK {
            debug!("leader discovery for {} failed with status {} - requests will be resent", reply.original_destination, reply.status);
            return;
        }

        let now = Instant::now();
        let dispatcher = self.dispatcher();

        let mut state = self.lock();
        let ResendState { pending, leaders, .. } = &mut *state;

        if reply.original_destination.is_multicast() {
            leaders.record(reply.original_destination, reply.leader, now);
        }

        let mut waiting = leaders.finish_discovery(reply.original_destination);
        let own_key = (reply.request_id, reply.packet_id);
        if !waiting.contains(&own_key) {
            waiting.push(own_key);
        }

        for key in waiting {
            match pending.get_mut(key) {
                Some(container) => {
                    debug!("sending request {:?} to leader {}", key, reply.leader);
                    dispatcher.send_direct(container, reply.leader);
                }
                None => trace!("request {:?} is no longer pending", key),
            }
        }
    }

    fn on_reply(&self, packet: Packet) {
        let key = packet.request_key();

        let mut state = self.lock();
        let Some(container) = state.pending.get_mut(key) else {
            debug!("reply for unknown request - discarding: {:?}", packet.header);
            return;
        };

        if !container.add_answer(packet) {
            return;
        }
        let finished = state.pending.remove(key);
        state.leaders.forget_request(key);
        drop(state);

        if let Some(container) = finished {
            self.changed.notify_all();
            self.publish(container);
        }
    }

    fn timeout_loop(&self) {
        let mut state = self.lock();
        loop {
            if state.stopped {
                break;
            }

            let now = Instant::now();
            let Some((deadline, key)) = state.pending.first() else {
                state = self.changed.wait(state)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            };

            if deadline > now {
                state = self.changed.wait_timeout(state, deadline - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                continue;
            }

            let ResendState { pending, leaders, .. } = &mut *state;
            let can_resend = pending.get(key)
                .map(|c| c.can_resend())
                .unwrap_or_default();

            if can_resend {
                if let Some(container) = pending.get_mut(key) {
                    container.start_resend(now);
                    debug!("resending request {:?} ({} of {})", key, container.resend_count(), container.max_resend());
                    self.dispatcher().send(leaders, container, now);
                }
                pending.reschedule(key);
            }
            else if let Some(container) = pending.remove(key) {
                leaders.forget_request(key);
                debug!("request {:?} was not answered after {} resends - giving up", key, container.resend_count());
                drop(state);
                self.publish(container);
                state = self.lock();
            }
        }
        debug!("resend timeout thread terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::control::LeaderIpRequest;
    use crate::test_util::{request_packet, TrackingPacketSink};
    use crate::transport::TransportHint;

    const GROUP: IpPort = IpPort::new(0xe101_0100, 8000);
    const UNICAST: IpPort = IpPort::new(0x0a00_0002, 8000);
    const LEADER: IpPort = IpPort::new(0x0a00_0001, 9000);

    fn config() -> ResendConfig {
        ResendConfig {
            tcp_limit_size: 16000,
            default_resend_timeout: Duration::from_millis(50),
            default_max_resend: 2,
            receive_poll_interval: Duration::from_millis(10),
            leader_mapping_grace: Duration::from_secs(5),
        }
    }

    fn handler(sink: &Arc<TrackingPacketSink>) -> (ResendHandler, Arc<PacketQueue>) {
        let receive_queue = Arc::new(PacketQueue::new());
        let handler = ResendHandler::new(config(), sink.clone(), receive_queue.clone()).unwrap();
        (handler, receive_queue)
    }

    fn reply(request: &Packet) -> Packet {
        Packet::reply_to(&request.header, PacketType::TestReply.into(), status::OK, b"answer")
    }

    #[test]
    fn test_answer_is_matched() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, receive_queue) = handler(&sink);
        handler.start().unwrap();

        let request = request_packet(7, 1, 10);
        handler.add_and_send(handler.request(request.clone(), UNICAST, ModuleType::Route)).unwrap();
        assert_eq!(sink.num_sent(), 1);

        receive_queue.push(reply(&request));
        let answer = handler.get_answer_timeout(Duration::from_secs(5)).unwrap();
        assert!(answer.is_answered());
        assert_eq!(answer.answer().unwrap().payload(), b"answer");
        assert_eq!(handler.num_pending(), 0);
    }

    #[test]
    fn test_duplicate_request_is_rejected() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, _) = handler(&sink);

        let request = request_packet(7, 1, 10);
        handler.add_and_send(handler.request(request.clone(), UNICAST, ModuleType::Route)).unwrap();
        assert!(handler.add_and_send(handler.request(request, UNICAST, ModuleType::Route)).is_err());
        assert_eq!(handler.num_pending(), 1);
    }

    #[test]
    fn test_resends_are_bounded() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, _) = handler(&sink);
        handler.start().unwrap();

        handler.add_and_send(handler.request(request_packet(7, 1, 10), UNICAST, ModuleType::Route)).unwrap();

        let failed = handler.get_answer_timeout(Duration::from_secs(5)).unwrap();
        assert!(!failed.is_answered());
        assert_eq!(failed.resend_count(), 2);
        assert_eq!(sink.num_sent(), 3);
        assert!(handler.get_answer_timeout(Duration::from_millis(200)).is_none());

        let resend_numbers = sink.sent().iter()
            .map(|p| p.packet.header.resend_nbr)
            .collect::<Vec<_>>();
        assert_eq!(resend_numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_acknowledge_extends_timeout() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, receive_queue) = handler(&sink);

        let request = request_packet(7, 1, 10);
        handler.add_and_send(handler.request(request.clone(), UNICAST, ModuleType::Route)).unwrap();
        receive_queue.push(AcknowledgeReply::for_request(&request.header, status::OK, Duration::from_secs(60)).to_packet());
        handler.start().unwrap();

        assert!(handler.get_answer_timeout(Duration::from_millis(300)).is_none());
        assert_eq!(sink.num_sent(), 1);
        assert_eq!(handler.num_pending(), 1);
    }

    #[test]
    fn test_acknowledge_with_error_fails_request() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, receive_queue) = handler(&sink);
        handler.start().unwrap();

        let request = request_packet(7, 1, 10);
        handler.add_and_send(handler.request(request.clone(), UNICAST, ModuleType::Route)).unwrap();
        receive_queue.push(AcknowledgeReply::for_request(&request.header, status::MAP_NOT_FOUND, Duration::ZERO).to_packet());

        let failed = handler.get_answer_timeout(Duration::from_secs(5)).unwrap();
        assert!(!failed.is_answered());
        assert_eq!(failed.failure_status(), Some(status::MAP_NOT_FOUND));
    }

    #[test]
    fn test_map_loaded_resends_immediately() {
        let sink = Arc::new(TrackingPacketSink::default());
        let receive_queue = Arc::new(PacketQueue::new());
        let config = ResendConfig {
            default_resend_timeout: Duration::from_secs(60),
            ..config()
        };
        let handler = ResendHandler::new(config, sink.clone(), receive_queue.clone()).unwrap();
        handler.start().unwrap();

        let request = request_packet(7, 1, 10);
        handler.add_and_send(handler.request(request.clone(), UNICAST, ModuleType::Route)).unwrap();
        receive_queue.push(AcknowledgeReply::for_request(&request.header, status::MAP_LOADED, Duration::ZERO).to_packet());

        assert!(sink.wait_for_sent(2, Duration::from_secs(5)));
        assert_eq!(handler.num_pending(), 1);
    }

    #[test]
    fn test_unknown_reply_is_discarded() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, receive_queue) = handler(&sink);
        handler.start().unwrap();

        receive_queue.push(reply(&request_packet(99, 1, 10)));
        assert!(handler.get_answer_timeout(Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_leader_discovery() {
        let sink = Arc::new(TrackingPacketSink::default());
        let receive_queue = Arc::new(PacketQueue::new());
        let config = ResendConfig {
            default_resend_timeout: Duration::from_secs(60),
            ..config()
        };
        let handler = ResendHandler::new(config, sink.clone(), receive_queue.clone()).unwrap();
        handler.start().unwrap();

        let big = request_packet(7, 1, 20000);
        handler.add_and_send(handler.request(big.clone(), GROUP, ModuleType::Route)).unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, GROUP);
        assert_eq!(sent[0].hint, TransportHint::Udp);
        let discovery = LeaderIpRequest::from_packet(&sent[0].packet).unwrap();
        assert_eq!(discovery.original_destination, GROUP);

        receive_queue.push(LeaderIpReply::for_request(&discovery, status::OK, LEADER).to_packet());
        assert!(sink.wait_for_sent(2, Duration::from_secs(5)));

        let sent = sink.sent();
        assert_eq!(sent[1].destination, LEADER);
        assert_eq!(sent[1].hint, TransportHint::Tcp);
        assert_eq!(sent[1].packet.request_key(), big.request_key());

        receive_queue.push(reply(&big));
        let answer = handler.get_answer_timeout(Duration::from_secs(5)).unwrap();
        assert!(answer.is_answered());
    }

    #[test]
    fn test_failed_request_leaves_leader_discovery() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, _) = handler(&sink);
        handler.start().unwrap();

        handler.add_and_send(handler.request(request_packet(7, 1, 20000), GROUP, ModuleType::Route)).unwrap();
        assert!(handler.shared.lock().leaders.is_discovering(GROUP));

        let failed = handler.get_answer_timeout(Duration::from_secs(5)).unwrap();
        assert!(!failed.is_answered());
        assert!(!handler.shared.lock().leaders.is_discovering(GROUP));
        assert!(sink.sent().iter().all(|p| p.destination == GROUP && p.hint == TransportHint::Udp));
    }

        #[test]
    fn test_stop_releases_get_answer() {
        let sink = Arc::new(TrackingPacketSink::default());
        let (handler, _) = handler(&sink);
        let handler = Arc::new(handler);
        handler.start().unwrap();

        let waiting = {
            let handler = handler.clone();
            thread::spawn(move || handler.get_answer())
        };
        thread::sleep(Duration::from_millis(50));
        handler.stop();

        assert!(waiting.join().unwrap().is_none());
        assert!(handler.add_and_send(handler.request(request_packet(1, 1, 1), UNICAST, ModuleType::Map)).is_err());
        assert!(handler.start().is_err());
    }
}
