use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Context;
use mio::{Events, Interest, Poll, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};
use crate::net::selectable::Selectable;

pub type SelectableId = usize;

/// mio reserves `Token(usize::MAX)`, selectable ids stay below this
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 1024;

struct Entry {
    selectable: Box<dyn Selectable>,
    permanent: bool,
    /// fixed at insertion, breaks ties between equal deadlines
    seq: u64,
    deadline: Option<Instant>,
    registered: Option<Interest>,
}

/// Lets other threads interrupt a blocking [Multiplexer::select]
#[derive(Clone)]
pub struct SelectorHandle {
    waker: Arc<Waker>,
    force_timeout: Arc<AtomicBool>,
}

impl SelectorHandle {
    /// Makes a blocking `select` return so that the caller can pick up new work
    pub fn notify(&self) {
        if let Err(e) = self.waker.wake() {
            error!("error waking multiplexer: {}", e);
        }
    }

    /// Makes the current or next `select` return immediately without dispatching any I/O
    pub fn force_timeout(&self) {
        self.force_timeout.store(true, Ordering::Release);
        self.notify();
    }
}

/// A reactor over a set of [Selectable]s: each call to [Multiplexer::select] waits for readiness
///  of any of them, bounded by the nearest timeout, dispatches I/O and reports the selectables
///  that timed out.
///
/// Selectables are either transient or permanent. Transient selectables are removed and handed
///  to the caller when they time out, permanent ones are only notified and stay registered.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    handle: SelectorHandle,
    entries: FxHashMap<SelectableId, Entry>,
    deadlines: BTreeSet<(Instant, u64, SelectableId)>,
    /// selectables that get a synthetic 'writable' dispatch on the next pass
    kicked: Vec<SelectableId>,
    next_id: SelectableId,
    next_seq: u64,
}

impl Multiplexer {
    pub fn new() -> anyhow::Result<Multiplexer> {
        let poll = Poll::new()
            .context("creating poll instance")?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .context("creating waker")?;

        Ok(Multiplexer {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handle: SelectorHandle {
                waker: Arc::new(waker),
                force_timeout: Arc::new(AtomicBool::new(false)),
            },
            entries: FxHashMap::default(),
            deadlines: BTreeSet::default(),
            kicked: Vec::new(),
            next_id: 0,
            next_seq: 0,
        })
    }

    pub fn handle(&self) -> SelectorHandle {
        self.handle.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: SelectableId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn add(&mut self, selectable: Box<dyn Selectable>) -> anyhow::Result<SelectableId> {
        self.do_add(selectable, false)
    }

    pub fn add_permanent(&mut self, selectable: Box<dyn Selectable>) -> anyhow::Result<SelectableId> {
        self.do_add(selectable, true)
    }

    fn do_add(&mut self, selectable: Box<dyn Selectable>, permanent: bool) -> anyhow::Result<SelectableId> {
        let id = self.take_id();
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut entry = Entry {
            selectable,
            permanent,
            seq,
            deadline: None,
            registered: None,
        };
        Self::sync_registration(&self.poll, id, &mut entry)?;
        self.entries.insert(id, entry);
        self.reset_deadline(id, Instant::now());

        trace!("added selectable #{} (permanent: {})", id, permanent);
        Ok(id)
    }

    /// The next id that is not in use. Ids wrap around below [WAKE_TOKEN].
    fn take_id(&mut self) -> SelectableId {
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == WAKE_TOKEN.0 - 1 { 0 } else { self.next_id + 1 };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn remove(&mut self, id: SelectableId) -> Option<Box<dyn Selectable>> {
        let mut entry = self.entries.remove(&id)?;
        if let Some(deadline) = entry.deadline {
            self.deadlines.remove(&(deadline, entry.seq, id));
        }
        if entry.registered.is_some() {
            if let Err(e) = self.poll.registry().deregister(entry.selectable.source()) {
                debug!("error deregistering selectable #{}: {}", id, e);
            }
        }
        self.kicked.retain(|&k| k != id);
        trace!("removed selectable #{}", id);
        Some(entry.selectable)
    }

    /// Removes all transient selectables, leaving only the permanent ones
    pub fn remove_all_transient(&mut self) -> Vec<Box<dyn Selectable>> {
        let transient = self.entries.iter()
            .filter(|(_, e)| !e.permanent)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        transient.into_iter()
            .flat_map(|id| self.remove(id))
            .collect()
    }

    /// Accesses a registered selectable as its concrete type. Callers that change what the
    ///  selectable waits for must call [Multiplexer::update] afterwards.
    pub fn with_selectable<T: Selectable, R>(&mut self, id: SelectableId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let entry = self.entries.get_mut(&id)?;
        let concrete = entry.selectable.as_any_mut().downcast_mut::<T>()?;
        Some(f(concrete))
    }

    /// Re-evaluates interest and timeout of a selectable after it was changed from the outside,
    ///  and dispatches it on the next pass in case its socket is already writable.
    pub fn update(&mut self, id: SelectableId) {
        if !self.entries.contains_key(&id) {
            return;
        }
        self.refresh(id, Instant::now());
        if !self.kicked.contains(&id) {
            self.kicked.push(id);
        }
    }

    /// Performs one pass: waits for readiness or the nearest timeout, dispatches I/O and handles
    ///  timeouts. Returns the transient selectables that timed out - they are no longer part of
    ///  the multiplexer.
    pub fn select(&mut self) -> anyhow::Result<Vec<(SelectableId, Box<dyn Selectable>)>> {
        let poll_timeout = self.poll_timeout(Instant::now());
        trace!("waiting for readiness, timeout {:?}", poll_timeout);

        match self.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => self.events.clear(),
            Err(e) => return Err(e).context("polling for readiness"),
        }

        if self.handle.force_timeout.swap(false, Ordering::AcqRel) {
            debug!("forced return from select");
            return Ok(Vec::new());
        }

        let mut ready: Vec<(SelectableId, bool, bool)> = Vec::with_capacity(self.kicked.len() + 8);
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let error = event.is_error();
            ready.push((
                event.token().0,
                event.is_readable() || event.is_read_closed() || error,
                event.is_writable() || event.is_write_closed() || error,
            ));
        }
        for id in std::mem::take(&mut self.kicked) {
            match ready.iter_mut().find(|(r, _, _)| *r == id) {
                Some(existing) => existing.2 = true,
                None => ready.push((id, false, true)),
            }
        }

        let mut spawned = Vec::new();
        for (id, readable, writable) in ready {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.selectable.handle_io(readable, writable, &mut spawned);
                self.refresh(id, Instant::now());
            }
        }
        for selectable in spawned {
            if let Err(e) = self.add(selectable) {
                warn!("error registering new selectable: {:#}", e);
            }
        }

        Ok(self.handle_timeouts(Instant::now()))
    }

    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.kicked.is_empty() || self.handle.force_timeout.load(Ordering::Acquire) {
            return Some(Duration::ZERO);
        }
        self.deadlines.first()
            .map(|(deadline, _, _)| deadline.saturating_duration_since(now))
    }

    fn handle_timeouts(&mut self, now: Instant) -> Vec<(SelectableId, Box<dyn Selectable>)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, seq, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, seq, id));
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.deadline = None;
            }
            expired.push(id);
        }

        let mut timed_out = Vec::new();
        for id in expired {
            let Some(entry) = self.entries.get_mut(&id) else { continue };
            if entry.permanent {
                trace!("timeout of permanent selectable #{}", id);
                entry.selectable.handle_timeout();
                self.refresh(id, now);
            }
            else if let Some(mut selectable) = self.remove(id) {
                trace!("timeout of selectable #{}", id);
                selectable.handle_timeout();
                timed_out.push((id, selectable));
            }
        }
        timed_out
    }

    fn refresh(&mut self, id: SelectableId, now: Instant) {
        let Some(entry) = self.entries.get_mut(&id) else { return };
        if let Err(e) = Self::sync_registration(&self.poll, id, entry) {
            warn!("error updating registration of selectable #{}: {:#}", id, e);
            if !entry.permanent {
                self.set_deadline(id, Some(now));
                return;
            }
        }
        self.reset_deadline(id, now);
    }

    fn reset_deadline(&mut self, id: SelectableId, now: Instant) {
        let Some(entry) = self.entries.get(&id) else { return };
        let deadline = entry.selectable.timeout()
            .map(|timeout| now + timeout);
        self.set_deadline(id, deadline);
    }

    fn set_deadline(&mut self, id: SelectableId, deadline: Option<Instant>) {
        let Some(entry) = self.entries.get_mut(&id) else { return };
        if let Some(old) = entry.deadline.take() {
            self.deadlines.remove(&(old, entry.seq, id));
        }
        if let Some(new) = deadline {
            self.deadlines.insert((new, entry.seq, id));
        }
        entry.deadline = deadline;
    }

    fn sync_registration(poll: &Poll, id: SelectableId, entry: &mut Entry) -> anyhow::Result<()> {
        let desired = match (entry.selectable.wants_read(), entry.selectable.wants_write()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if desired == entry.registered {
            return Ok(());
        }

        let registry = poll.registry();
        let source = entry.selectable.source();
        match (entry.registered, desired) {
            (None, Some(interest)) => registry.register(source, Token(id), interest)?,
            (Some(_), Some(interest)) => registry.reregister(source, Token(id), interest)?,
            (Some(_), None) => registry.deregister(source)?,
            (None, None) => {}
        }
        entry.registered = desired;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;
    use mio::net::UdpSocket;

    struct TestSelectable {
        socket: UdpSocket,
        name: &'static str,
        timeout: Option<Duration>,
        wants_read: bool,
        io_log: Arc<Mutex<Vec<(&'static str, bool, bool)>>>,
        num_timeouts: Arc<AtomicUsize>,
        spawn_on_io: bool,
    }

    impl TestSelectable {
        fn new(name: &'static str, timeout: Option<Duration>) -> TestSelectable {
            TestSelectable {
                socket: UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
                name,
                timeout,
                wants_read: false,
                io_log: Default::default(),
                num_timeouts: Default::default(),
                spawn_on_io: false,
            }
        }
    }

    impl Selectable for TestSelectable {
        fn source(&mut self) -> &mut dyn mio::event::Source {
            &mut self.socket
        }

        fn wants_read(&self) -> bool {
            self.wants_read
        }

        fn wants_write(&self) -> bool {
            false
        }

        fn handle_io(&mut self, readable: bool, writable: bool, spawned: &mut Vec<Box<dyn Selectable>>) {
            self.io_log.lock().unwrap().push((self.name, readable, writable));
            let mut buf = [0u8; 100];
            while self.socket.recv(&mut buf).is_ok() {}
            if self.spawn_on_io {
                self.spawn_on_io = false;
                spawned.push(Box::new(TestSelectable::new("child", None)));
            }
        }

        fn handle_timeout(&mut self) {
            self.num_timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn names(timed_out: &mut [(SelectableId, Box<dyn Selectable>)]) -> Vec<&'static str> {
        timed_out.iter_mut()
            .map(|(_, s)| s.as_any_mut().downcast_mut::<TestSelectable>().unwrap().name)
            .collect()
    }

    #[test]
    fn test_timeouts_in_deadline_and_insertion_order() {
        let mut multiplexer = Multiplexer::new().unwrap();
        multiplexer.add(Box::new(TestSelectable::new("late", Some(Duration::from_millis(40))))).unwrap();
        multiplexer.add(Box::new(TestSelectable::new("a", Some(Duration::ZERO)))).unwrap();
        multiplexer.add(Box::new(TestSelectable::new("b", Some(Duration::ZERO)))).unwrap();
        multiplexer.add(Box::new(TestSelectable::new("never", None))).unwrap();

        let mut timed_out = multiplexer.select().unwrap();
        assert_eq!(names(&mut timed_out), vec!["a", "b"]);
        assert_eq!(multiplexer.len(), 2);

        let start = Instant::now();
        let mut timed_out = Vec::new();
        while timed_out.is_empty() {
            timed_out = multiplexer.select().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(names(&mut timed_out), vec!["late"]);
        assert_eq!(multiplexer.len(), 1);
    }

    #[test]
    fn test_permanent_is_notified_not_removed() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let selectable = TestSelectable::new("permanent", Some(Duration::from_millis(5)));
        let num_timeouts = selectable.num_timeouts.clone();
        multiplexer.add_permanent(Box::new(selectable)).unwrap();

        for _ in 0..3 {
            assert!(multiplexer.select().unwrap().is_empty());
        }
        assert_eq!(multiplexer.len(), 1);
        assert!(num_timeouts.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_readiness_dispatch() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let mut selectable = TestSelectable::new("reader", Some(Duration::from_secs(5)));
        selectable.wants_read = true;
        selectable.spawn_on_io = true;
        let io_log = selectable.io_log.clone();
        let addr = selectable.socket.local_addr().unwrap();
        multiplexer.add(Box::new(selectable)).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"x", addr).unwrap();

        while io_log.lock().unwrap().is_empty() {
            assert!(multiplexer.select().unwrap().is_empty());
        }
        assert_eq!(io_log.lock().unwrap()[0], ("reader", true, false));
        assert_eq!(multiplexer.len(), 2);
    }

    #[test]
    fn test_update_dispatches_writable() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let selectable = TestSelectable::new("kicked", None);
        let io_log = selectable.io_log.clone();
        let id = multiplexer.add(Box::new(selectable)).unwrap();

        multiplexer.with_selectable::<TestSelectable, _>(id, |s| s.timeout = Some(Duration::from_secs(1))).unwrap();
        multiplexer.update(id);
        assert!(multiplexer.select().unwrap().is_empty());
        assert_eq!(io_log.lock().unwrap().as_slice(), &[("kicked", false, true)]);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let mut multiplexer = Multiplexer::new().unwrap();
        multiplexer.add(Box::new(TestSelectable::new("never", None))).unwrap();
        let handle = multiplexer.handle();

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.notify();
        });
        assert!(multiplexer.select().unwrap().is_empty());
        waker.join().unwrap();
    }

    #[test]
    fn test_force_timeout_skips_dispatch() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let selectable = TestSelectable::new("zero", Some(Duration::ZERO));
        let num_timeouts = selectable.num_timeouts.clone();
        multiplexer.add(Box::new(selectable)).unwrap();

        multiplexer.handle().force_timeout();
        assert!(multiplexer.select().unwrap().is_empty());
        assert_eq!(num_timeouts.load(Ordering::SeqCst), 0);

        assert_eq!(multiplexer.select().unwrap().len(), 1);
        assert_eq!(num_timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_skip_live_entries_on_wrap_around() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let first = multiplexer.add(Box::new(TestSelectable::new("first", None))).unwrap();
        assert_eq!(first, 0);

        multiplexer.next_id = WAKE_TOKEN.0 - 1;
        let last = multiplexer.add(Box::new(TestSelectable::new("last", None))).unwrap();
        assert_eq!(last, WAKE_TOKEN.0 - 1);

        let wrapped = multiplexer.add(Box::new(TestSelectable::new("wrapped", None))).unwrap();
        assert_eq!(wrapped, 1);
        assert_eq!(multiplexer.len(), 3);
        assert_eq!(multiplexer.with_selectable::<TestSelectable, _>(first, |s| s.name), Some("first"));
        assert_eq!(multiplexer.with_selectable::<TestSelectable, _>(wrapped, |s| s.name), Some("wrapped"));
    }

    #[test]
    fn test_remove_all_transient() {
        let mut multiplexer = Multiplexer::new().unwrap();
        let permanent = multiplexer.add_permanent(Box::new(TestSelectable::new("p", None))).unwrap();
        let transient = multiplexer.add(Box::new(TestSelectable::new("t1", None))).unwrap();
        multiplexer.add(Box::new(TestSelectable::new("t2", None))).unwrap();

        assert_eq!(multiplexer.remove_all_transient().len(), 2);
        assert!(multiplexer.contains(permanent));
        assert!(!multiplexer.contains(transient));
        assert!(multiplexer.remove(transient).is_none());
        assert!(multiplexer.remove(permanent).is_some());
        assert!(multiplexer.is_empty());
    }
}
