use std::collections::BTreeSet;
use std::time::Instant;
use anyhow::bail;
use rustc_hash::FxHashMap;
use crate::resend::container::RequestContainer;

pub type RequestKey = (u16, u16);

struct PendingEntry {
    container: RequestContainer,
    deadline: Instant,
    seq: u64,
}

/// The outstanding requests, accessible both by request key (for matching replies) and by
///  resend deadline (for the timeout thread). Requests with equal deadlines are ordered by the
///  time they were (re)scheduled.
#[derive(Default)]
pub struct PendingRequests {
    by_key: FxHashMap<RequestKey, PendingEntry>,
    by_deadline: BTreeSet<(Instant, u64, RequestKey)>,
    next_seq: u64,
}

impl PendingRequests {
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn insert(&mut self, container: RequestContainer) -> anyhow::Result<()> {
        let key = container.request_key();
        if self.by_key.contains_key(&key) {
            bail!("a request with request id {} and packet id {} is already pending", key.0, key.1);
        }

        let deadline = container.deadline();
        let seq = self.take_seq();
        self.by_deadline.insert((deadline, seq, key));
        self.by_key.insert(key, PendingEntry { container, deadline, seq });
        Ok(())
    }

    pub fn remove(&mut self, key: RequestKey) -> Option<RequestContainer> {
        let entry = self.by_key.remove(&key)?;
        self.by_deadline.remove(&(entry.deadline, entry.seq, key));
        Some(entry.container)
    }

    pub fn get(&self, key: RequestKey) -> Option<&RequestContainer> {
        self.by_key.get(&key)
            .map(|e| &e.container)
    }

    /// Changes to the container's deadline take effect with the next [PendingRequests::reschedule]
    pub fn get_mut(&mut self, key: RequestKey) -> Option<&mut RequestContainer> {
        self.by_key.get_mut(&key)
            .map(|e| &mut e.container)
    }

    /// Re-sorts a request after its deadline changed, placing it after all requests with the
    ///  same deadline
    pub fn reschedule(&mut self, key: RequestKey) {
        let seq = self.take_seq();
        let Some(entry) = self.by_key.get_mut(&key) else { return };

        self.by_deadline.remove(&(entry.deadline, entry.seq, key));
        entry.deadline = entry.container.deadline();
        entry.seq = seq;
        self.by_deadline.insert((entry.deadline, entry.seq, key));
    }

    /// the request that is due first
    pub fn first(&self) -> Option<(Instant, RequestKey)> {
        self.by_deadline.first()
            .map(|&(deadline, _, key)| (deadline, key))
    }

    fn take_seq(&mut self) -> u64 {
        let result = self.next_seq;
        self.next_seq += 1;
        result
    }
}
