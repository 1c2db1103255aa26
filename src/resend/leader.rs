use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::addr::IpPort;
use crate::resend::pending::RequestKey;
use crate::transport::sink::PacketSink;

struct LeaderMapping {
    leader: IpPort,
    recorded_at: Instant,
}

struct Discovery {
    started_at: Instant,
    waiting: Vec<RequestKey>,
}

/// Known leaders of multicast groups, and leader discoveries that are waiting for a reply.
///
/// A mapping is trusted while the transport has a cached connection to the leader. A fresh
///  mapping is trusted for a grace period even without one, covering the time until the first
///  connection to the leader is established.
pub struct LeaderDirectory {
    grace: Duration,
    mappings: FxHashMap<IpPort, LeaderMapping>,
    discoveries: FxHashMap<IpPort, Discovery>,
}

impl LeaderDirectory {
    pub fn new(grace: Duration) -> LeaderDirectory {
        LeaderDirectory {
            grace,
            mappings: FxHashMap::default(),
            discoveries: FxHashMap::default(),
        }
    }

    pub fn record(&mut self, group: IpPort, leader: IpPort, now: Instant) {
        if !group.is_multicast() {
            trace!("not recording leader {} for unicast address {}", leader, group);
            return;
        }
        debug!("leader of {} is {}", group, leader);
        self.mappings.insert(group, LeaderMapping { leader, recorded_at: now });
    }

    /// The leader for `group` if it is still trusted. Stale mappings are dropped.
    pub fn leader_for(&mut self, group: IpPort, now: Instant, sink: &dyn PacketSink) -> Option<IpPort> {
        let mapping = self.mappings.get(&group)?;
        if sink.has_cached_connection(mapping.leader) || now.saturating_duration_since(mapping.recorded_at) < self.grace {
            return Some(mapping.leader);
        }

        debug!("no connection to leader {} of {} any more - forgetting it", mapping.leader, group);
        self.mappings.remove(&group);
        None
    }

    /// Registers `key` as waiting for the leader of `group`. Returns `true` if a new discovery
    ///  request should be sent, `false` if a discovery younger than `max_age` is in flight.
    pub fn join_discovery(&mut self, group: IpPort, key: RequestKey, now: Instant, max_age: Duration) -> bool {
        match self.discoveries.get_mut(&group) {
            Some(discovery) if now.saturating_duration_since(discovery.started_at) < max_age => {
                if !discovery.waiting.contains(&key) {
                    discovery.waiting.push(key);
                }
                false
            }
            Some(discovery) => {
                discovery.started_at = now;
                if !discovery.waiting.contains(&key) {
                    discovery.waiting.push(key);
                }
                true
            }
            None => {
                self.discoveries.insert(group, Discovery { started_at: now, waiting: vec![key] });
                true
            }
        }
    }

    /// Ends the discovery for `group`, returning the requests that waited for it
    pub fn finish_discovery(&mut self, group: IpPort) -> Vec<RequestKey> {
        self.discoveries.remove(&group)
            .map(|d| d.waiting)
            .unwrap_or_default()
    }

    /// Removes a request that is no longer pending from the discoveries it waits for. A discovery
    ///  that nobody waits for any more is dropped.
    pub fn forget_request(&mut self, key: RequestKey) {
        self.discoveries.retain(|group, discovery| {
            discovery.waiting.retain(|&k| k != key);
            if discovery.waiting.is_empty() {
                trace!("dropping leader discovery for {}: no requests wait for it", group);
                return false;
            }
            true
        });
    }

    pub fn is_discovering(&self, group: IpPort) -> bool {
        self.discoveries.contains_key(&group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sink::MockPacketSink;

    const GROUP: IpPort = IpPort::new(0xe101_0100, 8000);
    const LEADER: IpPort = IpPort::new(0x7f00_0001, 9000);

    fn sink(has_connection: bool) -> MockPacketSink {
        let mut sink = MockPacketSink::new();
        sink.expect_has_cached_connection()
            .return_const(has_connection);
        sink
    }

    #[test]
    fn test_mapping_within_grace() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        leaders.record(GROUP, LEADER, now);
        assert_eq!(leaders.leader_for(GROUP, now + Duration::from_secs(1), &sink(false)), Some(LEADER));
    }

    #[test]
    fn test_mapping_kept_by_cached_connection() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        leaders.record(GROUP, LEADER, now);
        assert_eq!(leaders.leader_for(GROUP, now + Duration::from_secs(60), &sink(true)), Some(LEADER));
    }

    #[test]
    fn test_stale_mapping_is_forgotten() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        leaders.record(GROUP, LEADER, now);
        assert_eq!(leaders.leader_for(GROUP, now + Duration::from_secs(6), &sink(false)), None);
        assert_eq!(leaders.leader_for(GROUP, now, &sink(true)), None);
    }

    #[test]
    fn test_unicast_is_not_recorded() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        leaders.record(LEADER, GROUP, now);
        assert_eq!(leaders.leader_for(LEADER, now, &sink(true)), None);
    }

    #[test]
    fn test_discovery() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        let max_age = Duration::from_millis(500);

        assert!(leaders.join_discovery(GROUP, (1, 1), now, max_age));
        assert!(!leaders.join_discovery(GROUP, (2, 1), now, max_age));
        assert!(!leaders.join_discovery(GROUP, (1, 1), now, max_age));
        assert!(leaders.is_discovering(GROUP));

        // an old discovery is repeated
        assert!(leaders.join_discovery(GROUP, (2, 1), now + max_age, max_age));

        assert_eq!(leaders.finish_discovery(GROUP), vec![(1, 1), (2, 1)]);
        assert!(!leaders.is_discovering(GROUP));
        assert!(leaders.finish_discovery(GROUP).is_empty());
    }

    #[test]
    fn test_forgotten_requests_end_discovery() {
        let mut leaders = LeaderDirectory::new(Duration::from_secs(5));
        let now = Instant::now();
        let max_age = Duration::from_millis(500);

        for packet_id in 0..1000 {
            leaders.join_discovery(GROUP, (1, packet_id), now, max_age);
        }
        for packet_id in 1..1000 {
            leaders.forget_request((1, packet_id));
        }
        leaders.forget_request((9, 9));
        assert!(leaders.is_discovering(GROUP));

        leaders.forget_request((1, 0));
        assert!(!leaders.is_discovering(GROUP));
        assert!(leaders.finish_discovery(GROUP).is_empty());

        // the next request starts a new discovery
        assert!(leaders.join_discovery(GROUP, (2, 1), now, max_age));
    }
}
