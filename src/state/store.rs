//! Windowed state store
//!
//! Per-key sliding windows and host history used by the stateful rules.
//!
//! State keyed by source MAC (rate counters, MAC→IP claims, request trails)
//! lives directly in the store and is owned by one evaluation lane. State
//! keyed by IP (IP→MAC bindings, outstanding requests) can be reached from
//! packets of many different senders, so it lives in an `IpStateTable`
//! that several lanes may share.
//!
//! Eviction is lazy: each record trims entries older than the retention
//! horizon of its key. `sweep` additionally drops keys that have been idle
//! for longer than the idle horizon.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{scaled, window_start};
use crate::core::{ArpOp, MacAddr, Packet};

/// Upper bound on distinct responders kept per outstanding request
const MAX_REPLIES_PER_REQUEST: usize = 32;

// ============================================================================
// Keys and settings
// ============================================================================

/// Counter namespace and key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// ARP requests sent by a MAC
    Requests(MacAddr),
    /// ARP replies sent by a MAC
    Replies(MacAddr),
    /// Gratuitous replies sent by a MAC
    Gratuitous(MacAddr),
}

impl CounterKey {
    pub fn mac(&self) -> MacAddr {
        match self {
            CounterKey::Requests(mac) | CounterKey::Replies(mac) | CounterKey::Gratuitous(mac) => {
                *mac
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// How far back per-key history is retained
    pub retention: Duration,
    /// Keys idle for `retention * idle_factor` are garbage-collected
    pub idle_factor: u32,
    /// Per-key entry cap; oldest entries are evicted beyond it
    pub max_entries_per_key: usize,
    /// Prior MACs remembered per IP
    pub binding_history_len: usize,
}

impl StoreSettings {
    pub fn idle_horizon(&self) -> Duration {
        scaled(self.retention, self.idle_factor.max(1))
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retention: Duration::seconds(60),
            idle_factor: 10,
            max_entries_per_key: 4096,
            binding_history_len: 16,
        }
    }
}

// ============================================================================
// Window counter
// ============================================================================

/// Sliding window of event timestamps for one key
#[derive(Debug, Clone, Default)]
pub struct WindowCounter {
    events: VecDeque<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl WindowCounter {
    /// Append an observation and evict what fell out of `retention`
    pub fn record(&mut self, timestamp: DateTime<Utc>, retention: Duration, cap: usize) {
        let in_order = self.latest.map_or(true, |latest| timestamp >= latest);
        let latest = if in_order { timestamp } else { self.latest.unwrap_or(timestamp) };
        self.latest = Some(latest);
        self.events.push_back(timestamp);

        let cutoff = window_start(latest, retention);
        if in_order {
            while matches!(self.events.front(), Some(t) if *t < cutoff) {
                self.events.pop_front();
            }
        } else {
            self.events.retain(|t| *t >= cutoff);
        }

        while self.events.len() > cap.max(1) {
            self.events.pop_front();
        }
    }

    /// Observations within `window` of the latest one
    pub fn count(&self, window: Duration) -> usize {
        let Some(latest) = self.latest else {
            return 0;
        };
        let cutoff = window_start(latest, window);
        self.events.iter().filter(|t| **t >= cutoff).count()
    }

    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Oldest retained timestamp
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.events.iter().min().copied()
    }
}

// ============================================================================
// IP-keyed state (shareable)
// ============================================================================

/// MAC-IP binding with history
#[derive(Debug, Clone)]
pub struct HostBinding {
    pub mac: MacAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub change_count: u32,
    /// Prior MACs and when each was last seen, oldest first
    pub history: VecDeque<(MacAddr, DateTime<Utc>)>,
}

impl HostBinding {
    fn new(mac: MacAddr, timestamp: DateTime<Utc>) -> Self {
        Self {
            mac,
            first_seen: timestamp,
            last_seen: timestamp,
            change_count: 0,
            history: VecDeque::new(),
        }
    }
}

/// A MAC flip observed for an IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingChange {
    pub ip: Ipv4Addr,
    pub previous: MacAddr,
    pub current: MacAddr,
    pub change_count: u32,
}

/// An ARP request waiting for replies
#[derive(Debug, Clone)]
struct PendingRequest {
    requested_at: DateTime<Utc>,
    requester: MacAddr,
    /// Distinct responders with their first reply time
    replies: Vec<(MacAddr, DateTime<Utc>)>,
    last_activity: DateTime<Utc>,
}

/// Responders to one request, as seen when a reply was recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRace {
    pub requested_at: DateTime<Utc>,
    pub responders: Vec<(MacAddr, DateTime<Utc>)>,
}

impl ReplyRace {
    /// Distinct responders that answered within `window` of the request
    pub fn within(&self, window: Duration) -> usize {
        count_responders(self.requested_at, &self.responders, window)
    }
}

fn count_responders(
    requested_at: DateTime<Utc>,
    responders: &[(MacAddr, DateTime<Utc>)],
    window: Duration,
) -> usize {
    responders
        .iter()
        .filter(|(_, at)| *at >= requested_at && *at - requested_at <= window)
        .count()
}

/// IP-keyed state with per-key locking
#[derive(Debug)]
pub struct IpStateTable {
    bindings: DashMap<Ipv4Addr, HostBinding>,
    pending: DashMap<Ipv4Addr, PendingRequest>,
    history_len: usize,
    history_horizon: Duration,
}

impl IpStateTable {
    pub fn new(history_len: usize, history_horizon: Duration) -> Self {
        Self {
            bindings: DashMap::new(),
            pending: DashMap::new(),
            history_len,
            history_horizon,
        }
    }

    /// Record IP→MAC; returns the change if the MAC differs from the last one
    pub fn observe_binding(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        timestamp: DateTime<Utc>,
    ) -> Option<BindingChange> {
        match self.bindings.entry(ip) {
            Entry::Vacant(slot) => {
                slot.insert(HostBinding::new(mac, timestamp));
                None
            }
            Entry::Occupied(mut slot) => {
                let binding = slot.get_mut();
                if binding.mac == mac {
                    if timestamp > binding.last_seen {
                        binding.last_seen = timestamp;
                    }
                    return None;
                }

                let previous = binding.mac;
                binding.history.push_back((previous, binding.last_seen));
                let cutoff = window_start(timestamp, self.history_horizon);
                while matches!(binding.history.front(), Some((_, seen)) if *seen < cutoff) {
                    binding.history.pop_front();
                }
                while binding.history.len() > self.history_len.max(1) {
                    binding.history.pop_front();
                }

                binding.mac = mac;
                binding.last_seen = timestamp;
                binding.change_count = binding.change_count.saturating_add(1);

                Some(BindingChange {
                    ip,
                    previous,
                    current: mac,
                    change_count: binding.change_count,
                })
            }
        }
    }

    pub fn binding(&self, ip: &Ipv4Addr) -> Option<HostBinding> {
        self.bindings.get(ip).map(|b| b.value().clone())
    }

    /// A new request for `target` opens a fresh transaction
    pub fn record_request(&self, target: Ipv4Addr, requester: MacAddr, timestamp: DateTime<Utc>) {
        self.pending.insert(
            target,
            PendingRequest {
                requested_at: timestamp,
                requester,
                replies: Vec::new(),
                last_activity: timestamp,
            },
        );
    }

    /// Attach a reply from `responder` to the outstanding request for `ip`
    ///
    /// Returns the responders as of this reply, or `None` if no request for
    /// `ip` is outstanding.
    pub fn record_reply(
        &self,
        ip: Ipv4Addr,
        responder: MacAddr,
        timestamp: DateTime<Utc>,
    ) -> Option<ReplyRace> {
        let mut pending = self.pending.get_mut(&ip)?;
        if pending.requester == responder {
            return None;
        }
        if !pending.replies.iter().any(|(mac, _)| *mac == responder)
            && pending.replies.len() < MAX_REPLIES_PER_REQUEST
        {
            pending.replies.push((responder, timestamp));
        }
        if timestamp > pending.last_activity {
            pending.last_activity = timestamp;
        }
        Some(ReplyRace {
            requested_at: pending.requested_at,
            responders: pending.replies.clone(),
        })
    }

    /// Distinct responders that answered the request for `ip` within `window`
    pub fn distinct_replies(&self, ip: &Ipv4Addr, window: Duration) -> usize {
        self.pending
            .get(ip)
            .map(|p| count_responders(p.requested_at, &p.replies, window))
            .unwrap_or(0)
    }

    /// Apply the IP-keyed part of one packet
    ///
    /// Callers that share this table across lanes must call this in packet
    /// arrival order; the returned facts are then handed to the lane.
    pub fn observe(&self, packet: &Packet) -> Observation {
        let mut observation = Observation::default();
        let ts = packet.timestamp;

        match packet.operation {
            ArpOp::Request => self.record_request(packet.dst_ip, packet.src_mac, ts),
            ArpOp::Reply if !packet.src_ip.is_unspecified() => {
                observation.binding_change = self.observe_binding(packet.src_ip, packet.src_mac, ts);
                observation.reply_race = self.record_reply(packet.src_ip, packet.src_mac, ts);
            }
            _ => {}
        }

        observation
    }

    /// Drop bindings and requests with no activity since `cutoff`
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.len();
        self.bindings.retain(|_, b| b.last_seen >= cutoff);
        self.pending.retain(|_, p| p.last_activity >= cutoff);
        before.saturating_sub(self.len())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// MAC-keyed state
// ============================================================================

/// IPs claimed by one MAC
#[derive(Debug, Clone, Default)]
struct MacClaims {
    ips: HashMap<Ipv4Addr, DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

/// Recent request targets from one MAC, in arrival order
#[derive(Debug, Clone, Default)]
struct ScanTrail {
    targets: VecDeque<(Ipv4Addr, DateTime<Utc>)>,
    latest: Option<DateTime<Utc>>,
}

/// Facts derived while updating state for one packet
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Set when a reply moved its sender IP to a different MAC
    pub binding_change: Option<BindingChange>,
    /// Set when a reply answered an outstanding request
    pub reply_race: Option<ReplyRace>,
}

impl Observation {
    pub fn answered_request(&self) -> bool {
        self.reply_race.is_some()
    }

    /// Distinct responders to the answered request within `window`
    pub fn responders_within(&self, window: Duration) -> usize {
        self.reply_race.as_ref().map_or(0, |race| race.within(window))
    }
}

/// Sliding-window counters and host history for one evaluation lane
#[derive(Debug)]
pub struct WindowedStateStore {
    settings: StoreSettings,
    counters: HashMap<CounterKey, WindowCounter>,
    claims: HashMap<MacAddr, MacClaims>,
    trails: HashMap<MacAddr, ScanTrail>,
    ip_table: Arc<IpStateTable>,
    last_sweep: Option<DateTime<Utc>>,
}

impl WindowedStateStore {
    /// Store with its own private IP table
    pub fn new(settings: StoreSettings) -> Self {
        let table = Arc::new(IpStateTable::new(
            settings.binding_history_len,
            settings.retention,
        ));
        Self::with_ip_table(settings, table)
    }

    /// Store sharing `ip_table` with other lanes
    pub fn with_ip_table(settings: StoreSettings, ip_table: Arc<IpStateTable>) -> Self {
        Self {
            settings,
            counters: HashMap::new(),
            claims: HashMap::new(),
            trails: HashMap::new(),
            ip_table,
            last_sweep: None,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn ip_table(&self) -> &Arc<IpStateTable> {
        &self.ip_table
    }

    /// Widen retention so a window of `window` can always be counted
    pub fn ensure_retention(&mut self, window: Duration) {
        if window > self.settings.retention {
            debug!(
                "Raising state retention from {}s to {}s",
                self.settings.retention.num_seconds(),
                window.num_seconds()
            );
            self.settings.retention = window;
        }
    }

    /// Append an observation for `key`
    pub fn record_event(&mut self, key: CounterKey, timestamp: DateTime<Utc>) {
        let retention = self.settings.retention;
        let cap = self.settings.max_entries_per_key;
        self.counters
            .entry(key)
            .or_default()
            .record(timestamp, retention, cap);
    }

    /// Observations for `key` within the trailing `window`
    pub fn count_in_window(&self, key: &CounterKey, window: Duration) -> usize {
        self.counters.get(key).map(|c| c.count(window)).unwrap_or(0)
    }

    /// Record IP→MAC; true if the MAC differs from the last recorded one
    pub fn record_binding(&self, ip: Ipv4Addr, mac: MacAddr, timestamp: DateTime<Utc>) -> bool {
        self.ip_table.observe_binding(ip, mac, timestamp).is_some()
    }

    pub fn binding(&self, ip: &Ipv4Addr) -> Option<HostBinding> {
        self.ip_table.binding(ip)
    }

    /// Update all state for one packet
    pub fn observe(&mut self, packet: &Packet) -> Observation {
        self.observe_local(packet);
        self.ip_table.observe(packet)
    }

    /// Update only the MAC-keyed state this lane owns
    ///
    /// Used when the IP-keyed part was already applied by
    /// `IpStateTable::observe`.
    pub fn observe_local(&mut self, packet: &Packet) {
        let ts = packet.timestamp;

        match packet.operation {
            ArpOp::Request => {
                self.record_event(CounterKey::Requests(packet.src_mac), ts);
                self.record_target(packet.src_mac, packet.dst_ip, ts);
            }
            ArpOp::Reply => {
                self.record_event(CounterKey::Replies(packet.src_mac), ts);
                if packet.is_gratuitous() {
                    self.record_event(CounterKey::Gratuitous(packet.src_mac), ts);
                }
                if !packet.src_ip.is_unspecified() {
                    self.record_claim(packet.src_mac, packet.src_ip, ts);
                }
            }
            ArpOp::Other(_) => {}
        }
    }

    fn record_claim(&mut self, mac: MacAddr, ip: Ipv4Addr, timestamp: DateTime<Utc>) {
        let retention = self.settings.retention;
        let cap = self.settings.max_entries_per_key;
        let claims = self.claims.entry(mac).or_default();

        let latest = claims.latest.map_or(timestamp, |l| l.max(timestamp));
        claims.latest = Some(latest);
        let seen = claims.ips.entry(ip).or_insert(timestamp);
        if timestamp > *seen {
            *seen = timestamp;
        }

        let cutoff = window_start(latest, retention);
        claims.ips.retain(|_, seen| *seen >= cutoff);
        if claims.ips.len() > cap.max(1) {
            let mut by_age: Vec<(Ipv4Addr, DateTime<Utc>)> =
                claims.ips.iter().map(|(ip, seen)| (*ip, *seen)).collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let excess = by_age.len() - cap.max(1);
            for (ip, _) in by_age.into_iter().take(excess) {
                claims.ips.remove(&ip);
            }
        }
    }

    fn record_target(&mut self, mac: MacAddr, target: Ipv4Addr, timestamp: DateTime<Utc>) {
        let retention = self.settings.retention;
        let cap = self.settings.max_entries_per_key;
        let trail = self.trails.entry(mac).or_default();

        let latest = trail.latest.map_or(timestamp, |l| l.max(timestamp));
        trail.latest = Some(latest);
        trail.targets.push_back((target, timestamp));

        let cutoff = window_start(latest, retention);
        trail.targets.retain(|(_, at)| *at >= cutoff);
        while trail.targets.len() > cap.max(1) {
            trail.targets.pop_front();
        }
    }

    /// Distinct IPs `mac` claimed within `horizon` of its latest claim
    pub fn distinct_ips_for_mac(&self, mac: &MacAddr, horizon: Duration) -> usize {
        self.claimed_ips(mac, horizon).len()
    }

    /// Sorted IPs `mac` claimed within `horizon` of its latest claim
    pub fn claimed_ips(&self, mac: &MacAddr, horizon: Duration) -> Vec<Ipv4Addr> {
        let Some(claims) = self.claims.get(mac) else {
            return Vec::new();
        };
        let Some(latest) = claims.latest else {
            return Vec::new();
        };
        let cutoff = window_start(latest, horizon);
        let mut ips: Vec<Ipv4Addr> = claims
            .ips
            .iter()
            .filter(|(_, seen)| **seen >= cutoff)
            .map(|(ip, _)| *ip)
            .collect();
        ips.sort();
        ips
    }

    /// Distinct MACs that answered the outstanding request for `ip`
    pub fn outstanding_replies(&self, ip: &Ipv4Addr, window: Duration) -> usize {
        self.ip_table.distinct_replies(ip, window)
    }

    /// Request targets from `mac` within `window` of its latest request
    pub fn request_trail(&self, mac: &MacAddr, window: Duration) -> Vec<Ipv4Addr> {
        let Some(trail) = self.trails.get(mac) else {
            return Vec::new();
        };
        let Some(latest) = trail.latest else {
            return Vec::new();
        };
        let cutoff = window_start(latest, window);
        trail
            .targets
            .iter()
            .filter(|(_, at)| *at >= cutoff)
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// Sweep if at least one retention period passed since the last sweep
    pub fn maybe_sweep(&mut self, now: DateTime<Utc>) -> Option<usize> {
        match self.last_sweep {
            None => {
                self.last_sweep = Some(now);
                None
            }
            Some(last) if now - last >= self.settings.retention => Some(self.sweep(now)),
            Some(_) => None,
        }
    }

    /// Remove keys idle longer than the idle horizon
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        self.last_sweep = Some(now);
        let cutoff = window_start(now, self.settings.idle_horizon());
        let before = self.counters.len() + self.claims.len() + self.trails.len();

        self.counters
            .retain(|_, c| c.latest().map_or(false, |latest| latest >= cutoff));
        self.claims
            .retain(|_, c| c.latest.map_or(false, |latest| latest >= cutoff));
        self.trails
            .retain(|_, t| t.latest.map_or(false, |latest| latest >= cutoff));

        let after = self.counters.len() + self.claims.len() + self.trails.len();
        let removed = before.saturating_sub(after) + self.ip_table.sweep(cutoff);
        if removed > 0 {
            debug!("Swept {} idle state keys", removed);
        }
        removed
    }

    pub fn contains_key(&self, key: &CounterKey) -> bool {
        self.counters.contains_key(key)
    }

    /// Reachable keys across all state, shared IP table included
    pub fn key_count(&self) -> usize {
        self.counters.len() + self.claims.len() + self.trails.len() + self.ip_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0x02, 0, 0, 0, 0, last)
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn test_window_count_excludes_old_events() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        let key = CounterKey::Requests(mac(1));

        for i in 0..20 {
            store.record_event(key, t(i as f64));
        }

        // Latest is t=19; a 5s window covers 14..=19
        assert_eq!(store.count_in_window(&key, Duration::seconds(5)), 6);
        assert_eq!(store.count_in_window(&key, Duration::seconds(60)), 20);
        assert_eq!(store.count_in_window(&CounterKey::Replies(mac(1)), Duration::seconds(5)), 0);
    }

    #[test]
    fn test_window_counter_evicts_beyond_retention() {
        let mut counter = WindowCounter::default();
        for i in 0..100 {
            counter.record(t(i as f64), Duration::seconds(10), 1000);
        }
        assert!(counter.len() <= 11);
        let oldest = counter.oldest().unwrap();
        assert!(counter.latest().unwrap() - oldest <= Duration::seconds(10));
    }

    #[test]
    fn test_window_counter_caps_entries() {
        let mut counter = WindowCounter::default();
        for _ in 0..50 {
            counter.record(t(0.0), Duration::seconds(10), 8);
        }
        assert_eq!(counter.len(), 8);
    }

    #[test]
    fn test_window_counter_out_of_order() {
        let mut counter = WindowCounter::default();
        counter.record(t(30.0), Duration::seconds(10), 100);
        counter.record(t(5.0), Duration::seconds(10), 100);
        counter.record(t(29.0), Duration::seconds(10), 100);

        assert_eq!(counter.latest(), Some(t(30.0)));
        assert_eq!(counter.len(), 2);
        assert_eq!(counter.count(Duration::seconds(10)), 2);
    }

    #[test]
    fn test_record_binding_reports_change() {
        let store = WindowedStateStore::new(StoreSettings::default());

        assert!(!store.record_binding(ip(5), mac(0xa), t(0.0)));
        assert!(!store.record_binding(ip(5), mac(0xa), t(1.0)));
        assert!(store.record_binding(ip(5), mac(0xb), t(2.0)));

        let binding = store.binding(&ip(5)).unwrap();
        assert_eq!(binding.mac, mac(0xb));
        assert_eq!(binding.change_count, 1);
        assert_eq!(binding.history.front().map(|(m, _)| *m), Some(mac(0xa)));
    }

    #[test]
    fn test_binding_history_bounded() {
        let settings = StoreSettings {
            binding_history_len: 3,
            ..StoreSettings::default()
        };
        let store = WindowedStateStore::new(settings);

        for i in 0..10u8 {
            store.record_binding(ip(9), mac(i), t(i as f64));
        }

        let binding = store.binding(&ip(9)).unwrap();
        assert_eq!(binding.history.len(), 3);
        assert_eq!(binding.change_count, 9);
    }

    #[test]
    fn test_observe_reply_tracks_claims() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        let attacker = mac(0x66);

        for last in 1..=3 {
            let packet = Packet::reply(t(last as f64), attacker, ip(last), mac(0x10), ip(100));
            store.observe(&packet);
        }

        assert_eq!(store.distinct_ips_for_mac(&attacker, Duration::seconds(60)), 3);
        assert_eq!(store.distinct_ips_for_mac(&attacker, Duration::seconds(1)), 2);
        assert_eq!(store.claimed_ips(&attacker, Duration::seconds(60)), vec![ip(1), ip(2), ip(3)]);
    }

    #[test]
    fn test_probe_does_not_bind_unspecified() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        let packet = Packet::reply(t(0.0), mac(1), Ipv4Addr::UNSPECIFIED, mac(2), ip(2));
        let observation = store.observe(&packet);

        assert!(observation.binding_change.is_none());
        assert!(store.binding(&Ipv4Addr::UNSPECIFIED).is_none());
    }

    #[test]
    fn test_outstanding_replies_correlate_with_request() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        let victim = mac(1);

        store.observe(&Packet::request(t(0.0), victim, ip(1), ip(254)));
        let first = store.observe(&Packet::reply(t(0.1), mac(0xaa), ip(254), victim, ip(1)));
        assert!(first.answered_request());
        let second = store.observe(&Packet::reply(t(0.2), mac(0xbb), ip(254), victim, ip(1)));
        assert_eq!(second.responders_within(Duration::seconds(2)), 2);
        assert_eq!(second.responders_within(Duration::milliseconds(150)), 1);
        // Same responder again does not add a second reply
        store.observe(&Packet::reply(t(0.3), mac(0xbb), ip(254), victim, ip(1)));

        assert_eq!(store.outstanding_replies(&ip(254), Duration::seconds(2)), 2);

        // A fresh request starts a new transaction
        store.observe(&Packet::request(t(5.0), victim, ip(1), ip(254)));
        assert_eq!(store.outstanding_replies(&ip(254), Duration::seconds(2)), 0);
    }

    #[test]
    fn test_shared_table_applied_before_lane() {
        let table = Arc::new(IpStateTable::new(16, Duration::seconds(60)));
        let mut legit_lane = WindowedStateStore::with_ip_table(StoreSettings::default(), table.clone());
        let mut attacker_lane = WindowedStateStore::with_ip_table(StoreSettings::default(), table.clone());
        let legit = Packet::reply(t(2.0), mac(0xa), ip(5), mac(1), ip(1));
        let spoof = Packet::reply(t(3.0), mac(0xb), ip(5), mac(1), ip(1));

        // IP-keyed state follows arrival order even if the lanes run late
        let legit_facts = table.observe(&legit);
        let spoof_facts = table.observe(&spoof);
        attacker_lane.observe_local(&spoof);
        legit_lane.observe_local(&legit);

        assert!(legit_facts.binding_change.is_none());
        let change = spoof_facts.binding_change.unwrap();
        assert_eq!(change.previous, mac(0xa));
        assert_eq!(change.current, mac(0xb));
        assert_eq!(attacker_lane.claimed_ips(&mac(0xb), Duration::seconds(60)), vec![ip(5)]);
        assert!(legit_lane.contains_key(&CounterKey::Replies(mac(0xa))));
        assert!(!legit_lane.contains_key(&CounterKey::Replies(mac(0xb))));
    }

    #[test]
    fn test_request_trail_window() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        let scanner = mac(0x5c);

        for last in 1..=20u8 {
            store.observe(&Packet::request(t(last as f64), scanner, ip(200), ip(last)));
        }

        let trail = store.request_trail(&scanner, Duration::seconds(4));
        assert_eq!(trail, vec![ip(16), ip(17), ip(18), ip(19), ip(20)]);
    }

    #[test]
    fn test_sweep_removes_idle_keys() {
        let settings = StoreSettings {
            retention: Duration::seconds(10),
            idle_factor: 10,
            ..StoreSettings::default()
        };
        let mut store = WindowedStateStore::new(settings);
        let quiet = mac(1);
        let busy = mac(2);

        store.observe(&Packet::reply(t(0.0), quiet, ip(1), mac(9), ip(9)));
        store.observe(&Packet::reply(t(150.0), busy, ip(2), mac(9), ip(9)));
        assert!(store.contains_key(&CounterKey::Replies(quiet)));
        let before = store.key_count();

        // Idle horizon is 100s; the quiet MAC's last event is 150s old
        let removed = store.sweep(t(150.0));
        assert!(removed > 0);
        assert!(!store.contains_key(&CounterKey::Replies(quiet)));
        assert!(store.contains_key(&CounterKey::Replies(busy)));
        assert!(store.binding(&ip(1)).is_none());
        assert!(store.key_count() < before);
    }

    #[test]
    fn test_maybe_sweep_cadence() {
        let settings = StoreSettings {
            retention: Duration::seconds(10),
            ..StoreSettings::default()
        };
        let mut store = WindowedStateStore::new(settings);

        assert_eq!(store.maybe_sweep(t(0.0)), None);
        assert_eq!(store.maybe_sweep(t(5.0)), None);
        assert!(store.maybe_sweep(t(10.0)).is_some());
    }

    #[test]
    fn test_ensure_retention_only_grows() {
        let mut store = WindowedStateStore::new(StoreSettings::default());
        store.ensure_retention(Duration::seconds(5));
        assert_eq!(store.settings().retention, Duration::seconds(60));
        store.ensure_retention(Duration::seconds(120));
        assert_eq!(store.settings().retention, Duration::seconds(120));
    }

    #[test]
    fn test_shared_ip_table_between_stores() {
        let table = Arc::new(IpStateTable::new(16, Duration::seconds(60)));
        let lane_a = WindowedStateStore::with_ip_table(StoreSettings::default(), table.clone());
        let lane_b = WindowedStateStore::with_ip_table(StoreSettings::default(), table.clone());

        assert!(!lane_a.record_binding(ip(5), mac(0xa), t(0.0)));
        assert!(lane_b.record_binding(ip(5), mac(0xb), t(1.0)));
        assert_eq!(table.binding_count(), 1);
    }
}
