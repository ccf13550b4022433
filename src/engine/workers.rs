//! Sharded evaluation lanes
//!
//! Packets are partitioned by source MAC across N worker threads. Each
//! lane owns the MAC-keyed state for the MACs hashed to it, so per-MAC
//! windows see one serialized order of updates. IP-keyed state, gateways,
//! cooldowns and the rule handle are shared through the `EngineCore` and a
//! common `IpStateTable`.
//!
//! The IP-keyed part of every packet is applied on the submitting thread,
//! under one lock, before the packet is queued. Bindings and outstanding
//! requests therefore see submission order even when lanes run at
//! different speeds; the lane receives the resulting `Observation`.
//!
//! Packets from one MAC are evaluated in submission order. Packets from
//! different MACs may be evaluated concurrently.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::{DetectionSink, EngineCore, EngineState, EngineStats};
use crate::config::Config;
use crate::core::{DetectionEvent, MacAddr, Packet};
use crate::error::{ArpWardenError, Result};
use crate::rules::RuleSet;
use crate::state::{GatewayTracker, IpStateTable, Observation, WindowedStateStore};

/// Queue depth per lane
const LANE_QUEUE_DEPTH: usize = 1024;

enum LaneMessage {
    Packet {
        packet: Packet,
        /// IP-keyed facts; `None` for packets that failed validation
        shared: Option<Observation>,
        reply: Option<Sender<Vec<DetectionEvent>>>,
    },
    KeyCount(Sender<usize>),
}

struct Lane {
    tx: Sender<LaneMessage>,
    handle: JoinHandle<()>,
}

/// Multi-lane detection engine
pub struct ShardedEngine {
    core: EngineCore,
    lanes: Vec<Lane>,
    ip_table: Arc<IpStateTable>,
    /// Serializes IP-table updates and lane hand-off
    order: Mutex<()>,
    state: RwLock<EngineState>,
}

impl ShardedEngine {
    /// Spawn `workers` lanes (0 = one per CPU); call `start` before ingesting
    pub fn from_config(
        config: &Config,
        workers: usize,
        sink: Option<Arc<dyn DetectionSink>>,
    ) -> Result<Self> {
        let mut core = EngineCore::from_config(config)?;
        if let Some(sink) = sink {
            core.set_sink(sink);
        }

        let workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };

        let settings = config.store_settings();
        let ip_table = Arc::new(IpStateTable::new(
            settings.binding_history_len,
            settings.retention,
        ));

        let mut lanes = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = bounded(LANE_QUEUE_DEPTH);
            let store = WindowedStateStore::with_ip_table(settings.clone(), ip_table.clone());
            let lane_core = core.clone();
            let handle = std::thread::Builder::new()
                .name(format!("arpwarden-lane-{}", i))
                .spawn(move || run_lane(i, lane_core, store, rx))?;
            lanes.push(Lane { tx, handle });
        }

        info!("Started {} evaluation lanes", workers);
        Ok(Self {
            core,
            lanes,
            ip_table,
            order: Mutex::new(()),
            state: RwLock::new(EngineState::Stopped),
        })
    }

    pub fn start(&self) {
        let mut state = self.state.write();
        if *state != EngineState::Running {
            *state = EngineState::Running;
            info!(
                "Sharded engine started with rule set v{} on {} lanes",
                self.core.rules.version(),
                self.lanes.len()
            );
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane_index(&self, mac: &MacAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        mac.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Apply IP-keyed state in submission order and queue on the MAC's lane
    fn route(&self, packet: Packet, reply: Option<Sender<Vec<DetectionEvent>>>) -> Result<()> {
        let _order = self.order.lock();
        let shared = match packet.validate() {
            Ok(()) => Some(self.ip_table.observe(&packet)),
            Err(_) => None,
        };
        self.lanes[self.lane_index(&packet.src_mac)]
            .tx
            .send(LaneMessage::Packet {
                packet,
                shared,
                reply,
            })
            .map_err(|_| ArpWardenError::NotRunning)
    }

    /// Evaluate one packet and wait for its detections
    pub fn ingest(&self, packet: Packet) -> Result<Vec<DetectionEvent>> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let state = self.state.read();
            if *state != EngineState::Running {
                self.core.note_rejected();
                return Err(ArpWardenError::NotRunning);
            }
            self.route(packet, Some(reply_tx))?;
        }
        reply_rx.recv().map_err(|_| ArpWardenError::NotRunning)
    }

    /// Queue a packet; its detections only go to the sink
    pub fn submit(&self, packet: Packet) -> Result<()> {
        let state = self.state.read();
        if *state != EngineState::Running {
            self.core.note_rejected();
            return Err(ArpWardenError::NotRunning);
        }
        self.route(packet, None)
    }

    /// Reject new packets; queued packets are still evaluated
    pub fn stop(&self) {
        *self.state.write() = EngineState::Stopped;
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Drain every lane and join its thread
    pub fn shutdown(self) -> EngineStats {
        self.stop();
        for (i, lane) in self.lanes.into_iter().enumerate() {
            drop(lane.tx);
            if lane.handle.join().is_err() {
                error!("Evaluation lane {} panicked", i);
            }
        }
        info!("Evaluation lanes shut down");
        self.core.stats()
    }

    pub fn reload_rules(&self, rules: RuleSet) -> Result<u64> {
        self.core.reload_rules(rules)
    }

    pub fn reload_from_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<u64> {
        self.core.reload_from_file(path)
    }

    pub fn update_gateway(&self, ip: std::net::Ipv4Addr, mac: MacAddr, verified: bool) -> bool {
        self.core.gateways().update_gateway(ip, mac, verified)
    }

    pub fn gateways(&self) -> &Arc<GatewayTracker> {
        self.core.gateways()
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.core.rules()
    }

    pub fn stats(&self) -> EngineStats {
        self.core.stats()
    }

    pub fn recent_detections(&self) -> Vec<DetectionEvent> {
        self.core.recent_detections()
    }

    /// Keys held across all lanes, shared IP table counted once
    pub fn state_key_count(&self) -> usize {
        let mut total = self.ip_table.len();
        for lane in &self.lanes {
            let (tx, rx) = bounded(1);
            if lane.tx.send(LaneMessage::KeyCount(tx)).is_ok() {
                total += rx.recv().unwrap_or(0);
            }
        }
        total
    }
}

fn run_lane(
    index: usize,
    core: EngineCore,
    mut store: WindowedStateStore,
    rx: Receiver<LaneMessage>,
) {
    debug!("Lane {} started", index);
    for message in rx.iter() {
        match message {
            LaneMessage::Packet {
                packet,
                shared,
                reply,
            } => {
                let events = core.process_observed(&mut store, &packet, shared);
                core.dispatch(&events);
                if let Some(reply) = reply {
                    let _ = reply.send(events);
                }
            }
            LaneMessage::KeyCount(reply) => {
                let shared = store.ip_table().len();
                let _ = reply.send(store.key_count().saturating_sub(shared));
            }
        }
    }
    debug!("Lane {} drained", index);
}
