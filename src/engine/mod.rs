//! Detection engine
//!
//! Runs every packet through the same steps:
//!
//! ```text
//! packet ─▶ validate ─▶ update state ─▶ evaluate rules (id order) ─▶ cooldown ─▶ events
//!              │                              │                                   │
//!          malformed                    panics caught                      sink + recent
//!          (dropped)                     per rule
//! ```
//!
//! `EngineCore` holds what every evaluation lane shares: the rule handle,
//! the gateway tracker, the cooldown manager, counters and the sink.
//! `DetectionEngine` pairs one core with one state store behind a mutex;
//! `ShardedEngine` (see `workers`) gives each lane its own store.

pub mod output;
pub mod workers;

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{DetectionEvent, MacAddr, Packet};
use crate::error::{ArpWardenError, Result};
use crate::rules::{CooldownManager, EvalContext, Rule, RuleHandle, RuleSet};
use crate::state::{secs, GatewayTracker, Observation, WindowedStateStore};

pub use output::{DetectionSink, FanoutSink, LogSink, OutputHandler};
pub use workers::ShardedEngine;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Stopped,
    Running,
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub packets_ingested: u64,
    pub malformed_dropped: u64,
    pub rules_evaluated: u64,
    pub predicate_failures: u64,
    pub detections_emitted: u64,
    pub detections_suppressed: u64,
    pub rejected_while_stopped: u64,
    pub ruleset_version: u64,
    pub reloads: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    packets_ingested: AtomicU64,
    malformed_dropped: AtomicU64,
    rules_evaluated: AtomicU64,
    predicate_failures: AtomicU64,
    detections_emitted: AtomicU64,
    detections_suppressed: AtomicU64,
    rejected_while_stopped: AtomicU64,
    reloads: AtomicU64,
}

impl EngineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by all evaluation lanes of one engine
#[derive(Clone)]
pub struct EngineCore {
    rules: Arc<RuleHandle>,
    gateways: Arc<GatewayTracker>,
    cooldowns: Arc<CooldownManager>,
    counters: Arc<EngineCounters>,
    recent: Arc<Mutex<VecDeque<DetectionEvent>>>,
    sink: Option<Arc<dyn DetectionSink>>,
    history_window: Duration,
    max_detections: usize,
}

impl EngineCore {
    /// Build from a validated config; fails if no rule is enabled
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let rules = config.build_rules()?;
        Ok(Self {
            rules: Arc::new(RuleHandle::new(rules)),
            gateways: Arc::new(config.gateway_tracker()),
            cooldowns: Arc::new(CooldownManager::new(
                config.settings.cooldown_retention_factor,
            )),
            counters: Arc::new(EngineCounters::default()),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            sink: None,
            history_window: secs(config.settings.history_window),
            max_detections: config.settings.max_detections.max(1),
        })
    }

    pub fn set_sink(&mut self, sink: Arc<dyn DetectionSink>) {
        self.sink = Some(sink);
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.current()
    }

    pub fn gateways(&self) -> &Arc<GatewayTracker> {
        &self.gateways
    }

    pub fn cooldowns(&self) -> &Arc<CooldownManager> {
        &self.cooldowns
    }

    /// Validate, update state and evaluate rules for one packet
    ///
    /// The rule set snapshot is taken once, so every rule applied to this
    /// packet comes from the same version.
    pub fn process(&self, store: &mut WindowedStateStore, packet: &Packet) -> Vec<DetectionEvent> {
        self.process_observed(store, packet, None)
    }

    /// As `process`, with the IP-keyed facts already applied when `shared`
    /// is set
    fn process_observed(
        &self,
        store: &mut WindowedStateStore,
        packet: &Packet,
        shared: Option<Observation>,
    ) -> Vec<DetectionEvent> {
        if let Err(e) = packet.validate() {
            EngineCounters::bump(&self.counters.malformed_dropped);
            debug!("Dropping packet from {}: {}", packet.src_mac, e);
            return Vec::new();
        }
        EngineCounters::bump(&self.counters.packets_ingested);

        let rules = self.rules.current();
        store.ensure_retention(rules.largest_window().max(self.history_window));
        if store.maybe_sweep(packet.timestamp).is_some() {
            self.cooldowns.sweep(packet.timestamp);
        }

        let observation = match shared {
            Some(observation) => {
                store.observe_local(packet);
                observation
            }
            None => store.observe(packet),
        };
        let gateways = self.gateways.snapshot();
        let ctx = EvalContext {
            packet,
            store: &*store,
            gateways: &gateways,
            observation: &observation,
            history_window: self.history_window,
        };

        let mut events = Vec::new();
        for rule in rules.enabled() {
            EngineCounters::bump(&self.counters.rules_evaluated);

            let Some((confidence, detail)) = self.evaluate_rule(rule, &ctx) else {
                continue;
            };

            let source = rule.condition.source(packet);
            if !self
                .cooldowns
                .try_fire(&rule.id, &source, packet.timestamp, rule.cooldown)
            {
                EngineCounters::bump(&self.counters.detections_suppressed);
                continue;
            }

            events.push(
                DetectionEvent::new(rule.id.clone(), rule.severity, source, detail)
                    .with_timestamp(packet.timestamp)
                    .with_confidence(confidence)
                    .with_tags(rule.tags.iter().cloned())
                    .with_ruleset_version(rules.version()),
            );
        }

        self.counters
            .detections_emitted
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        events
    }

    /// Confidence and description if the rule matched; panics count as no match
    fn evaluate_rule(&self, rule: &Rule, ctx: &EvalContext<'_>) -> Option<(f32, String)> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let confidence = rule.condition.evaluate(ctx);
            if rule.matches(confidence) {
                Some((confidence, rule.condition.detail(ctx)))
            } else {
                None
            }
        }));

        match outcome {
            Ok(matched) => matched,
            Err(panic) => {
                EngineCounters::bump(&self.counters.predicate_failures);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = ArpWardenError::PredicateFailure {
                    rule_id: rule.id.clone(),
                    message,
                };
                error!("{}", err);
                None
            }
        }
    }

    /// Hand events to the sink and the recent-detections buffer
    pub fn dispatch(&self, events: &[DetectionEvent]) {
        if events.is_empty() {
            return;
        }
        if let Some(sink) = &self.sink {
            for event in events {
                sink.deliver(event);
            }
        }
        let mut recent = self.recent.lock();
        for event in events {
            if recent.len() >= self.max_detections {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
    }

    /// Swap in a new rule set; rejected if nothing in it is enabled
    pub fn reload_rules(&self, rules: RuleSet) -> Result<u64> {
        if rules.enabled_count() == 0 {
            return Err(ArpWardenError::ConfigError(
                "refusing to load a rule set with no enabled rules".to_string(),
            ));
        }
        let version = self.rules.swap(rules);
        EngineCounters::bump(&self.counters.reloads);
        Ok(version)
    }

    /// Reload rules from a config file, keeping the current set on error
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let loaded = Config::from_file(path.as_ref()).and_then(|config| {
            config.validate()?;
            config.build_rules()
        });
        match loaded {
            Ok(rules) => self.reload_rules(rules),
            Err(e) => {
                warn!(
                    "Keeping rule set v{}; reload from {} failed: {}",
                    self.rules.version(),
                    path.as_ref().display(),
                    e
                );
                Err(e)
            }
        }
    }

    pub fn recent_detections(&self) -> Vec<DetectionEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    fn note_rejected(&self) {
        EngineCounters::bump(&self.counters.rejected_while_stopped);
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            packets_ingested: c.packets_ingested.load(Ordering::Relaxed),
            malformed_dropped: c.malformed_dropped.load(Ordering::Relaxed),
            rules_evaluated: c.rules_evaluated.load(Ordering::Relaxed),
            predicate_failures: c.predicate_failures.load(Ordering::Relaxed),
            detections_emitted: c.detections_emitted.load(Ordering::Relaxed),
            detections_suppressed: c.detections_suppressed.load(Ordering::Relaxed),
            rejected_while_stopped: c.rejected_while_stopped.load(Ordering::Relaxed),
            ruleset_version: self.rules.version(),
            reloads: c.reloads.load(Ordering::Relaxed),
        }
    }
}

/// Sequential detection engine
///
/// Packets are evaluated one at a time in arrival order. `stop` waits for
/// any evaluation in progress, then rejects further ingests.
pub struct DetectionEngine {
    core: EngineCore,
    store: Mutex<WindowedStateStore>,
    state: RwLock<EngineState>,
}

impl DetectionEngine {
    /// Create a stopped engine from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let core = EngineCore::from_config(config)?;
        let store = WindowedStateStore::new(config.store_settings());
        Ok(Self {
            core,
            store: Mutex::new(store),
            state: RwLock::new(EngineState::Stopped),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.core.set_sink(sink);
        self
    }

    pub fn start(&self) {
        let mut state = self.state.write();
        if *state != EngineState::Running {
            *state = EngineState::Running;
            info!(
                "Detection engine started with rule set v{} ({} rules enabled)",
                self.core.rules.version(),
                self.core.rules().enabled_count()
            );
        }
    }

    /// Wait for in-flight evaluations, then reject new ingests
    pub fn stop(&self) {
        let mut state = self.state.write();
        if *state != EngineState::Stopped {
            *state = EngineState::Stopped;
            info!("Detection engine stopped");
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Evaluate one packet and return the detections it produced
    pub fn ingest(&self, packet: Packet) -> Result<Vec<DetectionEvent>> {
        let state = self.state.read();
        if *state != EngineState::Running {
            self.core.note_rejected();
            return Err(ArpWardenError::NotRunning);
        }

        let events = {
            let mut store = self.store.lock();
            self.core.process(&mut store, &packet)
        };
        drop(state);

        // Sinks may call back into the engine
        self.core.dispatch(&events);
        Ok(events)
    }

    pub fn reload_rules(&self, rules: RuleSet) -> Result<u64> {
        self.core.reload_rules(rules)
    }

    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        self.core.reload_from_file(path)
    }

    pub fn update_gateway(&self, ip: Ipv4Addr, mac: MacAddr, verified: bool) -> bool {
        self.core.gateways.update_gateway(ip, mac, verified)
    }

    pub fn remove_gateway(&self, ip: &Ipv4Addr) -> bool {
        self.core.gateways.remove_gateway(ip)
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

    /// Drop idle state as of `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let removed = self.store.lock().sweep(now);
        self.core.cooldowns.sweep(now);
        removed
    }

    /// Keys currently held by the state store
    pub fn state_key_count(&self) -> usize {
        self.store.lock().key_count()
    }
}
