//! arpwarden: rule-based ARP attack detection
//!
//! Feeds already-parsed ARP packets through a declarative rule set and
//! emits severity-classified detections (spoofing, gateway impersonation,
//! floods, MITM, reconnaissance), with per-rule cooldowns suppressing
//! repeats.
//!
//! ```no_run
//! use arpwarden::{Config, DetectionEngine, Packet};
//!
//! let engine = DetectionEngine::from_config(&Config::default()).unwrap();
//! engine.start();
//! # let packet: Packet = serde_json::from_str("{}").unwrap();
//! for event in engine.ingest(packet).unwrap() {
//!     println!("{}", event);
//! }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod rules;
pub mod state;

pub use config::Config;
pub use core::{ArpOp, DetectionEvent, MacAddr, Packet, Severity, SourceIdentity};
pub use engine::{
    DetectionEngine, DetectionSink, EngineState, EngineStats, LogSink, OutputHandler,
    ShardedEngine,
};
pub use error::{ArpWardenError, Result};
pub use rules::{Condition, CooldownManager, Rule, RuleSet};
pub use state::{GatewayTracker, WindowedStateStore};
