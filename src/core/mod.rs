//! Core shared types
//!
//! - `Packet`: normalized ARP packet
//! - `DetectionEvent`: detection/alert events

pub mod event;
pub mod packet;

pub use event::{DetectionEvent, Severity, SourceIdentity};
pub use packet::{ArpOp, MacAddr, Packet};
