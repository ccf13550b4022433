//! Gateway tracker
//!
//! Holds the trusted gateway IP/MAC bindings the impersonation rule checks
//! replies against. Updates come from an authoritative collaborator (an
//! operator, a routing-table inspector, the config file), never from the
//! packet stream itself.
//!
//! Readers take an immutable `Arc<GatewayInfo>` snapshot. Writers clone the
//! current info, mutate the clone and swap it in, so a reader never sees a
//! half-applied update.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::MacAddr;

/// One gateway binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub verified: bool,
    pub last_seen: DateTime<Utc>,
}

/// Versioned set of gateway bindings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Ordered by first establishment
    pub entries: Vec<GatewayEntry>,
    /// Bumped on every applied update
    pub version: u64,
    pub multi_gateway: bool,
}

impl GatewayInfo {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, ip: &Ipv4Addr) -> Option<&GatewayEntry> {
        self.entries.iter().find(|e| e.ip == *ip)
    }

    pub fn is_gateway_ip(&self, ip: &Ipv4Addr) -> bool {
        self.entry(ip).is_some()
    }

    /// True if `mac` matches a verified binding for any gateway IP
    pub fn is_valid_gateway_mac(&self, mac: &MacAddr) -> bool {
        self.entries.iter().any(|e| e.verified && e.mac == *mac)
    }
}

/// Copy-on-write holder of the current `GatewayInfo`
#[derive(Debug)]
pub struct GatewayTracker {
    current: RwLock<Arc<GatewayInfo>>,
    /// Served while no gateway has been established
    fallback: Option<Arc<GatewayInfo>>,
    multi_gateway: bool,
}

impl GatewayTracker {
    pub fn new(multi_gateway: bool) -> Self {
        Self {
            current: RwLock::new(Arc::new(GatewayInfo {
                entries: Vec::new(),
                version: 0,
                multi_gateway,
            })),
            fallback: None,
            multi_gateway,
        }
    }

    /// Configure the binding reported when nothing else is known
    pub fn with_fallback(mut self, ip: Ipv4Addr, mac: MacAddr) -> Self {
        self.fallback = Some(Arc::new(GatewayInfo {
            entries: vec![GatewayEntry {
                ip,
                mac,
                verified: true,
                last_seen: Utc::now(),
            }],
            version: 0,
            multi_gateway: self.multi_gateway,
        }));
        self
    }

    pub fn multi_gateway(&self) -> bool {
        self.multi_gateway
    }

    /// Current bindings, or the fallback if none are established
    pub fn snapshot(&self) -> Arc<GatewayInfo> {
        let current = self.current.read().clone();
        match &self.fallback {
            Some(fallback) if current.is_empty() => fallback.clone(),
            _ => current,
        }
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    pub fn is_gateway_ip(&self, ip: &Ipv4Addr) -> bool {
        self.snapshot().is_gateway_ip(ip)
    }

    pub fn is_valid_gateway_mac(&self, mac: &MacAddr) -> bool {
        self.snapshot().is_valid_gateway_mac(mac)
    }

    /// Apply a gateway binding; returns false if policy rejected it
    ///
    /// An unverified update never displaces a verified binding, including
    /// the fallback while it is being served. In single-gateway mode a
    /// verified update replaces whatever was there.
    pub fn update_gateway(&self, ip: Ipv4Addr, mac: MacAddr, verified: bool) -> bool {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        let now = Utc::now();

        if next.entries.is_empty() {
            if let Some(fallback) = &self.fallback {
                next.entries = fallback.entries.clone();
            }
        }

        if let Some(existing) = next.entries.iter_mut().find(|e| e.ip == ip) {
            if existing.mac == mac {
                existing.verified |= verified;
                existing.last_seen = now;
                next.version += 1;
                *guard = Arc::new(next);
                return true;
            }
            if existing.verified && !verified {
                warn!(
                    "Rejected unverified gateway update {} -> {} (verified {})",
                    ip, mac, existing.mac
                );
                return false;
            }
        }

        let entry = GatewayEntry {
            ip,
            mac,
            verified,
            last_seen: now,
        };

        if self.multi_gateway {
            match next.entries.iter_mut().find(|e| e.ip == ip) {
                Some(slot) => *slot = entry,
                None => next.entries.push(entry),
            }
        } else {
            let blocked = !verified
                && next
                    .entries
                    .first()
                    .map_or(false, |current| current.verified && current.ip != ip);
            if blocked {
                warn!(
                    "Rejected unverified gateway {} ({}); verified gateway already set",
                    ip, mac
                );
                return false;
            }
            next.entries = vec![entry];
        }

        next.version += 1;
        info!(
            "Gateway {} is at {} ({}), version {}",
            ip,
            mac,
            if verified { "verified" } else { "unverified" },
            next.version
        );
        *guard = Arc::new(next);
        true
    }

    /// Forget the binding for `ip`
    pub fn remove_gateway(&self, ip: &Ipv4Addr) -> bool {
        let mut guard = self.current.write();
        if !guard.is_gateway_ip(ip) {
            return false;
        }
        let mut next = (**guard).clone();
        next.entries.retain(|e| e.ip != *ip);
        next.version += 1;
        *guard = Arc::new(next);
        true
    }
}

impl Default for GatewayTracker {
    fn default() -> Self {
        Self::new(false)
    }
}
