//! Rule conditions
//!
//! A closed set of parameterized predicates. Each variant is selected by
//! its `type` tag when the rule configuration is loaded and evaluates to a
//! confidence in `[0, 1]` from the current packet and the state stores.
//! Evaluation only reads state; the engine updates the stores before any
//! condition runs.

use std::net::Ipv4Addr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::core::{Packet, SourceIdentity};
use crate::state::{secs, CounterKey, GatewayInfo, Observation, WindowedStateStore};

/// Everything a condition may consult for one packet
pub struct EvalContext<'a> {
    pub packet: &'a Packet,
    pub store: &'a WindowedStateStore,
    pub gateways: &'a GatewayInfo,
    pub observation: &'a Observation,
    /// Default horizon for history-based conditions
    pub history_window: Duration,
}

fn default_gratuitous_window() -> f64 {
    10.0
}

fn default_gratuitous_max() -> usize {
    5
}

fn default_request_window() -> f64 {
    5.0
}

fn default_request_max() -> usize {
    20
}

fn default_reply_window() -> f64 {
    5.0
}

fn default_reply_max() -> usize {
    15
}

fn default_max_ips() -> usize {
    1
}

fn default_reply_race_window() -> f64 {
    2.0
}

fn default_scan_window() -> f64 {
    10.0
}

fn default_scan_min_targets() -> usize {
    10
}

fn default_scan_max_step() -> u32 {
    2
}

/// Predicate variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// A reply moved its sender IP to a different MAC
    MacChangedForIp,
    /// A reply claims a gateway IP from a MAC that is not a verified gateway MAC
    GatewayImpersonation,
    /// Reply whose sender and target IP are equal
    GratuitousArp,
    GratuitousFlood {
        /// Seconds
        #[serde(default = "default_gratuitous_window")]
        window: f64,
        #[serde(default = "default_gratuitous_max")]
        max_count: usize,
    },
    RequestFlood {
        #[serde(default = "default_request_window")]
        window: f64,
        #[serde(default = "default_request_max")]
        max_count: usize,
    },
    ReplyFlood {
        #[serde(default = "default_reply_window")]
        window: f64,
        #[serde(default = "default_reply_max")]
        max_count: usize,
    },
    /// One MAC claiming more than `max_ips` IPs
    MultiIpSameMac {
        #[serde(default = "default_max_ips")]
        max_ips: usize,
        /// Seconds; defaults to the history window
        #[serde(default, skip_serializing_if = "Option::is_none")]
        horizon: Option<f64>,
    },
    /// Several distinct MACs answered the same request
    MultipleRepliesSameRequest {
        #[serde(default = "default_reply_race_window")]
        window: f64,
    },
    /// Requests walking the address space in small steps
    SequentialScan {
        #[serde(default = "default_scan_window")]
        window: f64,
        #[serde(default = "default_scan_min_targets")]
        min_targets: usize,
        #[serde(default = "default_scan_max_step")]
        max_step: u32,
    },
    /// Header fields outside Ethernet/IPv4 ARP
    UnusualFlags,
    /// Always panics when evaluated
    #[cfg(test)]
    #[serde(skip)]
    Panicking,
}

impl Condition {
    pub fn gratuitous_flood() -> Self {
        Condition::GratuitousFlood {
            window: default_gratuitous_window(),
            max_count: default_gratuitous_max(),
        }
    }

    pub fn request_flood() -> Self {
        Condition::RequestFlood {
            window: default_request_window(),
            max_count: default_request_max(),
        }
    }

    pub fn reply_flood() -> Self {
        Condition::ReplyFlood {
            window: default_reply_window(),
            max_count: default_reply_max(),
        }
    }

    pub fn multi_ip_same_mac() -> Self {
        Condition::MultiIpSameMac {
            max_ips: default_max_ips(),
            horizon: None,
        }
    }

    pub fn multiple_replies_same_request() -> Self {
        Condition::MultipleRepliesSameRequest {
            window: default_reply_race_window(),
        }
    }

    pub fn sequential_scan() -> Self {
        Condition::SequentialScan {
            window: default_scan_window(),
            min_targets: default_scan_min_targets(),
            max_step: default_scan_max_step(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::MacChangedForIp => "mac_changed_for_ip",
            Condition::GatewayImpersonation => "gateway_impersonation",
            Condition::GratuitousArp => "gratuitous_arp",
            Condition::GratuitousFlood { .. } => "gratuitous_flood",
            Condition::RequestFlood { .. } => "request_flood",
            Condition::ReplyFlood { .. } => "reply_flood",
            Condition::MultiIpSameMac { .. } => "multi_ip_same_mac",
            Condition::MultipleRepliesSameRequest { .. } => "multiple_replies_same_request",
            Condition::SequentialScan { .. } => "sequential_scan",
            Condition::UnusualFlags => "unusual_flags",
            #[cfg(test)]
            Condition::Panicking => "panicking",
        }
    }

    /// Longest window this condition counts over, if any
    pub fn window(&self) -> Option<Duration> {
        match self {
            Condition::GratuitousFlood { window, .. }
            | Condition::RequestFlood { window, .. }
            | Condition::ReplyFlood { window, .. }
            | Condition::MultipleRepliesSameRequest { window }
            | Condition::SequentialScan { window, .. } => Some(secs(*window)),
            Condition::MultiIpSameMac { horizon, .. } => horizon.map(secs),
            _ => None,
        }
    }

    /// Check parameters at load time
    pub fn validate(&self) -> std::result::Result<(), String> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(format!("{} must be a positive number of seconds, got {}", name, value))
            }
        };

        match self {
            Condition::GratuitousFlood { window, .. }
            | Condition::RequestFlood { window, .. }
            | Condition::ReplyFlood { window, .. }
            | Condition::MultipleRepliesSameRequest { window } => positive("window", *window),
            Condition::MultiIpSameMac { horizon, .. } => match horizon {
                Some(h) => positive("horizon", *h),
                None => Ok(()),
            },
            Condition::SequentialScan {
                window,
                min_targets,
                max_step,
            } => {
                positive("window", *window)?;
                if *min_targets < 2 {
                    return Err(format!("min_targets must be at least 2, got {}", min_targets));
                }
                if *max_step == 0 {
                    return Err("max_step must be at least 1".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Confidence in `[0, 1]` that this condition holds for the packet
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> f32 {
        let packet = ctx.packet;

        match self {
            Condition::MacChangedForIp => {
                if packet.is_reply() && ctx.observation.binding_change.is_some() {
                    1.0
                } else {
                    0.0
                }
            }

            Condition::GatewayImpersonation => {
                if !packet.is_reply() {
                    return 0.0;
                }
                let Some(entry) = ctx.gateways.entry(&packet.src_ip) else {
                    return 0.0;
                };
                if ctx.gateways.is_valid_gateway_mac(&packet.src_mac) || entry.mac == packet.src_mac {
                    return 0.0;
                }
                if entry.verified {
                    1.0
                } else {
                    0.5
                }
            }

            Condition::GratuitousArp => {
                if packet.is_reply() && packet.is_gratuitous() {
                    1.0
                } else {
                    0.0
                }
            }

            Condition::GratuitousFlood { window, max_count } => {
                if !(packet.is_reply() && packet.is_gratuitous()) {
                    return 0.0;
                }
                exceeds(ctx, CounterKey::Gratuitous(packet.src_mac), *window, *max_count)
            }

            Condition::RequestFlood { window, max_count } => {
                if !packet.is_request() {
                    return 0.0;
                }
                exceeds(ctx, CounterKey::Requests(packet.src_mac), *window, *max_count)
            }

            Condition::ReplyFlood { window, max_count } => {
                if !packet.is_reply() {
                    return 0.0;
                }
                exceeds(ctx, CounterKey::Replies(packet.src_mac), *window, *max_count)
            }

            Condition::MultiIpSameMac { max_ips, horizon } => {
                if !packet.is_reply() || packet.src_ip.is_unspecified() {
                    return 0.0;
                }
                let horizon = horizon.map(secs).unwrap_or(ctx.history_window);
                if ctx.store.distinct_ips_for_mac(&packet.src_mac, horizon) > *max_ips {
                    1.0
                } else {
                    0.0
                }
            }

            Condition::MultipleRepliesSameRequest { window } => {
                if !packet.is_reply() || !ctx.observation.answered_request() {
                    return 0.0;
                }
                if ctx.observation.responders_within(secs(*window)) > 1 {
                    1.0
                } else {
                    0.0
                }
            }

            Condition::SequentialScan {
                window,
                min_targets,
                max_step,
            } => {
                if !packet.is_request() {
                    return 0.0;
                }
                let trail = ctx.store.request_trail(&packet.src_mac, secs(*window));
                scan_confidence(&trail, *min_targets, *max_step)
            }

            Condition::UnusualFlags => {
                let anomalies = packet.header_anomalies().len();
                if anomalies == 0 {
                    0.0
                } else {
                    (0.5 + 0.25 * anomalies as f32).min(1.0)
                }
            }

            #[cfg(test)]
            Condition::Panicking => panic!("condition evaluation failed"),
        }
    }

    /// Host a detection from this condition is attributed to
    pub fn source(&self, packet: &Packet) -> SourceIdentity {
        match self {
            Condition::MacChangedForIp
            | Condition::GatewayImpersonation
            | Condition::GratuitousArp
            | Condition::GratuitousFlood { .. }
            | Condition::MultipleRepliesSameRequest { .. }
                if !packet.src_ip.is_unspecified() =>
            {
                SourceIdentity::host(packet.src_mac, packet.src_ip)
            }
            _ => SourceIdentity::mac(packet.src_mac),
        }
    }

    /// Human-readable account of why the condition matched
    pub fn detail(&self, ctx: &EvalContext<'_>) -> String {
        let packet = ctx.packet;

        match self {
            Condition::MacChangedForIp => match &ctx.observation.binding_change {
                Some(change) => format!(
                    "{} moved from {} to {} ({} changes)",
                    change.ip, change.previous, change.current, change.change_count
                ),
                None => format!("{} changed MAC", packet.src_ip),
            },
            Condition::GatewayImpersonation => {
                let expected = ctx
                    .gateways
                    .entry(&packet.src_ip)
                    .map(|e| e.mac.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "gateway {} claimed by {} (expected {})",
                    packet.src_ip, packet.src_mac, expected
                )
            }
            Condition::GratuitousArp => {
                format!("gratuitous ARP announcing {} at {}", packet.src_ip, packet.src_mac)
            }
            Condition::GratuitousFlood { window, .. } => format!(
                "{} gratuitous replies from {} in {}s",
                ctx.store
                    .count_in_window(&CounterKey::Gratuitous(packet.src_mac), secs(*window)),
                packet.src_mac,
                window
            ),
            Condition::RequestFlood { window, .. } => format!(
                "{} requests from {} in {}s",
                ctx.store
                    .count_in_window(&CounterKey::Requests(packet.src_mac), secs(*window)),
                packet.src_mac,
                window
            ),
            Condition::ReplyFlood { window, .. } => format!(
                "{} replies from {} in {}s",
                ctx.store
                    .count_in_window(&CounterKey::Replies(packet.src_mac), secs(*window)),
                packet.src_mac,
                window
            ),
            Condition::MultiIpSameMac { horizon, .. } => {
                let horizon = horizon.map(secs).unwrap_or(ctx.history_window);
                let ips = ctx.store.claimed_ips(&packet.src_mac, horizon);
                let listed: Vec<String> = ips.iter().map(Ipv4Addr::to_string).collect();
                format!("{} claims {} IPs: {}", packet.src_mac, ips.len(), listed.join(", "))
            }
            Condition::MultipleRepliesSameRequest { window } => format!(
                "{} distinct MACs answered the request for {}",
                ctx.observation.responders_within(secs(*window)),
                packet.src_ip
            ),
            Condition::SequentialScan { window, .. } => {
                let trail = dedup(ctx.store.request_trail(&packet.src_mac, secs(*window)));
                match (trail.first(), trail.last()) {
                    (Some(first), Some(last)) => format!(
                        "{} swept {} targets from {} to {}",
                        packet.src_mac,
                        trail.len(),
                        first,
                        last
                    ),
                    _ => format!("{} scanning", packet.src_mac),
                }
            }
            Condition::UnusualFlags => format!(
                "unusual ARP header from {}: {}",
                packet.src_mac,
                packet.header_anomalies().join(", ")
            ),
            #[cfg(test)]
            Condition::Panicking => String::new(),
        }
    }
}

fn exceeds(ctx: &EvalContext<'_>, key: CounterKey, window: f64, max_count: usize) -> f32 {
    if ctx.store.count_in_window(&key, secs(window)) > max_count {
        1.0
    } else {
        0.0
    }
}

fn dedup(mut trail: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
    trail.dedup();
    trail
}

/// Fraction of steps that move in one direction by at most `max_step`
fn scan_confidence(trail: &[Ipv4Addr], min_targets: usize, max_step: u32) -> f32 {
    let targets = dedup(trail.to_vec());
    if targets.len() < min_targets.max(2) {
        return 0.0;
    }

    let max_step = i64::from(max_step);
    let mut ascending = 0usize;
    let mut descending = 0usize;
    for pair in targets.windows(2) {
        let delta = i64::from(u32::from(pair[1])) - i64::from(u32::from(pair[0]));
        if delta > 0 && delta <= max_step {
            ascending += 1;
        } else if delta < 0 && -delta <= max_step {
            descending += 1;
        }
    }

    let steps = targets.len() - 1;
    ascending.max(descending) as f32 / steps as f32
}
