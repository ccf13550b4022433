//! Detection events
//!
//! The unit of output handed to alerting collaborators.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::packet::MacAddr;

/// Detection severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Severity {
    #[serde(alias = "low")]
    Low = 1,
    #[serde(alias = "medium")]
    Medium = 2,
    #[serde(alias = "high")]
    High = 3,
    #[serde(alias = "critical")]
    Critical = 4,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<u8> for Severity {
    fn from(val: u8) -> Self {
        match val {
            0 | 1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

/// The host a detection is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub mac: MacAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

impl SourceIdentity {
    pub fn mac(mac: MacAddr) -> Self {
        Self { mac, ip: None }
    }

    pub fn host(mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self { mac, ip: Some(ip) }
    }
}

impl std::fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{} ({})", ip, self.mac),
            None => write!(f, "{}", self.mac),
        }
    }
}

/// A fired rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Rule that fired
    pub rule_id: String,
    /// Timestamp of the packet that triggered the rule
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Host the detection is attributed to
    pub source: SourceIdentity,
    /// Confidence (0.0 - 1.0)
    pub confidence: f32,
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Version of the rule set that produced this event
    #[serde(default)]
    pub ruleset_version: u64,
}

impl DetectionEvent {
    /// Create a new detection event
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        source: SourceIdentity,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule_id.into(),
            timestamp: Utc::now(),
            severity,
            source,
            confidence: 1.0,
            description,
            tags: BTreeSet::new(),
            ruleset_version: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_ruleset_version(mut self, version: u64) -> Self {
        self.ruleset_version = version;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl std::fmt::Display for DetectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} (confidence {:.2}): {}",
            self.severity, self.rule_id, self.source, self.confidence, self.description
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::from(4), Severity::Critical);
    }

    #[test]
    fn test_severity_serde_names() {
        let s: Severity = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(s, Severity::Critical);
        let s: Severity = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(s, Severity::Low);
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn test_event_builder() {
        let mac = MacAddr::new(0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb);
        let event = DetectionEvent::new(
            "gateway_impersonation",
            Severity::Critical,
            SourceIdentity::host(mac, Ipv4Addr::new(192, 168, 1, 1)),
            "gateway claimed by unverified MAC".to_string(),
        )
        .with_confidence(1.5)
        .with_tags(["spoofing", "gateway"])
        .with_ruleset_version(3);

        assert_eq!(event.confidence, 1.0);
        assert!(event.has_tag("gateway"));
        assert_eq!(event.ruleset_version, 3);
        assert_eq!(event.source.to_string(), "192.168.1.1 (bb:bb:bb:bb:bb:bb)");
    }
}
