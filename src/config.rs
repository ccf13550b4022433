//! Configuration file support
//!
//! The rule set and engine settings are loaded from TOML. A config file that
//! omits `[rules]` gets the built-in ARP rule set; one that declares
//! `[rules.*]` tables replaces it entirely.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{MacAddr, Severity};
use crate::error::{ArpWardenError, Result};
use crate::rules::{Condition, Rule, RuleSet};
use crate::state::{secs, GatewayTracker, StoreSettings};

/// Root configuration structure
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine-wide settings
    pub settings: Settings,

    /// Gateway trust anchors
    pub gateway: GatewaySettings,

    /// Rules keyed by id
    pub rules: BTreeMap<String, RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            gateway: GatewaySettings::default(),
            rules: default_rules(),
        }
    }
}

/// Engine-wide settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds of per-host history kept for stateful rules
    pub history_window: f64,
    /// Size of the recent-detections buffer
    pub max_detections: usize,
    /// Cooldown in seconds for rules that do not set one
    pub default_cooldown: f64,
    /// Keys idle for this many retention periods are dropped
    pub idle_horizon_factor: u32,
    /// Per-key entry cap before the oldest entries are evicted
    pub max_entries_per_key: usize,
    /// Prior MACs remembered per IP
    pub binding_history_len: usize,
    /// Cooldown entries are kept for this many cooldown periods
    pub cooldown_retention_factor: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            history_window: 60.0,
            max_detections: 1000,
            default_cooldown: 60.0,
            idle_horizon_factor: 10,
            max_entries_per_key: 4096,
            binding_history_len: 16,
            cooldown_retention_factor: 10,
        }
    }
}

/// Gateway trust anchors
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Reported while no gateway has been established
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_mac: Option<MacAddr>,
    /// Track several gateways instead of one
    pub multi_gateway: bool,
    /// Verified gateways installed at startup
    #[serde(rename = "static")]
    pub static_gateways: Vec<StaticGateway>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticGateway {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f32 {
    0.5
}

/// One `[rules.<id>]` table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Seconds; falls back to `settings.default_cooldown`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub condition: Condition,
}

impl RuleConfig {
    fn to_rule(&self, id: &str, default_cooldown: f64) -> Rule {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        let mut rule = Rule::new(id, self.condition.clone(), self.severity)
            .with_description(&self.description)
            .with_threshold(self.threshold)
            .with_cooldown(self.cooldown.unwrap_or(default_cooldown))
            .with_tags(&tags);
        rule.enabled = self.enabled;
        rule
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ArpWardenError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config: Self = content.parse()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ArpWardenError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            ArpWardenError::ConfigError(format!("Failed to write config file: {}", e))
        })
    }

    /// Default config file content with comments
    pub fn default_with_comments() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - ARPWARDEN_HISTORY_WINDOW, ARPWARDEN_DEFAULT_COOLDOWN (seconds)
    /// - ARPWARDEN_MAX_DETECTIONS
    /// - ARPWARDEN_GATEWAY_IP, ARPWARDEN_GATEWAY_MAC (fallback gateway)
    /// - ARPWARDEN_MULTI_GATEWAY (true/false)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ARPWARDEN_HISTORY_WINDOW") {
            match v.parse::<f64>() {
                Ok(n) => self.settings.history_window = n,
                Err(_) => warn!("Ignoring ARPWARDEN_HISTORY_WINDOW={}", v),
            }
        }
        if let Ok(v) = std::env::var("ARPWARDEN_DEFAULT_COOLDOWN") {
            match v.parse::<f64>() {
                Ok(n) => self.settings.default_cooldown = n,
                Err(_) => warn!("Ignoring ARPWARDEN_DEFAULT_COOLDOWN={}", v),
            }
        }
        if let Ok(v) = std::env::var("ARPWARDEN_MAX_DETECTIONS") {
            match v.parse::<usize>() {
                Ok(n) => self.settings.max_detections = n,
                Err(_) => warn!("Ignoring ARPWARDEN_MAX_DETECTIONS={}", v),
            }
        }
        if let Ok(v) = std::env::var("ARPWARDEN_GATEWAY_IP") {
            match v.parse::<Ipv4Addr>() {
                Ok(ip) => self.gateway.fallback_ip = Some(ip),
                Err(_) => warn!("Ignoring ARPWARDEN_GATEWAY_IP={}", v),
            }
        }
        if let Ok(v) = std::env::var("ARPWARDEN_GATEWAY_MAC") {
            match v.parse::<MacAddr>() {
                Ok(mac) => self.gateway.fallback_mac = Some(mac),
                Err(_) => warn!("Ignoring ARPWARDEN_GATEWAY_MAC={}", v),
            }
        }
        if let Ok(v) = std::env::var("ARPWARDEN_MULTI_GATEWAY") {
            self.gateway.multi_gateway = v == "1" || v.to_lowercase() == "true";
        }
    }

    /// Check settings and rules; a config that passes can start an engine
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if !(s.history_window.is_finite() && s.history_window > 0.0) {
            return Err(ArpWardenError::ConfigError(format!(
                "history_window must be positive, got {}",
                s.history_window
            )));
        }
        if !(s.default_cooldown.is_finite() && s.default_cooldown >= 0.0) {
            return Err(ArpWardenError::ConfigError(format!(
                "default_cooldown must not be negative, got {}",
                s.default_cooldown
            )));
        }
        if s.max_detections == 0 || s.max_entries_per_key == 0 {
            return Err(ArpWardenError::ConfigError(
                "max_detections and max_entries_per_key must be at least 1".to_string(),
            ));
        }
        if self.gateway.fallback_ip.is_some() != self.gateway.fallback_mac.is_some() {
            return Err(ArpWardenError::ConfigError(
                "fallback_ip and fallback_mac must be set together".to_string(),
            ));
        }
        if let Some(cooldown) = self.rules.values().filter_map(|r| r.cooldown).find(|c| *c < 0.0) {
            return Err(ArpWardenError::ConfigError(format!(
                "rule cooldown must not be negative, got {}",
                cooldown
            )));
        }

        let rules = self.build_rules()?;
        if rules.enabled_count() == 0 {
            return Err(ArpWardenError::ConfigError(
                "no enabled rules configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile `[rules.*]` into a rule set
    pub fn build_rules(&self) -> Result<RuleSet> {
        let rules = self
            .rules
            .iter()
            .map(|(id, rc)| rc.to_rule(id, self.settings.default_cooldown))
            .collect();
        RuleSet::new(rules)
    }

    /// State store settings for the configured history window
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            retention: secs(self.settings.history_window),
            idle_factor: self.settings.idle_horizon_factor,
            max_entries_per_key: self.settings.max_entries_per_key,
            binding_history_len: self.settings.binding_history_len,
        }
    }

    /// Gateway tracker seeded with the fallback and static gateways
    pub fn gateway_tracker(&self) -> GatewayTracker {
        let mut tracker = GatewayTracker::new(self.gateway.multi_gateway);
        if let (Some(ip), Some(mac)) = (self.gateway.fallback_ip, self.gateway.fallback_mac) {
            tracker = tracker.with_fallback(ip, mac);
        }
        for gw in &self.gateway.static_gateways {
            tracker.update_gateway(gw.ip, gw.mac, true);
        }
        tracker
    }
}

impl FromStr for Config {
    type Err = ArpWardenError;

    /// Parse configuration from a TOML string
    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ArpWardenError::ConfigError(format!("Failed to parse config: {}", e)))
    }
}

fn rule(
    description: &str,
    condition: Condition,
    severity: Severity,
    threshold: f32,
    cooldown: f64,
    tags: &[&str],
) -> RuleConfig {
    RuleConfig {
        description: description.to_string(),
        severity,
        enabled: true,
        threshold,
        cooldown: Some(cooldown),
        tags: tags.iter().map(|s| s.to_string()).collect(),
        condition,
    }
}

/// Built-in ARP rule set
fn default_rules() -> BTreeMap<String, RuleConfig> {
    let mut rules = BTreeMap::new();
    rules.insert(
        "arp_spoofing".to_string(),
        rule(
            "IP address moved to a different MAC",
            Condition::MacChangedForIp,
            Severity::High,
            0.8,
            60.0,
            &["spoofing", "mitm"],
        ),
    );
    rules.insert(
        "gateway_impersonation".to_string(),
        rule(
            "Gateway IP claimed by a MAC that is not the gateway's",
            Condition::GatewayImpersonation,
            Severity::Critical,
            0.9,
            30.0,
            &["spoofing", "gateway"],
        ),
    );
    rules.insert(
        "gratuitous_arp".to_string(),
        rule(
            "Gratuitous ARP reply",
            Condition::GratuitousArp,
            Severity::Low,
            0.5,
            300.0,
            &[],
        ),
    );
    rules.insert(
        "gratuitous_flood".to_string(),
        rule(
            "Burst of gratuitous ARP replies from one host",
            Condition::gratuitous_flood(),
            Severity::Medium,
            0.8,
            60.0,
            &["flood"],
        ),
    );
    rules.insert(
        "request_flood".to_string(),
        rule(
            "ARP request flood from one host",
            Condition::request_flood(),
            Severity::High,
            0.8,
            30.0,
            &["dos", "flood"],
        ),
    );
    rules.insert(
        "reply_flood".to_string(),
        rule(
            "ARP reply flood from one host",
            Condition::reply_flood(),
            Severity::High,
            0.8,
            30.0,
            &["flood"],
        ),
    );
    rules.insert(
        "multi_ip_same_mac".to_string(),
        rule(
            "One MAC claiming several IP addresses",
            Condition::multi_ip_same_mac(),
            Severity::Medium,
            0.8,
            120.0,
            &["mitm"],
        ),
    );
    rules.insert(
        "multiple_replies_same_request".to_string(),
        rule(
            "Several hosts answered the same ARP request",
            Condition::multiple_replies_same_request(),
            Severity::High,
            0.8,
            60.0,
            &["mitm"],
        ),
    );
    rules.insert(
        "sequential_scan".to_string(),
        rule(
            "Requests sweeping consecutive addresses",
            Condition::sequential_scan(),
            Severity::Medium,
            0.7,
            300.0,
            &["recon"],
        ),
    );
    rules.insert(
        "unusual_flags".to_string(),
        rule(
            "ARP header fields outside Ethernet/IPv4",
            Condition::UnusualFlags,
            Severity::Low,
            0.5,
            300.0,
            &["malformed"],
        ),
    );
    rules
}

const DEFAULT_CONFIG: &str = include_str!("../config/arpwarden.toml");
