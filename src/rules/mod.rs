//! Detection rules
//!
//! A `Rule` binds a condition to a severity, a confidence threshold and a
//! cooldown. A `RuleSet` is an immutable collection of rules kept in id
//! order, which is also evaluation order. Reloads build a new set and
//! swap it into a `RuleHandle` in one step.

pub mod condition;
pub mod cooldown;

pub use condition::{Condition, EvalContext};
pub use cooldown::CooldownManager;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use tracing::info;

use crate::core::Severity;
use crate::error::{ArpWardenError, Result};
use crate::state::secs;

/// A single detection rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub condition: Condition,
    pub severity: Severity,
    /// Minimum confidence for the rule to fire
    pub threshold: f32,
    pub cooldown: Duration,
    pub enabled: bool,
    pub tags: BTreeSet<String>,
}

impl Rule {
    pub fn new(id: impl Into<String>, condition: Condition, severity: Severity) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            condition,
            severity,
            threshold: 0.5,
            cooldown: Duration::seconds(60),
            enabled: true,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Cooldown in seconds
    pub fn with_cooldown(mut self, seconds: f64) -> Self {
        self.cooldown = secs(seconds);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a confidence clears this rule's threshold
    pub fn matches(&self, confidence: f32) -> bool {
        confidence > 0.0 && confidence >= self.threshold
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ArpWardenError::ConfigError("rule id must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ArpWardenError::ConfigError(format!(
                "rule {}: threshold {} outside [0, 1]",
                self.id, self.threshold
            )));
        }
        if self.cooldown < Duration::zero() {
            return Err(ArpWardenError::ConfigError(format!(
                "rule {}: negative cooldown",
                self.id
            )));
        }
        self.condition
            .validate()
            .map_err(|e| ArpWardenError::ConfigError(format!("rule {}: {}", self.id, e)))
    }
}

/// Immutable, id-ordered collection of rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    version: u64,
}

impl RuleSet {
    /// Validate and order rules; duplicate ids are rejected
    pub fn new(mut rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.clone()) {
                return Err(ArpWardenError::ConfigError(format!(
                    "duplicate rule id {}",
                    rule.id
                )));
            }
        }
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self { rules, version: 0 })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Enabled rules in evaluation order
    pub fn enabled(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Largest window any enabled rule counts over
    pub fn largest_window(&self) -> Duration {
        self.enabled()
            .filter_map(|r| r.condition.window())
            .max()
            .unwrap_or_else(Duration::zero)
    }

    /// Largest cooldown among enabled rules
    pub fn largest_cooldown(&self) -> Duration {
        self.enabled()
            .map(|r| r.cooldown)
            .max()
            .unwrap_or_else(Duration::zero)
    }
}

/// Shared pointer to the active rule set
///
/// Each packet evaluates against one `current()` snapshot; `swap` only
/// affects packets that take their snapshot afterwards.
#[derive(Debug)]
pub struct RuleHandle {
    current: RwLock<Arc<RuleSet>>,
    versions: AtomicU64,
}

impl RuleHandle {
    pub fn new(mut rules: RuleSet) -> Self {
        rules.version = 1;
        Self {
            current: RwLock::new(Arc::new(rules)),
            versions: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Install `rules` as the active set and return its version
    pub fn swap(&self, mut rules: RuleSet) -> u64 {
        let mut guard = self.current.write();
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        rules.version = version;
        info!(
            "Activated rule set v{} ({} rules, {} enabled)",
            version,
            rules.len(),
            rules.enabled_count()
        );
        *guard = Arc::new(rules);
        version
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }
}
