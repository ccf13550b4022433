//! Alert cooldowns
//!
//! Suppresses repeat detections of the same rule for the same source
//! within the rule's cooldown. Shared by every evaluation lane of an
//! engine; `try_fire` does the check and the record under one lock.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::SourceIdentity;
use crate::state::scaled;

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    last_fire: DateTime<Utc>,
    cooldown: Duration,
}

impl CooldownEntry {
    fn permits(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        now - self.last_fire >= cooldown
    }
}

/// Last fire time per (rule, source)
#[derive(Debug)]
pub struct CooldownManager {
    entries: Mutex<HashMap<(String, SourceIdentity), CooldownEntry>>,
    /// Entries older than `cooldown * retention_factor` are dropped on sweep
    retention_factor: u32,
}

impl CooldownManager {
    pub fn new(retention_factor: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention_factor: retention_factor.max(1),
        }
    }

    /// Whether a detection may be emitted now; does not record anything
    pub fn should_emit(
        &self,
        rule_id: &str,
        source: &SourceIdentity,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        let entries = self.entries.lock();
        entries
            .get(&(rule_id.to_string(), *source))
            .map_or(true, |entry| entry.permits(now, cooldown))
    }

    pub fn record_fire(
        &self,
        rule_id: &str,
        source: &SourceIdentity,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) {
        self.entries.lock().insert(
            (rule_id.to_string(), *source),
            CooldownEntry {
                last_fire: now,
                cooldown,
            },
        );
    }

    /// Check and record in one step; true if the caller should emit
    pub fn try_fire(
        &self,
        rule_id: &str,
        source: &SourceIdentity,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        let mut entries = self.entries.lock();
        let key = (rule_id.to_string(), *source);
        if let Some(entry) = entries.get(&key) {
            if !entry.permits(now, cooldown) {
                return false;
            }
        }
        entries.insert(
            key,
            CooldownEntry {
                last_fire: now,
                cooldown,
            },
        );
        true
    }

    /// Drop entries that can no longer suppress anything
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let factor = self.retention_factor;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.last_fire < scaled(entry.cooldown, factor));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Expired {} cooldown entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for CooldownManager {
    fn default() -> Self {
        Self::new(10)
    }
}
