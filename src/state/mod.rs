//! State trackers consulted by the detection rules
//!
//! - `WindowedStateStore`: sliding-window counters and per-host history
//! - `GatewayTracker`: trusted gateway IP/MAC bindings

pub mod gateway;
pub mod store;

use chrono::{DateTime, Duration, Utc};

pub use gateway::{GatewayEntry, GatewayInfo, GatewayTracker};
pub use store::{
    BindingChange, CounterKey, HostBinding, IpStateTable, Observation, ReplyRace,
    StoreSettings, WindowCounter, WindowedStateStore,
};

/// Longest duration any window or horizon may span (about 100 years)
const MAX_SPAN_MS: i64 = 100 * 365 * 24 * 3600 * 1000;

/// Convert fractional seconds from configuration into a chrono duration
pub fn secs(seconds: f64) -> Duration {
    let ms = (seconds.max(0.0) * 1000.0).round().min(MAX_SPAN_MS as f64);
    Duration::milliseconds(ms as i64)
}

/// `span * factor`, saturating at the maximum span
pub fn scaled(span: Duration, factor: u32) -> Duration {
    let ms = span
        .num_milliseconds()
        .saturating_mul(i64::from(factor))
        .min(MAX_SPAN_MS);
    Duration::milliseconds(ms)
}

/// Start of the window of length `span` ending at `latest`
pub fn window_start(latest: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    latest
        .checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
