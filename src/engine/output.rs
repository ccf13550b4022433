//! Detection delivery
//!
//! Sinks receive every emitted detection after the engine has finished
//! evaluating the packet. Delivery is best-effort with no retries: a
//! broadcast with no subscribers drops the event.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::{DetectionEvent, Severity};

/// Receives emitted detections
///
/// Called on the evaluating thread after the engine has released its
/// lifecycle lock, so a sink may call `stop` or `ingest` on the engine.
pub trait DetectionSink: Send + Sync {
    fn deliver(&self, event: &DetectionEvent);
}

pub type DetectionCallback = Arc<dyn Fn(&DetectionEvent) + Send + Sync>;

/// Fans detections out to broadcast subscribers and callbacks
pub struct OutputHandler {
    callbacks: Vec<DetectionCallback>,
    broadcast_tx: broadcast::Sender<DetectionEvent>,
}

impl OutputHandler {
    pub fn new(channel_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            callbacks: Vec::new(),
            broadcast_tx,
        }
    }

    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: Fn(&DetectionEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn emit(&self, event: &DetectionEvent) {
        // No receivers is not an error
        let _ = self.broadcast_tx.send(event.clone());

        for callback in &self.callbacks {
            callback(event);
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }
}

impl Default for OutputHandler {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DetectionSink for OutputHandler {
    fn deliver(&self, event: &DetectionEvent) {
        self.emit(event);
    }
}

/// Writes detections to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn deliver(&self, event: &DetectionEvent) {
        match event.severity {
            Severity::High | Severity::Critical => warn!(
                rule = %event.rule_id,
                source = %event.source,
                confidence = event.confidence,
                "[{}] {}",
                event.severity,
                event.description
            ),
            Severity::Low | Severity::Medium => info!(
                rule = %event.rule_id,
                source = %event.source,
                confidence = event.confidence,
                "[{}] {}",
                event.severity,
                event.description
            ),
        }
    }
}

/// Delivers to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DetectionSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl DetectionSink for FanoutSink {
    fn deliver(&self, event: &DetectionEvent) {
        for sink in &self.sinks {
            sink.deliver(event);
        }
    }
}
