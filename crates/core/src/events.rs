//! Events surfaced on deploy items.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::item::DeployItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, item: &DeployItem, type_: EventType, reason: &str, message: &str);
}

/// Emits events as log lines only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventRecorder;

#[async_trait::async_trait]
impl EventRecorder for LogEventRecorder {
    async fn record(&self, item: &DeployItem, type_: EventType, reason: &str, message: &str) {
        match type_ {
            EventType::Normal => info!(item = %item.key(), reason, message, "event"),
            EventType::Warning => warn!(item = %item.key(), reason, message, "event"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl CollectingEventRecorder {
    /// `(type, reason, message)` in emission order.
    pub fn events(&self) -> Vec<(EventType, String, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn warnings(&self) -> usize { self.events().iter().filter(|e| e.0 == EventType::Warning).count() }
}

#[async_trait::async_trait]
impl EventRecorder for CollectingEventRecorder {
    async fn record(&self, _item: &DeployItem, type_: EventType, reason: &str, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((type_, reason.to_string(), message.to_string()));
        }
    }
}
