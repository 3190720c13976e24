use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::ui_events::NotifierUiEvent;

/// Severity of a UI log line; each maps onto the matching tracing level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLogLevel {
    Info,
    Warn,
    Error,
}

/// Mirrors operator-relevant lines into a bounded ring buffer (served on
/// `/api/v1/logs`) and onto the UI event stream as `log_entry` events.
#[derive(Clone)]
pub struct UiLogger {
    tx: broadcast::Sender<NotifierUiEvent>,
    buffer: Arc<RwLock<VecDeque<String>>>,
    max_entries: usize,
}

impl UiLogger {
    pub fn new(tx: broadcast::Sender<NotifierUiEvent>, max_entries: usize) -> Self {
        Self {
            tx,
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn log(&self, msg: impl Display) {
        self.log_at(UiLogLevel::Info, msg);
    }

    /// Format a timestamped entry, emit it through tracing, buffer it and
    /// broadcast it.
    pub fn log_at(&self, level: UiLogLevel, msg: impl Display) {
        let entry = format!("{} {}", chrono::Utc::now().format("%H:%M:%S"), msg);
        match level {
            UiLogLevel::Info => tracing::info!("{}", entry),
            UiLogLevel::Warn => tracing::warn!("{}", entry),
            UiLogLevel::Error => tracing::error!("{}", entry),
        }
        if let Ok(mut entries) = self.buffer.write() {
            entries.push_back(entry.clone());
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }
        let _ = self.tx.send(NotifierUiEvent::LogEntry { entry });
    }

    pub fn entries(&self) -> Vec<String> {
        self.buffer
            .read()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }
}
