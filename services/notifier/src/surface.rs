//! Visibility of the notification list and its outside-interaction listener.

use serde::{Deserialize, Serialize};

/// Where a document-level interaction landed relative to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionTarget {
    Inside,
    Outside,
}

/// Registry of document-level listeners.
///
/// Listeners are identified by a monotonically increasing handle so a stale
/// detach can never remove a newer listener.
#[derive(Debug, Default)]
pub struct DocumentListeners {
    next_handle: u64,
    attached: Vec<u64>,
}

impl DocumentListeners {
    pub fn attach(&mut self) -> u64 {
        self.next_handle += 1;
        self.attached.push(self.next_handle);
        self.next_handle
    }

    /// Returns false if `handle` was not attached.
    pub fn detach(&mut self, handle: u64) -> bool {
        let before = self.attached.len();
        self.attached.retain(|h| *h != handle);
        self.attached.len() != before
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Surface {
    open: bool,
    listener: Option<u64>,
    listeners: DocumentListeners,
}

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Flip visibility. Returns the new `open` value.
    pub fn toggle(&mut self) -> bool {
        if self.open {
            self.close();
        } else {
            self.open();
        }
        self.open
    }

    /// Returns true if the surface changed.
    pub fn open(&mut self) -> bool {
        if self.open {
            return false;
        }
        self.open = true;
        self.listener = Some(self.listeners.attach());
        true
    }

    /// Returns true if the surface changed.
    pub fn close(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        if let Some(handle) = self.listener.take() {
            self.listeners.detach(handle);
        }
        true
    }

    /// Route a document interaction. Only an outside interaction while open
    /// has any effect. Returns true if the surface closed.
    pub fn interaction(&mut self, target: InteractionTarget) -> bool {
        match target {
            InteractionTarget::Outside if self.listener.is_some() => self.close(),
            _ => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
