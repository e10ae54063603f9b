//! In-process event bus for server-side updates.
//!
//! Provides a lightweight broadcast channel for UI subscriptions.

use tokio::sync::broadcast;

/// Server event payloads published by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    SessionChanged,
    /// Transient user-facing message (skip notices).
    Notice(String),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    /// Notify subscribers that the session view has changed.
    pub fn session_changed(&self) {
        let _ = self.sender.send(HubEvent::SessionChanged);
    }

    pub fn notice(&self, message: impl Into<String>) {
        let _ = self.sender.send(HubEvent::Notice(message.into()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
