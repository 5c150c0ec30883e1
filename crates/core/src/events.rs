//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Bridge event stream and listener registry.
//!
//! Listeners are keyed by event kind; subscribing returns a
//! [`ListenerHandle`], an unsubscribe capability the caller can invoke or
//! simply drop (dropping it leaves the listener installed). All callbacks
//! for one session fire serialized, in event order, off the session
//! executor.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Everything a bridge reports to its owner.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The transport opened; `reconnection` is false on the first connect.
    Connected { reconnection: bool },
    /// Both peers hold the shared secret and exchanged the hello.
    SecureChannelEstablished,
    /// A fully decrypted (and, when chunked, reassembled) application message.
    SecureMessage { method: String, params: Value },
    /// Every raw frame as received, before any processing.
    RawMessage { frame: String },
    /// One part of a chunk group arrived.
    ChunkReceived {
        chunk_id: String,
        index: u32,
        length: u32,
    },
    /// A non-fatal protocol, crypto, or validation failure.
    Error { message: String },
    /// The transport closed before the first open ever succeeded.
    FailedToConnect { code: u16, reason: String },
    /// The transport closed after a successful open.
    Disconnected(Disconnection),
}

/// Details of a transport closure after a successful open.
#[derive(Debug, Clone)]
pub struct Disconnection {
    pub code: u16,
    pub reason: String,
    pub was_connected: bool,
    pub was_intentional_close: bool,
    pub will_reconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    SecureChannelEstablished,
    SecureMessage,
    RawMessage,
    ChunkReceived,
    Error,
    FailedToConnect,
    Disconnected,
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Connected { .. } => EventKind::Connected,
            BridgeEvent::SecureChannelEstablished => EventKind::SecureChannelEstablished,
            BridgeEvent::SecureMessage { .. } => EventKind::SecureMessage,
            BridgeEvent::RawMessage { .. } => EventKind::RawMessage,
            BridgeEvent::ChunkReceived { .. } => EventKind::ChunkReceived,
            BridgeEvent::Error { .. } => EventKind::Error,
            BridgeEvent::FailedToConnect { .. } => EventKind::FailedToConnect,
            BridgeEvent::Disconnected(_) => EventKind::Disconnected,
        }
    }
}

type Callback = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

/// Per-session listener registry.
pub struct EventListeners {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

impl EventListeners {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for one event kind.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: EventKind,
        callback: impl Fn(&BridgeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        ListenerHandle {
            registry: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// Callbacks run outside the registry lock, so a listener may subscribe
    /// or unsubscribe from within its own callback.
    pub fn emit(&self, event: &BridgeEvent) {
        let snapshot: Vec<Callback> = {
            let listeners = self.listeners.lock().expect("listener registry poisoned");
            listeners
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    /// Drop every listener; part of `close()` teardown.
    pub fn clear(&self) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .clear();
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        if let Some(entries) = listeners.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }
}

impl Default for EventListeners {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe capability returned by `subscribe`.
#[derive(Clone)]
pub struct ListenerHandle {
    registry: Weak<EventListeners>,
    kind: EventKind,
    id: u64,
}

impl ListenerHandle {
    /// Remove the listener this handle was created for.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_receive_matching_kind_only() {
        let registry = Arc::new(EventListeners::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(AtomicUsize::new(0));

        let errors_seen = errors.clone();
        let _h1 = registry.subscribe(EventKind::Error, move |_| {
            errors_seen.fetch_add(1, Ordering::SeqCst);
        });
        let messages_seen = messages.clone();
        let _h2 = registry.subscribe(EventKind::SecureMessage, move |_| {
            messages_seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&BridgeEvent::Error {
            message: "boom".to_string(),
        });
        registry.emit(&BridgeEvent::Error {
            message: "boom again".to_string(),
        });

        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = Arc::new(EventListeners::new());
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let handle = registry.subscribe(EventKind::SecureChannelEstablished, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&BridgeEvent::SecureChannelEstablished);
        handle.unsubscribe();
        registry.emit(&BridgeEvent::SecureChannelEstablished);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_handle_keeps_listener() {
        let registry = Arc::new(EventListeners::new());
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        drop(registry.subscribe(EventKind::RawMessage, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&BridgeEvent::RawMessage {
            frame: "{}".to_string(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_from_within_callback_does_not_deadlock() {
        let registry = Arc::new(EventListeners::new());
        let inner_registry = registry.clone();
        let _h = registry.subscribe(EventKind::Connected, move |_| {
            let _ = inner_registry.subscribe(EventKind::Error, |_| {});
        });
        registry.emit(&BridgeEvent::Connected {
            reconnection: false,
        });
    }

    #[test]
    fn test_clear_removes_all_listeners() {
        let registry = Arc::new(EventListeners::new());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _h = registry.subscribe(EventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.clear();
        registry.emit(&BridgeEvent::Error {
            message: "ignored".to_string(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
