//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Transport abstraction for the bridge.
//!
//! A transport is a reconnectable duplex text-frame channel. The connection
//! controller re-opens the same instance across reconnect attempts with a
//! freshly built URL; implementations carry no session state of their own.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod memory;
pub mod websocket;

/// What the read side of a transport can yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame.
    Frame(String),
    /// The channel closed; `was_clean` when the peer sent a proper close.
    Closed {
        code: u16,
        reason: String,
        was_clean: bool,
    },
}

/// Close code for an abnormal, unnegotiated termination.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Generic duplex frame channel to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel. `origin` is declared to the relay in whatever
    /// way the transport supports (the `Origin` upgrade header for
    /// WebSockets).
    async fn open(&mut self, url: &str, origin: &str) -> Result<(), TransportError>;

    /// Send one text frame.
    async fn send_frame(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Wait for the next frame or channel closure. Transport-level failures
    /// surface as an abnormal [`TransportEvent::Closed`], not as `Err`, so
    /// the caller has a single reconnect path.
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Close the channel gracefully.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}
