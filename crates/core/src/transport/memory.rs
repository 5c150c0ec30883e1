//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! In-process transport for tests and embedders.
//!
//! A [`MemoryTransport`] delegates each `open` to an injected [`Connector`],
//! which hands back a pair of channels. The connector plays the relay: it
//! sees the connect URL (including `id` and `moc` query parameters) and the
//! declared origin, exactly like the WebSocket server side would.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent, CLOSE_ABNORMAL};
use crate::error::TransportError;

/// One established in-memory channel: frames out, events in.
pub struct MemoryConnection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// The accepting side of [`MemoryTransport`]; implemented by test relays.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, origin: &str)
        -> Result<MemoryConnection, TransportError>;
}

/// Transport that connects through an in-process [`Connector`].
pub struct MemoryTransport {
    connector: Arc<dyn Connector>,
    connection: Option<MemoryConnection>,
}

impl MemoryTransport {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, url: &str, origin: &str) -> Result<(), TransportError> {
        self.connection = Some(self.connector.connect(url, origin).await?);
        Ok(())
    }

    async fn send_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotOpen)?;
        connection
            .outgoing
            .send(frame.to_string())
            .await
            .map_err(|_| TransportError::SendFailed("peer hung up".to_string()))
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotOpen)?;
        match connection.incoming.recv().await {
            Some(event) => {
                if matches!(event, TransportEvent::Closed { .. }) {
                    self.connection = None;
                }
                Ok(event)
            }
            None => {
                self.connection = None;
                Ok(TransportEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection reset".to_string(),
                    was_clean: false,
                })
            }
        }
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        // Dropping the channel pair is the in-memory close signal.
        self.connection = None;
        Ok(())
    }
}
