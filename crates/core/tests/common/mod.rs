//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! A miniature in-process relay for integration tests.
//!
//! Mirrors the observable behavior the client depends on: routing frames
//! between peers sharing a bridge id, attaching each sender's declared
//! origin to forwarded frames, broadcasting `moc` handshakes on connect,
//! answering `ping` with `pong`, and resending history on `replay`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use url::Url;

use obsidion_bridge::error::TransportError;
use obsidion_bridge::transport::memory::{Connector, MemoryConnection, MemoryTransport};
use obsidion_bridge::transport::TransportEvent;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Peer {
    id: u64,
    bridge_id: String,
    origin: String,
    to_client: mpsc::Sender<TransportEvent>,
}

struct HistoryEntry {
    timestamp: u64,
    bridge_id: String,
    sender: u64,
    frame: String,
}

#[derive(Default)]
struct State {
    peers: Vec<Peer>,
    history: Vec<HistoryEntry>,
    next_id: u64,
}

/// The hub shared by every [`MemoryTransport`] in one test.
pub struct MemoryRelay {
    state: Arc<Mutex<State>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(State::default())),
        })
    }

    /// A transport that connects through this relay.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        MemoryTransport::new(self.clone() as Arc<dyn Connector>)
    }

    /// Forcibly close the connection of every peer whose declared origin
    /// matches, simulating a relay-side drop.
    pub async fn kick_by_origin(&self, origin: &str) -> usize {
        let mut state = self.state.lock().await;
        let mut kicked = 0;
        let mut remaining = Vec::new();
        for peer in state.peers.drain(..) {
            if peer.origin == origin {
                let _ = peer
                    .to_client
                    .send(TransportEvent::Closed {
                        code: 1012,
                        reason: "service restart".to_string(),
                        was_clean: true,
                    })
                    .await;
                kicked += 1;
            } else {
                remaining.push(peer);
            }
        }
        state.peers = remaining;
        kicked
    }

    /// Re-deliver the most recent forwarded frame verbatim, as a buggy or
    /// malicious relay would.
    pub async fn replay_last(&self, bridge_id: &str) {
        let state = self.state.lock().await;
        let Some(entry) = state
            .history
            .iter()
            .rev()
            .find(|entry| entry.bridge_id == bridge_id)
        else {
            return;
        };
        for peer in &state.peers {
            if peer.bridge_id == bridge_id && peer.id != entry.sender {
                let _ = peer
                    .to_client
                    .send(TransportEvent::Frame(entry.frame.clone()))
                    .await;
            }
        }
    }

    /// Count of currently registered peers (all bridge ids).
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }
}

/// Route one frame from `sender`: answer pings, serve replays, and forward
/// everything else (origin attached) to the other peers on the bridge id.
async fn route(state: &Arc<Mutex<State>>, sender: u64, frame: String) {
    let parsed: Option<Value> = serde_json::from_str(&frame).ok();
    let method = parsed
        .as_ref()
        .and_then(|v| v["method"].as_str())
        .unwrap_or("");

    match method {
        "ping" => {
            let state = state.lock().await;
            if let Some(peer) = state.peers.iter().find(|p| p.id == sender) {
                let pong = r#"{"jsonrpc":"2.0","method":"pong","params":{}}"#.to_string();
                let _ = peer.to_client.send(TransportEvent::Frame(pong)).await;
            }
        }
        "replay" => {
            let since = parsed
                .as_ref()
                .and_then(|v| v["params"]["timestamp"].as_u64())
                .unwrap_or(0);
            let state = state.lock().await;
            let Some(peer) = state.peers.iter().find(|p| p.id == sender) else {
                return;
            };
            for entry in &state.history {
                if entry.bridge_id == peer.bridge_id
                    && entry.sender != sender
                    && entry.timestamp >= since
                {
                    let _ = peer
                        .to_client
                        .send(TransportEvent::Frame(entry.frame.clone()))
                        .await;
                }
            }
        }
        _ => forward(state, sender, &frame, parsed).await,
    }
}

async fn forward(state: &Arc<Mutex<State>>, sender: u64, frame: &str, parsed: Option<Value>) {
    let mut state = state.lock().await;
    let Some(peer) = state.peers.iter().find(|p| p.id == sender) else {
        return;
    };
    let (bridge_id, origin) = (peer.bridge_id.clone(), peer.origin.clone());

    // The relay stamps the sender's declared origin onto the frame.
    let stamped = match parsed {
        Some(mut value) => {
            let nocache = value["nocache"].as_bool().unwrap_or(false);
            value["origin"] = Value::String(origin);
            let stamped = value.to_string();
            if !nocache {
                state.history.push(HistoryEntry {
                    timestamp: now_ms(),
                    bridge_id: bridge_id.clone(),
                    sender,
                    frame: stamped.clone(),
                });
            }
            stamped
        }
        None => frame.to_string(),
    };

    for peer in &state.peers {
        if peer.bridge_id == bridge_id && peer.id != sender {
            let _ = peer
                .to_client
                .send(TransportEvent::Frame(stamped.clone()))
                .await;
        }
    }
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn connect(&self, url: &str, origin: &str) -> Result<MemoryConnection, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::ConnectionFailed(format!("bad url: {}", e)))?;
        let mut bridge_id = None;
        let mut moc = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "id" => bridge_id = Some(value.into_owned()),
                "moc" => moc = Some(value.into_owned()),
                _ => {}
            }
        }
        let bridge_id = bridge_id
            .ok_or_else(|| TransportError::ConnectionFailed("missing id parameter".to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(64);

        let conn_id = {
            let mut state = self.state.lock().await;
            let id = state.next_id;
            state.next_id += 1;
            state.peers.push(Peer {
                id,
                bridge_id,
                origin: origin.to_string(),
                to_client: in_tx,
            });
            id
        };

        // Message-on-connect: broadcast the preloaded handshake frame.
        if let Some(moc) = moc {
            if let Ok(bytes) = BASE64.decode(moc.as_bytes()) {
                if let Ok(frame) = String::from_utf8(bytes) {
                    route(&self.state, conn_id, frame).await;
                }
            }
        }

        let pump_state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                route(&pump_state, conn_id, frame).await;
            }
            let mut state = pump_state.lock().await;
            state.peers.retain(|peer| peer.id != conn_id);
        });

        Ok(MemoryConnection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
