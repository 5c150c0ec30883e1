//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! The public facade: [`create`] and [`join`] entry points and the
//! [`Bridge`] handle they return.
//!
//! Both constructors validate options synchronously and spawn the
//! connection controller on the ambient tokio runtime. All configuration
//! failures surface as [`ConfigurationError`]; everything that happens
//! after connect is delivered through the event subscriptions.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{self, Command, ConnectionConfig, ConnectionState, CLOSE_BY_USER};
use crate::crypto::{KeyPair, PUBLIC_KEY_LEN};
use crate::error::{BridgeError, ConfigurationError};
use crate::events::{
    BridgeEvent, Disconnection, EventKind, EventListeners, ListenerHandle,
};
use crate::session::SessionContext;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::Transport;
use crate::uri;
use crate::CHUNK_WAIT;

/// Options for [`create`] (the Creator side).
pub struct CreateOptions {
    /// Key pair to identify this session; generated when absent.
    pub key_pair: Option<KeyPair>,
    /// The origin this peer declares to the relay. Required: native clients
    /// have no browser location to derive it from.
    pub origin: Option<String>,
    /// The peer's public key, accepted only together with `resume`.
    pub remote_public_key: Option<Vec<u8>>,
    /// Reconstruct an established session from persisted key material.
    pub resume: bool,
    /// Open the transport immediately (default). `resume` always connects.
    pub autoconnect: bool,
    pub connection: ConnectionConfig,
    /// Transport to use; defaults to the WebSocket client.
    pub transport: Option<Box<dyn Transport>>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            origin: None,
            remote_public_key: None,
            resume: false,
            autoconnect: true,
            connection: ConnectionConfig::default(),
            transport: None,
        }
    }
}

/// Options for [`join`] (the Joiner side). Joiners always connect.
pub struct JoinOptions {
    /// Key pair for this session; generated when absent. Required with
    /// `resume`, since the secret must match the original session.
    pub key_pair: Option<KeyPair>,
    /// Reconstruct an established session; skips the handshake.
    pub resume: bool,
    pub connection: ConnectionConfig,
    /// Transport to use; defaults to the WebSocket client.
    pub transport: Option<Box<dyn Transport>>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            resume: false,
            connection: ConnectionConfig::default(),
            transport: None,
        }
    }
}

/// Open a bridge as the Creator and publish a connection string.
pub fn create(options: CreateOptions) -> Result<Bridge, BridgeError> {
    if options.remote_public_key.is_some() && !options.resume {
        return Err(ConfigurationError::RemoteKeyWithoutResume.into());
    }
    if options.resume && (options.key_pair.is_none() || options.remote_public_key.is_none()) {
        return Err(ConfigurationError::MissingResumeKeys(
            "creator resume needs key_pair and remote_public_key".to_string(),
        )
        .into());
    }
    let origin = options.origin.ok_or(ConfigurationError::MissingOrigin)?;
    let key_pair = options.key_pair.unwrap_or_else(KeyPair::generate);

    let session = match options.remote_public_key {
        Some(remote) => {
            if remote.len() != PUBLIC_KEY_LEN {
                return Err(ConfigurationError::InvalidKeyMaterial(format!(
                    "remote public key must be {} bytes, got {}",
                    PUBLIC_KEY_LEN,
                    remote.len()
                ))
                .into());
            }
            SessionContext::creator_resumed(key_pair, origin.clone(), &remote)?
        }
        None => SessionContext::creator(key_pair, origin.clone()),
    };

    let connection_string = uri::format_connection_string(&session.bridge_id, &origin);
    let autoconnect = options.autoconnect || options.resume;
    let bridge = Bridge::new(
        session,
        connection_string,
        options.connection,
        options.transport,
    );
    if autoconnect {
        bridge.connect();
    }
    Ok(bridge)
}

/// Join a bridge published by a Creator's connection string.
pub fn join(uri_str: &str, options: JoinOptions) -> Result<Bridge, BridgeError> {
    let parsed = uri::parse_connection_string(uri_str)?;
    if options.resume && options.key_pair.is_none() {
        return Err(ConfigurationError::MissingResumeKeys(
            "joiner resume needs the original key_pair".to_string(),
        )
        .into());
    }
    let key_pair = options.key_pair.unwrap_or_else(KeyPair::generate);

    let session = if options.resume {
        SessionContext::joiner_resumed(key_pair, parsed.bridge_id, parsed.origin.clone())?
    } else {
        SessionContext::joiner(key_pair, parsed.bridge_id, parsed.origin.clone())?
    };

    let connection_string =
        uri::format_connection_string(&session.bridge_id, &parsed.origin);
    let bridge = Bridge::new(
        session,
        connection_string,
        options.connection,
        options.transport,
    );
    bridge.connect();
    Ok(bridge)
}

/// What `connect()` consumes: the command receiver and the transport.
type Pending = (mpsc::Receiver<Command>, Box<dyn Transport>);

/// A live bridge session handle.
///
/// Cloneable via `Arc` by the caller if needed; all methods take `&self`.
pub struct Bridge {
    session: Arc<Mutex<SessionContext>>,
    events: Arc<EventListeners>,
    state: Arc<ConnectionState>,
    commands: mpsc::Sender<Command>,
    pending: StdMutex<Option<Pending>>,
    task: StdMutex<Option<JoinHandle<()>>>,
    config: ConnectionConfig,
    connection_string: String,
    public_key: [u8; PUBLIC_KEY_LEN],
    key_pair: KeyPair,
}

impl Bridge {
    fn new(
        session: SessionContext,
        connection_string: String,
        config: ConnectionConfig,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let key_pair = session.key_pair().clone();
        let public_key = key_pair.public_key_bytes();
        let (commands, commands_rx) = mpsc::channel(64);
        let transport = transport.unwrap_or_else(|| Box::new(WebSocketTransport::new()));
        Self {
            session: Arc::new(Mutex::new(session)),
            events: Arc::new(EventListeners::new()),
            state: Arc::new(ConnectionState::default()),
            commands,
            pending: StdMutex::new(Some((commands_rx, transport))),
            task: StdMutex::new(None),
            config,
            connection_string,
            public_key,
            key_pair,
        }
    }

    /// Spawn the connection controller. A no-op when already started.
    pub fn connect(&self) {
        let Some((commands_rx, transport)) = self
            .pending
            .lock()
            .expect("pending connection poisoned")
            .take()
        else {
            return;
        };
        let task = tokio::spawn(connection::run(
            transport,
            self.session.clone(),
            self.events.clone(),
            self.state.clone(),
            commands_rx,
            self.config.clone(),
        ));
        *self.task.lock().expect("task handle poisoned") = Some(task);
    }

    /// Encrypt, chunk, and send one application message.
    ///
    /// Returns false on any send-time failure: not connected, channel not
    /// established, payload over the wire limit, or controller shutdown.
    pub async fn send_message(&self, method: &str, params: Value) -> bool {
        if !self.state.connected.load(Ordering::SeqCst) {
            return false;
        }

        let frames = {
            let mut ctx = self.session.lock().await;
            if !ctx.secure_channel_established {
                return false;
            }
            match ctx.encode_outbound(method, &params) {
                Ok(envelopes) => {
                    let mut frames = Vec::with_capacity(envelopes.len());
                    for envelope in &envelopes {
                        match envelope.to_json() {
                            Ok(json) => frames.push(json),
                            Err(_) => return false,
                        }
                    }
                    frames
                }
                Err(e) => {
                    drop(ctx);
                    self.events.emit(&BridgeEvent::Error {
                        message: e.to_string(),
                    });
                    return false;
                }
            }
        };

        for (index, frame) in frames.iter().enumerate() {
            // Pace chunk groups so the relay is not flooded.
            if index > 0 {
                tokio::time::sleep(CHUNK_WAIT).await;
            }
            if self
                .commands
                .send(Command::Frame(frame.clone()))
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Close the bridge and release every resource: transport, timers,
    /// listeners, and key material.
    pub async fn close(&self) {
        self.state.intentional_close.store(true, Ordering::SeqCst);
        let (code, reason) = CLOSE_BY_USER;
        let _ = self
            .commands
            .send(Command::Close {
                code,
                reason: reason.to_string(),
            })
            .await;

        let task = self.task.lock().expect("task handle poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        {
            let mut ctx = self.session.lock().await;
            ctx.destroy_secrets();
        }
        self.events.clear();
        debug!("bridge closed");
    }

    pub fn is_bridge_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub async fn is_secure_channel_established(&self) -> bool {
        self.session.lock().await.secure_channel_established
    }

    /// The connection string a Joiner needs (QR-encoded in real deployments).
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn get_public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public_key
    }

    pub async fn get_remote_public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.session.lock().await.remote_public_key().copied()
    }

    /// This session's key pair, for resumption persistence.
    pub fn get_key_pair(&self) -> KeyPair {
        self.key_pair.clone()
    }

    // ── Event subscriptions ──────────────────────────────────────────────

    pub fn on_connect(&self, f: impl Fn(bool) + Send + Sync + 'static) -> ListenerHandle {
        self.events.subscribe(EventKind::Connected, move |event| {
            if let BridgeEvent::Connected { reconnection } = event {
                f(*reconnection);
            }
        })
    }

    pub fn on_secure_channel_established(
        &self,
        f: impl Fn() + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events
            .subscribe(EventKind::SecureChannelEstablished, move |_| f())
    }

    pub fn on_secure_message(
        &self,
        f: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.subscribe(EventKind::SecureMessage, move |event| {
            if let BridgeEvent::SecureMessage { method, params } = event {
                f(method, params);
            }
        })
    }

    pub fn on_raw_message(&self, f: impl Fn(&str) + Send + Sync + 'static) -> ListenerHandle {
        self.events.subscribe(EventKind::RawMessage, move |event| {
            if let BridgeEvent::RawMessage { frame } = event {
                f(frame);
            }
        })
    }

    pub fn on_chunk_received(
        &self,
        f: impl Fn(&str, u32, u32) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.subscribe(EventKind::ChunkReceived, move |event| {
            if let BridgeEvent::ChunkReceived {
                chunk_id,
                index,
                length,
            } = event
            {
                f(chunk_id, *index, *length);
            }
        })
    }

    pub fn on_error(&self, f: impl Fn(&str) + Send + Sync + 'static) -> ListenerHandle {
        self.events.subscribe(EventKind::Error, move |event| {
            if let BridgeEvent::Error { message } = event {
                f(message);
            }
        })
    }

    pub fn on_failed_to_connect(
        &self,
        f: impl Fn(u16, &str) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events
            .subscribe(EventKind::FailedToConnect, move |event| {
                if let BridgeEvent::FailedToConnect { code, reason } = event {
                    f(*code, reason);
                }
            })
    }

    pub fn on_disconnect(
        &self,
        f: impl Fn(&Disconnection) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.subscribe(EventKind::Disconnected, move |event| {
            if let BridgeEvent::Disconnected(details) = event {
                f(details);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_origin() {
        let result = create(CreateOptions::default());
        assert!(matches!(
            result,
            Err(BridgeError::Configuration(ConfigurationError::MissingOrigin))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_remote_key_without_resume() {
        let result = create(CreateOptions {
            origin: Some("https://localhost".to_string()),
            remote_public_key: Some(vec![2u8; 33]),
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(BridgeError::Configuration(
                ConfigurationError::RemoteKeyWithoutResume
            ))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_resume_without_keys() {
        let result = create(CreateOptions {
            origin: Some("https://localhost".to_string()),
            resume: true,
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(BridgeError::Configuration(
                ConfigurationError::MissingResumeKeys(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_connection_string_shape() {
        let key_pair = KeyPair::generate();
        let expected_prefix = format!("obsidion:{}", key_pair.public_key_hex());
        let bridge = create(CreateOptions {
            key_pair: Some(key_pair),
            origin: Some("https://localhost".to_string()),
            autoconnect: false,
            ..Default::default()
        })
        .unwrap();

        let uri = bridge.connection_string();
        assert!(uri.starts_with(&expected_prefix));
        assert!(uri.contains("d=https://localhost"));
    }

    #[tokio::test]
    async fn test_join_rejects_malformed_uri() {
        let result = join("obsidion:?d=https://x.com", JoinOptions::default());
        assert!(matches!(
            result,
            Err(BridgeError::Configuration(
                ConfigurationError::InvalidConnectionString(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_join_rejects_resume_without_key_pair() {
        let creator_keys = KeyPair::generate();
        let uri = uri::format_connection_string(&creator_keys.public_key_hex(), "https://x.com");
        let result = join(
            &uri,
            JoinOptions {
                resume: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(BridgeError::Configuration(
                ConfigurationError::MissingResumeKeys(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_send_message_fails_when_not_connected() {
        let bridge = create(CreateOptions {
            origin: Some("https://localhost".to_string()),
            autoconnect: false,
            ..Default::default()
        })
        .unwrap();
        assert!(!bridge.send_message("noop", serde_json::json!({})).await);
    }
}
