//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! # Obsidion Bridge
//!
//! An end-to-end encrypted, bidirectional message channel between two peers
//! whose only rendezvous is an untrusted WebSocket relay.
//!
//! The Creator opens a bridge and publishes a connection string; the Joiner
//! consumes it, performs a secp256k1 ECDH handshake through the relay, and
//! both sides then exchange AES-256-GCM-sealed JSON messages with
//! compression, chunking, duplicate suppression, and automatic
//! reconnection. The relay never sees plaintext, only opaque
//! `encryptedMessage` envelopes routed by bridge id.
//!
//! ## Quick start
//!
//! ```no_run
//! use obsidion_bridge::{create, join, CreateOptions, JoinOptions};
//!
//! # async fn demo() -> Result<(), obsidion_bridge::BridgeError> {
//! // Peer A publishes a bridge.
//! let creator = create(CreateOptions {
//!     origin: Some("https://my-app.example".to_string()),
//!     ..Default::default()
//! })?;
//! let _handle = creator.on_secure_message(|method, params| {
//!     println!("got {method}: {params}");
//! });
//!
//! // Peer B scans the connection string and joins.
//! let joiner = join(creator.connection_string(), JoinOptions::default())?;
//! joiner.send_message("greeting", serde_json::json!({"text": "hi"})).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`] - ECDH key agreement, AEAD, and nonce derivation
//! - [`wire`] - outer JSON-RPC envelopes and decrypted inner messages
//! - [`codec`] - compression, chunking, and reassembly
//! - [`transport`] - pluggable frame channels (WebSocket, in-memory)
//! - [`session`] - the role-specific state machine
//! - [`connection`] - keepalive, backoff reconnection, and replay
//! - [`bridge`] - the `create` / `join` facade
//!
//! ## Security model
//!
//! Each session must use a fresh key pair: the AEAD nonce is derived
//! deterministically from the bridge id (see [`crypto::nonce_from_bridge_id`])
//! and is only safe under a fresh per-session shared secret. The relay is
//! untrusted for confidentiality and integrity but trusted for availability;
//! replayed or duplicated frames are dropped by id, and Joiners additionally
//! require the relay-attached origin to match the connection string.

use std::time::Duration;

/// The length of the nonce used for AES-GCM encryption (12 bytes).
pub const NONCE_LEN: usize = 12;

/// Bytes of base64 payload carried by each inner chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Hard limit on the serialized size of one outer envelope.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Pacing delay between chunks of a single send.
pub const CHUNK_WAIT: Duration = Duration::from_millis(50);

/// Params below this size need not be compressed; the decoder accepts
/// uncompressed single parts from such senders either way.
pub const COMPRESSION_THRESHOLD: usize = 1024;

pub mod bridge;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;
pub mod uri;
pub mod wire;

pub use bridge::{create, join, Bridge, CreateOptions, JoinOptions};
pub use connection::ConnectionConfig;
pub use crypto::{
    derive_shared_secret, nonce_from_bridge_id, KeyPair, SharedSecret, PUBLIC_KEY_LEN,
    SHARED_SECRET_LEN,
};
pub use error::{
    BridgeError, ConfigurationError, CryptoError, ProtocolError, TransportError,
};
pub use events::{BridgeEvent, Disconnection, EventKind, ListenerHandle};
pub use session::{Role, SessionContext};
pub use transport::{Transport, TransportEvent};
pub use uri::{parse_connection_string, ConnectionString, DEFAULT_BRIDGE_URL};
pub use wire::{ChunkInfo, Envelope, InnerMessage};
