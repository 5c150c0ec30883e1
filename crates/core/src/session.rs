//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! The per-session state machine: role-specific handshake, duplicate
//! suppression, origin validation, and chunk reassembly.
//!
//! A [`SessionContext`] is mutated only while its owner holds the session
//! lock, and each frame is handled start to finish under that lock. Frame
//! handling never performs IO itself: it returns the envelopes to send and
//! the events to emit, which the connection controller flushes after
//! releasing the lock.

use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use crate::codec::{self, ChunkBuffer};
use crate::crypto::{self, KeyPair, SharedSecret, PUBLIC_KEY_LEN};
use crate::error::{BridgeError, ConfigurationError, ProtocolError};
use crate::events::BridgeEvent;
use crate::uri::{self, NODEJS_ORIGIN};
use crate::wire::{method, Envelope};

/// Which side of the rendezvous this session plays.
///
/// The Creator publishes the connection string and answers handshakes; the
/// Joiner consumes it, precomputes the secret, and validates the origin the
/// relay attaches to every encrypted frame.
#[derive(Debug, Clone)]
pub enum Role {
    Creator { origin: String },
    Joiner { bridge_origin: String },
}

impl Role {
    pub fn is_creator(&self) -> bool {
        matches!(self, Role::Creator { .. })
    }

    /// The value for the transport's `Origin` upgrade header.
    pub fn origin_header(&self) -> &str {
        match self {
            Role::Creator { origin } => origin,
            Role::Joiner { .. } => NODEJS_ORIGIN,
        }
    }
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What one inbound frame produced: wire replies and deferred events.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub replies: Vec<Envelope>,
    pub events: Vec<BridgeEvent>,
}

impl FrameOutcome {
    fn error(&mut self, error: impl std::fmt::Display) {
        self.events.push(BridgeEvent::Error {
            message: error.to_string(),
        });
    }
}

/// The authoritative per-session record.
pub struct SessionContext {
    pub role: Role,
    key_pair: KeyPair,
    remote_public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    shared_secret: Option<SharedSecret>,
    pub bridge_id: String,
    pub secure_channel_established: bool,
    pub resumed_session: bool,
    established_event_emitted: bool,
    seen_message_ids: HashSet<String>,
    incomplete_messages: HashMap<String, ChunkBuffer>,
    pub last_message_timestamp: u64,
    pub valid_messages_received: u64,
}

impl SessionContext {
    /// A fresh Creator session. The bridge id is its own public key.
    pub fn creator(key_pair: KeyPair, origin: String) -> Self {
        let bridge_id = key_pair.public_key_hex();
        Self {
            role: Role::Creator { origin },
            key_pair,
            remote_public_key: None,
            shared_secret: None,
            bridge_id,
            secure_channel_established: false,
            resumed_session: false,
            established_event_emitted: false,
            seen_message_ids: HashSet::new(),
            incomplete_messages: HashMap::new(),
            last_message_timestamp: 0,
            valid_messages_received: 0,
        }
    }

    /// A Creator resuming from persisted key material: the secret is
    /// precomputed and the channel counts as established with no handshake.
    pub fn creator_resumed(
        key_pair: KeyPair,
        origin: String,
        remote_public_key: &[u8],
    ) -> Result<Self, BridgeError> {
        let mut session = Self::creator(key_pair, origin);
        session.install_remote_key(remote_public_key)?;
        session.secure_channel_established = true;
        session.resumed_session = true;
        Ok(session)
    }

    /// A fresh Joiner session against a parsed connection string. The
    /// secret is derived eagerly so the handshake greeting can be built
    /// before the transport ever opens.
    pub fn joiner(
        key_pair: KeyPair,
        bridge_id: String,
        bridge_origin: String,
    ) -> Result<Self, BridgeError> {
        let remote_public_key = hex::decode(&bridge_id).map_err(|e| {
            ConfigurationError::InvalidConnectionString(format!("public key hex: {}", e))
        })?;
        let mut session = Self {
            role: Role::Joiner { bridge_origin },
            key_pair,
            remote_public_key: None,
            shared_secret: None,
            bridge_id,
            secure_channel_established: false,
            resumed_session: false,
            established_event_emitted: false,
            seen_message_ids: HashSet::new(),
            incomplete_messages: HashMap::new(),
            last_message_timestamp: 0,
            valid_messages_received: 0,
        };
        session.install_remote_key(&remote_public_key)?;
        Ok(session)
    }

    /// A Joiner resuming with its persisted key pair: established
    /// immediately, no `moc` handshake on connect.
    pub fn joiner_resumed(
        key_pair: KeyPair,
        bridge_id: String,
        bridge_origin: String,
    ) -> Result<Self, BridgeError> {
        let mut session = Self::joiner(key_pair, bridge_id, bridge_origin)?;
        session.secure_channel_established = true;
        session.resumed_session = true;
        Ok(session)
    }

    /// Derive and store the shared secret for `remote`. The secret is
    /// immutable once set; callers must reject key changes beforehand.
    fn install_remote_key(&mut self, remote: &[u8]) -> Result<(), BridgeError> {
        let secret = crypto::derive_shared_secret(&self.key_pair, remote)?;
        let mut stored = [0u8; PUBLIC_KEY_LEN];
        stored.copy_from_slice(remote);
        self.remote_public_key = Some(stored);
        self.shared_secret = Some(secret);
        Ok(())
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        self.shared_secret.as_ref()
    }

    pub fn remote_public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.remote_public_key.as_ref()
    }

    /// Whether the establishment event still needs to fire (at most once
    /// per session lifecycle, re-fired once by resumption on first open).
    pub fn take_establishment_event(&mut self) -> bool {
        if self.secure_channel_established && !self.established_event_emitted {
            self.established_event_emitted = true;
            return true;
        }
        false
    }

    /// Record an envelope this side sends, so the relay echoing it back is
    /// dropped as a duplicate.
    pub fn register_outbound(&mut self, envelope: &Envelope) {
        if let Some(id) = &envelope.id {
            self.seen_message_ids.insert(id.clone());
        }
    }

    /// Encrypt and register the envelopes for one secure send.
    pub fn encode_outbound(
        &mut self,
        method_name: &str,
        params: &Value,
    ) -> Result<Vec<Envelope>, BridgeError> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or(ProtocolError::SecureChannelNotEstablished)?;
        let envelopes = codec::encode_secure(method_name, params, secret, &self.bridge_id)?;
        for envelope in &envelopes {
            self.register_outbound(envelope);
        }
        Ok(envelopes)
    }

    /// The Joiner's handshake offer, broadcast by the relay on connect.
    pub fn build_handshake_envelope(&mut self) -> Result<Envelope, BridgeError> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or(ProtocolError::SecureChannelNotEstablished)?;
        let greeting = crypto::encrypt(b"hello", secret, &self.bridge_id)?;
        let envelope = Envelope::handshake(&self.key_pair.public_key_hex(), &hex::encode(greeting));
        self.register_outbound(&envelope);
        Ok(envelope)
    }

    /// Drop chunk groups older than `ttl`. Evicted groups can never
    /// spuriously complete later; their remaining parts recreate a buffer
    /// that stays forever short.
    pub fn evict_stale_chunks(&mut self, ttl: Duration) {
        let before = self.incomplete_messages.len();
        self.incomplete_messages.retain(|_, buffer| buffer.age() < ttl);
        let evicted = before - self.incomplete_messages.len();
        if evicted > 0 {
            debug!(evicted, "evicted stale chunk groups");
        }
    }

    /// Zeroize and drop all key material; part of `close()` teardown.
    pub fn destroy_secrets(&mut self) {
        // SharedSecret and the KeyPair scalar zeroize on drop.
        self.shared_secret = None;
        self.remote_public_key = None;
        self.incomplete_messages.clear();
        self.seen_message_ids.clear();
    }

    /// Handle one inbound frame, start to finish, under the session lock.
    pub fn handle_frame(&mut self, raw: &str) -> FrameOutcome {
        let mut out = FrameOutcome::default();
        out.events.push(BridgeEvent::RawMessage {
            frame: raw.to_string(),
        });

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return out;
            }
        };

        // Keepalive control frames bypass id handling entirely.
        match envelope.method.as_str() {
            method::PING => {
                out.replies.push(Envelope::pong());
                return out;
            }
            method::PONG => return out,
            _ => {}
        }

        let id = match envelope.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                trace!(method = %envelope.method, "dropping frame without id");
                return out;
            }
        };
        if !self.seen_message_ids.insert(id) {
            trace!(method = %envelope.method, "dropping duplicate frame");
            return out;
        }
        self.valid_messages_received += 1;
        self.last_message_timestamp = now_ms();

        match envelope.method.as_str() {
            method::HANDSHAKE => self.handle_handshake(&envelope, &mut out),
            method::ENCRYPTED_MESSAGE => self.handle_encrypted(&envelope, &mut out),
            method::ERROR => {
                let message = envelope.params["message"].as_str().unwrap_or("unknown");
                out.error(ProtocolError::PeerError(message.to_string()));
            }
            other => warn!(method = other, "dropping frame with unknown method"),
        }
        out
    }

    /// Creator side of the handshake (§ the Joiner never receives one).
    fn handle_handshake(&mut self, envelope: &Envelope, out: &mut FrameOutcome) {
        if !self.role.is_creator() {
            warn!("joiner received a handshake frame; dropping");
            return;
        }

        let (Some(pubkey_hex), Some(greeting_hex)) = (
            envelope.params["pubkey"].as_str(),
            envelope.params["greeting"].as_str(),
        ) else {
            out.error(ProtocolError::MalformedFrame(
                "handshake missing pubkey or greeting".to_string(),
            ));
            return;
        };

        let remote = match hex::decode(pubkey_hex) {
            Ok(bytes) if bytes.len() == PUBLIC_KEY_LEN => bytes,
            _ => {
                out.error(ProtocolError::MalformedFrame(
                    "handshake pubkey is not a 33-byte hex key".to_string(),
                ));
                return;
            }
        };

        // An established session is bound to its remote key for life.
        if self.secure_channel_established
            && self.remote_public_key.map(|k| k.to_vec()) != Some(remote.clone())
        {
            let error = ProtocolError::HandshakeKeyMismatch;
            let reply = Envelope::error_reply(&error.to_string());
            self.register_outbound(&reply);
            out.replies.push(reply);
            out.error(error);
            return;
        }

        let secret = match crypto::derive_shared_secret(&self.key_pair, &remote) {
            Ok(secret) => secret,
            Err(e) => {
                out.error(e);
                return;
            }
        };

        let greeting = match hex::decode(greeting_hex) {
            Ok(bytes) => bytes,
            Err(_) => {
                out.error(ProtocolError::MalformedFrame(
                    "handshake greeting is not hex".to_string(),
                ));
                return;
            }
        };
        match crypto::decrypt(&greeting, &secret, &self.bridge_id) {
            Ok(plaintext) if plaintext == b"hello" => {}
            Ok(_) => {
                out.error(ProtocolError::InvalidGreeting);
                return;
            }
            Err(e) => {
                out.error(e);
                return;
            }
        }

        if self.shared_secret.is_none() {
            let mut stored = [0u8; PUBLIC_KEY_LEN];
            stored.copy_from_slice(&remote);
            self.remote_public_key = Some(stored);
            self.shared_secret = Some(secret);
        }

        match self.encode_outbound(method::HELLO, &Value::Null) {
            Ok(replies) => out.replies.extend(replies),
            Err(e) => {
                out.error(e);
                return;
            }
        }

        self.secure_channel_established = true;
        if self.take_establishment_event() {
            debug!("secure channel established (creator)");
            out.events.push(BridgeEvent::SecureChannelEstablished);
        }
    }

    fn handle_encrypted(&mut self, envelope: &Envelope, out: &mut FrameOutcome) {
        // The Joiner trusts nothing the relay forwards until the attached
        // origin matches what was scanned out of the connection string.
        if let Role::Joiner { bridge_origin } = &self.role {
            let expected = uri::reduce_origin(bridge_origin);
            let received = uri::reduce_origin(envelope.origin.as_deref().unwrap_or(""));
            if expected != received {
                out.error(ProtocolError::OriginMismatch { expected, received });
                return;
            }
        }

        let Some(secret) = self.shared_secret.clone() else {
            out.error(ProtocolError::SecureChannelNotEstablished);
            return;
        };
        let Some(payload) = envelope.params["payload"].as_str() else {
            out.error(ProtocolError::MalformedFrame(
                "encryptedMessage missing payload".to_string(),
            ));
            return;
        };

        let inner = match codec::decode_secure_payload(payload, &secret, &self.bridge_id) {
            Ok(inner) => inner,
            Err(e) => {
                out.error(e);
                return;
            }
        };

        match &inner.chunk {
            Some(chunk) if chunk.length > 1 => {
                self.accumulate_chunk(chunk.clone(), inner.params, &inner.method, out)
            }
            _ => self.deliver_single(inner.method, inner.params, out),
        }
    }

    fn deliver_single(&mut self, method_name: String, params: Value, out: &mut FrameOutcome) {
        if method_name == method::HELLO {
            self.secure_channel_established = true;
            if self.take_establishment_event() {
                debug!("secure channel established");
                out.events.push(BridgeEvent::SecureChannelEstablished);
            }
            return;
        }

        match codec::decode_single_params(params) {
            Ok(params) => out.events.push(BridgeEvent::SecureMessage {
                method: method_name,
                params,
            }),
            Err(e) => out.error(e),
        }
    }

    fn accumulate_chunk(
        &mut self,
        chunk: crate::wire::ChunkInfo,
        params: Value,
        method_name: &str,
        out: &mut FrameOutcome,
    ) {
        let Value::String(part) = params else {
            out.error(ProtocolError::MalformedFrame(
                "chunk params must be a base64 string slice".to_string(),
            ));
            return;
        };

        let buffer = match self.incomplete_messages.entry(chunk.id.clone()) {
            Entry::Occupied(entry) => {
                if entry.get().expected() != chunk.length {
                    let error = ProtocolError::ChunkLengthMismatch {
                        chunk_id: chunk.id.clone(),
                        expected: entry.get().expected(),
                        declared: chunk.length,
                    };
                    // The whole group is poisoned, not just this part.
                    entry.remove();
                    out.error(error);
                    return;
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => match ChunkBuffer::new(&chunk.id, chunk.length) {
                Ok(buffer) => entry.insert(buffer),
                Err(e) => {
                    out.error(e);
                    return;
                }
            },
        };

        if let Err(e) = buffer.insert(&chunk.id, chunk.index, part) {
            out.error(e);
            return;
        }
        out.events.push(BridgeEvent::ChunkReceived {
            chunk_id: chunk.id.clone(),
            index: chunk.index,
            length: chunk.length,
        });

        if buffer.is_complete() {
            if let Some(buffer) = self.incomplete_messages.remove(&chunk.id) {
                match codec::decode_chunk_blob(&buffer.assemble()) {
                    Ok(decoded) => out.events.push(BridgeEvent::SecureMessage {
                        method: method_name.to_string(),
                        params: decoded,
                    }),
                    Err(e) => out.error(e),
                }
            }
        }
    }
}
