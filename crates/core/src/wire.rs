//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! JSON-RPC 2.0 wire frames.
//!
//! Two layers travel the relay: the outer [`Envelope`] (visible to the relay,
//! which may attach an `origin`) and the [`InnerMessage`] carried encrypted
//! inside `encryptedMessage` payloads.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version tag on every outer frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outer frame method names.
pub mod method {
    pub const ENCRYPTED_MESSAGE: &str = "encryptedMessage";
    pub const HANDSHAKE: &str = "handshake";
    pub const HELLO: &str = "hello";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const REPLAY: &str = "replay";
    pub const ERROR: &str = "error";
}

/// A fresh 16-byte hex message id from the OS CSPRNG.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The outer JSON-RPC envelope, as seen by the relay.
///
/// Control frames (`ping`, `pong`) carry no id and are exempt from duplicate
/// suppression; everything else gets a random id. `origin` is attached by the
/// relay on forwarded frames and is never set by the sending peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nocache: Option<bool>,
}

impl Envelope {
    /// An addressed frame with a fresh random id.
    pub fn request(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(random_id()),
            method: method.to_string(),
            params,
            origin: None,
            nocache: None,
        }
    }

    /// An id-less control frame (out-of-band, never deduplicated).
    pub fn control(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
            origin: None,
            nocache: None,
        }
    }

    pub fn ping() -> Self {
        Self::control(method::PING, serde_json::json!({}))
    }

    /// Keepalive reply; `nocache` tells the relay not to store it for replay.
    pub fn pong() -> Self {
        let mut envelope = Self::control(method::PONG, serde_json::json!({}));
        envelope.nocache = Some(true);
        envelope
    }

    /// An `encryptedMessage` frame wrapping a base64 AEAD ciphertext.
    pub fn encrypted(payload_base64: String) -> Self {
        Self::request(
            method::ENCRYPTED_MESSAGE,
            serde_json::json!({ "payload": payload_base64 }),
        )
    }

    /// The Joiner's handshake offer: compressed public key and encrypted
    /// greeting, both hex.
    pub fn handshake(pubkey_hex: &str, greeting_hex: &str) -> Self {
        Self::request(
            method::HANDSHAKE,
            serde_json::json!({ "pubkey": pubkey_hex, "greeting": greeting_hex }),
        )
    }

    /// Ask the relay to resend frames at or after `timestamp` (ms since epoch).
    pub fn replay(timestamp: u64) -> Self {
        Self::request(method::REPLAY, serde_json::json!({ "timestamp": timestamp }))
    }

    /// An on-wire error reply, e.g. for a rejected handshake.
    pub fn error_reply(message: &str) -> Self {
        Self::request(method::ERROR, serde_json::json!({ "message": message }))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// Chunking metadata on a multi-part inner message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub id: String,
    pub index: u32,
    pub length: u32,
}

/// The decrypted application message.
///
/// When `chunk` is present with `length > 1`, `params` holds one base64
/// slice of the deflated full payload; reassembly is keyed by `chunk.id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InnerMessage {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

impl InnerMessage {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
            chunk: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(plaintext: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_hex_and_unique() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_envelope_serializes_without_optional_fields() {
        let envelope = Envelope::request("encryptedMessage", serde_json::json!({"payload": "AA=="}));
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\""));
        assert!(!json.contains("origin"));
        assert!(!json.contains("nocache"));
    }

    #[test]
    fn test_pong_is_idless_and_nocache() {
        let pong = Envelope::pong();
        assert!(pong.id.is_none());
        assert_eq!(pong.nocache, Some(true));
        let json = pong.to_json().unwrap();
        assert!(!json.contains("\"id\""));
        assert!(json.contains("\"nocache\":true"));
    }

    #[test]
    fn test_parses_relay_frame_with_origin() {
        let frame = r#"{"jsonrpc":"2.0","id":"ab12","method":"encryptedMessage","params":{"payload":"enc"},"origin":"https://creator.example"}"#;
        let envelope = Envelope::parse(frame).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("ab12"));
        assert_eq!(envelope.method, "encryptedMessage");
        assert_eq!(envelope.origin.as_deref(), Some("https://creator.example"));
    }

    #[test]
    fn test_parses_frame_without_id_or_params() {
        let envelope = Envelope::parse(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(envelope.id.is_none());
        assert!(envelope.params.is_null());
    }

    #[test]
    fn test_inner_message_round_trip_with_chunk() {
        let inner = InnerMessage {
            method: "transfer".to_string(),
            params: Value::String("c2xpY2U=".to_string()),
            chunk: Some(ChunkInfo {
                id: "deadbeef".to_string(),
                index: 2,
                length: 5,
            }),
        };
        let parsed = InnerMessage::parse(inner.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed, inner);
    }

    #[test]
    fn test_single_part_inner_omits_chunk() {
        let inner = InnerMessage::new("hello", Value::Null);
        let json = inner.to_json().unwrap();
        assert!(!json.contains("chunk"));
    }
}
