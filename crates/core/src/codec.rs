//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! The secure envelope codec: deflate compression, fixed-size chunking and
//! ordered reassembly, and the AEAD payload wrapping for `encryptedMessage`
//! frames.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::crypto::{self, SharedSecret};
use crate::error::{BridgeError, CryptoError, ProtocolError};
use crate::wire::{ChunkInfo, Envelope, InnerMessage};
use crate::{CHUNK_SIZE, MAX_PAYLOAD_SIZE};

/// Compress with a zlib wrapper, matching what the decoder probes for.
pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(bytes);
    encoder.finish().unwrap_or_default()
}

/// Why an inflate attempt failed.
///
/// `NotZlib` is a *distinct kind*, detected from the 2-byte zlib header
/// before any decompression runs: it routes legacy uncompressed payloads
/// instead of string-matching on a decompressor message. Everything else is
/// corrupt input and fatal.
#[derive(Debug)]
pub enum InflateError {
    NotZlib,
    Corrupt(String),
}

fn has_zlib_header(bytes: &[u8]) -> bool {
    if bytes.len() < 2 {
        return false;
    }
    // CM must be deflate (8) and the CMF/FLG pair a multiple of 31.
    bytes[0] & 0x0f == 8 && (u16::from(bytes[0]) << 8 | u16::from(bytes[1])) % 31 == 0
}

/// Decompress a zlib stream.
pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, InflateError> {
    if !has_zlib_header(bytes) {
        return Err(InflateError::NotZlib);
    }
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| InflateError::Corrupt(e.to_string()))?;
    Ok(out)
}

/// Build the ordered `encryptedMessage` envelopes for one secure send.
///
/// Empty params become a single unchunked inner message. Anything else is
/// JSON-serialized, deflated, base64-encoded, and sliced into
/// [`CHUNK_SIZE`]-byte parts sharing one random chunk id. Every envelope is
/// checked against [`MAX_PAYLOAD_SIZE`] after serialization.
pub fn encode_secure(
    method: &str,
    params: &Value,
    secret: &SharedSecret,
    bridge_id: &str,
) -> Result<Vec<Envelope>, BridgeError> {
    let inners = if params_is_empty(params) {
        vec![InnerMessage::new(method, serde_json::json!({}))]
    } else {
        let blob = BASE64.encode(deflate(serde_json::to_string(params)?.as_bytes()));
        let parts = blob.as_bytes().chunks(CHUNK_SIZE).count();
        let chunk_id = crate::wire::random_id();

        blob.as_bytes()
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(index, slice)| {
                // The blob is base64, so byte boundaries are char boundaries.
                let part = String::from_utf8_lossy(slice).into_owned();
                InnerMessage {
                    method: method.to_string(),
                    params: Value::String(part),
                    chunk: Some(ChunkInfo {
                        id: chunk_id.clone(),
                        index: index as u32,
                        length: parts as u32,
                    }),
                }
            })
            .collect()
    };

    let mut envelopes = Vec::with_capacity(inners.len());
    for inner in &inners {
        let ciphertext = crypto::encrypt(inner.to_json()?.as_bytes(), secret, bridge_id)?;
        let envelope = Envelope::encrypted(BASE64.encode(ciphertext));

        let size = envelope.to_json()?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

fn params_is_empty(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Unwrap and decrypt an `encryptedMessage` payload into its inner message.
pub fn decode_secure_payload(
    payload_base64: &str,
    secret: &SharedSecret,
    bridge_id: &str,
) -> Result<InnerMessage, BridgeError> {
    let ciphertext = BASE64
        .decode(payload_base64)
        .map_err(|e| ProtocolError::MalformedFrame(format!("payload base64: {}", e)))?;
    let plaintext = crypto::decrypt(&ciphertext, secret, bridge_id)?;
    InnerMessage::parse(&plaintext)
        .map_err(|e| ProtocolError::MalformedFrame(format!("inner message: {}", e)).into())
}

/// Decode the params of a single-part (unchunked) inner message.
///
/// String params are normally base64-wrapped deflated JSON. Payloads without
/// a zlib header fall back to the legacy uncompressed path: parsed as JSON
/// when possible, kept as text otherwise. Corrupt zlib data is fatal.
pub fn decode_single_params(params: Value) -> Result<Value, BridgeError> {
    let text = match &params {
        Value::String(s) if !s.is_empty() => s,
        _ => return Ok(params),
    };

    let decoded = match BASE64.decode(text) {
        Ok(bytes) => bytes,
        // Not base64 at all: deliver the string untouched.
        Err(_) => return Ok(params),
    };

    match inflate(&decoded) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| ProtocolError::MalformedFrame(format!("decompressed params: {}", e)).into()),
        Err(InflateError::NotZlib) => match serde_json::from_slice(&decoded) {
            Ok(value) => Ok(value),
            Err(_) => match String::from_utf8(decoded) {
                Ok(s) => Ok(Value::String(s)),
                Err(_) => Ok(params),
            },
        },
        Err(InflateError::Corrupt(e)) => Err(CryptoError::InflateFailed(e).into()),
    }
}

/// Decode a fully reassembled chunk blob back into the message params.
///
/// Unlike the single-part path there is no legacy fallback here: a chunked
/// payload is always base64-wrapped deflated JSON.
pub fn decode_chunk_blob(blob: &str) -> Result<Value, BridgeError> {
    let compressed = BASE64
        .decode(blob)
        .map_err(|e| ProtocolError::MalformedFrame(format!("chunk blob base64: {}", e)))?;
    let raw = match inflate(&compressed) {
        Ok(raw) => raw,
        Err(InflateError::NotZlib) => {
            return Err(CryptoError::InflateFailed("missing zlib header".to_string()).into())
        }
        Err(InflateError::Corrupt(e)) => return Err(CryptoError::InflateFailed(e).into()),
    };
    serde_json::from_slice(&raw)
        .map_err(|e| ProtocolError::MalformedFrame(format!("reassembled params: {}", e)).into())
}

/// Upper bound on chunks per group; a declared length beyond this is a
/// protocol violation, not an allocation request.
pub const MAX_CHUNK_GROUP: u32 = 4096;

/// Reassembly state for one chunk group.
///
/// Created on the first chunk carrying a given id, sized once from that
/// chunk's declared length, and torn down on completion or TTL eviction.
#[derive(Debug)]
pub struct ChunkBuffer {
    slots: Vec<Option<String>>,
    filled: usize,
    created_at: Instant,
}

impl ChunkBuffer {
    pub fn new(chunk_id: &str, length: u32) -> Result<Self, ProtocolError> {
        if length == 0 || length > MAX_CHUNK_GROUP {
            return Err(ProtocolError::ChunkGroupTooLarge {
                chunk_id: chunk_id.to_string(),
                length,
            });
        }
        Ok(Self {
            slots: vec![None; length as usize],
            filled: 0,
            created_at: Instant::now(),
        })
    }

    /// The group length this buffer was sized to.
    pub fn expected(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Place one part. A repeated index overwrites without double-counting.
    pub fn insert(&mut self, chunk_id: &str, index: u32, part: String) -> Result<(), ProtocolError> {
        let length = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| ProtocolError::ChunkIndexOutOfRange {
                chunk_id: chunk_id.to_string(),
                index,
                length,
            })?;
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(part);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// Concatenate all parts in index order. Only valid once complete.
    pub fn assemble(self) -> String {
        self.slots.into_iter().flatten().collect()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
