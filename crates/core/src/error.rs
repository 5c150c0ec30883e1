//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Unified error hierarchy for the obsidion-bridge workspace.

use thiserror::Error;

/// Top-level unified error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport layer error")]
    Transport(#[from] TransportError),

    #[error("Protocol violation")]
    Protocol(#[from] ProtocolError),

    #[error("Cryptographic operation failed")]
    Crypto(#[from] CryptoError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised synchronously from `create` / `join` for invalid options
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Origin is required when creating a bridge")]
    MissingOrigin,

    #[error("A remote public key is only accepted together with resume")]
    RemoteKeyWithoutResume,

    #[error("Resuming a session requires persisted key material: {0}")]
    MissingResumeKeys(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid bridge URL: {0}")]
    InvalidBridgeUrl(String),
}

/// Errors related to cryptographic operations
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Inflate failed: {0}")]
    InflateFailed(String),
}

/// Violations of the wire protocol by the peer or the relay
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Chunk group {chunk_id} length mismatch: buffer expects {expected}, chunk declares {declared}")]
    ChunkLengthMismatch {
        chunk_id: String,
        expected: u32,
        declared: u32,
    },

    #[error("Chunk index {index} out of range for group {chunk_id} of length {length}")]
    ChunkIndexOutOfRange {
        chunk_id: String,
        index: u32,
        length: u32,
    },

    #[error("Chunk group {chunk_id} declares an unreasonable length of {length}")]
    ChunkGroupTooLarge { chunk_id: String, length: u32 },

    #[error("Handshake greeting did not decrypt to the expected value")]
    InvalidGreeting,

    #[error("Handshake public key differs from the established session key")]
    HandshakeKeyMismatch,

    #[error("Origin mismatch: expected {expected}, received {received}")]
    OriginMismatch { expected: String, received: String },

    #[error("Outgoing envelope of {size} bytes exceeds the {limit} byte payload limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Secure channel not established")]
    SecureChannelNotEstablished,

    #[error("Peer reported an error: {0}")]
    PeerError(String),
}

/// Errors related to transport layer operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
