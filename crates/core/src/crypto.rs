//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Cryptographic primitives for the bridge: secp256k1 ECDH, AES-256-GCM,
//! and the deterministic per-session nonce derivation.
//!
//! ## Nonce derivation
//!
//! The AEAD nonce is `SHA-256(bridge_id)[..12]`, deterministic for the whole
//! session. This is safe only because every session derives a fresh shared
//! secret from fresh ECDH keys, and message uniqueness is enforced by the
//! JSON-RPC id dedup layer rather than by nonce rotation. Reusing the same
//! key pair *and* bridge id across sessions voids the AEAD security
//! guarantees; callers must generate fresh keys per session.

use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::NONCE_LEN;

/// Length of a compressed SEC1 secp256k1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of the derived shared secret (AES-256-GCM key).
pub const SHARED_SECRET_LEN: usize = 32;

/// A secp256k1 key pair identifying one side of a session.
///
/// The public key is always handled in its 33-byte compressed encoding.
/// The secret half zeroizes on drop and is redacted in `Debug` output;
/// it is exposed only through [`KeyPair::secret_key_bytes`] so callers can
/// persist it for session resumption.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Reconstruct a key pair from a persisted 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("secret key: {}", e)))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// The 33-byte compressed public key.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let encoded = self.public.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    /// Hex encoding of the compressed public key (the Creator's bridge id).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// The raw secret scalar, for resumption persistence only.
    ///
    /// The returned buffer zeroizes on drop; callers must not copy it into
    /// non-zeroizing storage they do not control.
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; SHARED_SECRET_LEN]> {
        let field_bytes = self.secret.to_bytes();
        let mut out = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
        out.copy_from_slice(field_bytes.as_slice());
        out
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The 32-byte session secret derived via ECDH, used as the AES-256-GCM key.
///
/// Redacted in `Debug` output and zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Derive the session secret from our secret scalar and the peer's
/// compressed public key.
///
/// The result is the first 32 bytes of the *compressed SEC1 encoding* of the
/// ECDH point, the leading parity byte included. This matches the wire
/// expectation bit-exactly and must not be replaced with the bare
/// x-coordinate.
pub fn derive_shared_secret(
    key_pair: &KeyPair,
    remote_public_key: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let remote = PublicKey::from_sec1_bytes(remote_public_key)
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("remote public key: {}", e)))?;

    let shared_point = (remote.to_projective() * *key_pair.secret.to_nonzero_scalar()).to_affine();
    let encoded = shared_point.to_encoded_point(true);
    if encoded.as_bytes().len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::KeyExchangeFailed(
            "ECDH produced the point at infinity".to_string(),
        ));
    }

    let mut secret = [0u8; SHARED_SECRET_LEN];
    secret.copy_from_slice(&encoded.as_bytes()[..SHARED_SECRET_LEN]);
    Ok(SharedSecret(secret))
}

/// Derive the session-scoped AEAD nonce from the bridge id.
pub fn nonce_from_bridge_id(bridge_id: &str) -> [u8; NONCE_LEN] {
    let digest = Sha256::digest(bridge_id.as_bytes());
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

/// Encrypt plaintext under the session secret with the bridge-id nonce.
pub fn encrypt(
    plaintext: &[u8],
    secret: &SharedSecret,
    bridge_id: &str,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret.as_bytes()));
    let nonce = nonce_from_bridge_id(bridge_id);

    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("AES-256-GCM: {}", e)))
}

/// Decrypt ciphertext under the session secret with the bridge-id nonce.
///
/// Fails on any tag mismatch (truncated, reordered, or forged input).
pub fn decrypt(
    ciphertext: &[u8],
    secret: &SharedSecret,
    bridge_id: &str,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret.as_bytes()));
    let nonce = nonce_from_bridge_id(bridge_id);

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("AES-256-GCM: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_compressed() {
        let kp = KeyPair::generate();
        let public = kp.public_key_bytes();
        assert_eq!(public.len(), PUBLIC_KEY_LEN);
        assert!(public[0] == 0x02 || public[0] == 0x03);
    }

    #[test]
    fn test_key_pair_round_trips_through_secret_bytes() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(kp.secret_key_bytes().as_slice()).unwrap();
        assert_eq!(kp.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        let ab = derive_shared_secret(&a, &b.public_key_bytes()).unwrap();
        let ba = derive_shared_secret(&b, &a.public_key_bytes()).unwrap();

        assert_eq!(ab, ba, "both sides must derive the identical secret");
        assert_eq!(ab.as_bytes().len(), SHARED_SECRET_LEN);
    }

    #[test]
    fn test_ecdh_secret_carries_parity_prefix() {
        // The secret is the truncated compressed point, so it begins with
        // the SEC1 parity byte rather than a raw x-coordinate byte.
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let secret = derive_shared_secret(&a, &b.public_key_bytes()).unwrap();
        let first = secret.as_bytes()[0];
        assert!(first == 0x02 || first == 0x03);
    }

    #[test]
    fn test_rejects_malformed_remote_key() {
        let kp = KeyPair::generate();
        assert!(derive_shared_secret(&kp, &[0u8; 33]).is_err());
        assert!(derive_shared_secret(&kp, b"not a key").is_err());
    }

    #[test]
    fn test_nonce_is_deterministic_and_distinct() {
        let n1 = nonce_from_bridge_id("bridge-a");
        let n2 = nonce_from_bridge_id("bridge-a");
        let n3 = nonce_from_bridge_id("bridge-b");
        assert_eq!(n1, n2);
        assert_ne!(n1, n3);
        assert_eq!(n1.len(), NONCE_LEN);
    }

    #[test]
    fn test_aead_round_trip() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let secret = derive_shared_secret(&a, &b.public_key_bytes()).unwrap();

        let plaintext = b"hello";
        let ciphertext = encrypt(plaintext, &secret, "some-bridge-id").unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let decrypted = decrypt(&ciphertext, &secret, "some-bridge-id").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aead_rejects_wrong_key_or_nonce() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let c = KeyPair::generate();
        let good = derive_shared_secret(&a, &b.public_key_bytes()).unwrap();
        let wrong = derive_shared_secret(&a, &c.public_key_bytes()).unwrap();

        let ciphertext = encrypt(b"payload", &good, "bridge").unwrap();
        assert!(decrypt(&ciphertext, &wrong, "bridge").is_err());
        assert!(decrypt(&ciphertext, &good, "other-bridge").is_err());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let secret = derive_shared_secret(&kp, &other.public_key_bytes()).unwrap();

        let kp_debug = format!("{:?}", kp);
        assert!(kp_debug.contains("[REDACTED]"));
        assert!(!kp_debug.contains(&hex::encode(kp.secret_key_bytes().as_slice())));

        let secret_debug = format!("{:?}", secret);
        assert!(secret_debug.contains("[REDACTED]"));
    }
}
