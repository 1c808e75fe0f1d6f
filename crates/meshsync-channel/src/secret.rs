//! Channel secrets: X25519 agreement, BLAKE3 key derivation, and the
//! symmetric cipher sealing wire payloads and persisted content.
//!
//! Public channels encrypt under a "general" secret derived from the
//! channel name and shared key, so only parties that know the channel can
//! read traffic. Private chats use a pairwise secret derived from the
//! station-to-station exchange in [`crate::handshake`].

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::StaticSecret;

use crate::error::{ChannelError, Result};

const GENERAL_CONTEXT: &str = "meshsync v1 channel general secret";
const PAIRWISE_CONTEXT: &str = "meshsync v1 pairwise secret";

const NONCE_LEN: usize = 12;

/// An X25519 public key exchanged during the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexPublic(pub [u8; 32]);

impl KexPublic {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KexPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kex({})", &hex::encode(self.0)[..16])
    }
}

/// An X25519 secret held for the duration of one handshake.
pub struct KexSecret {
    secret: StaticSecret,
}

impl KexSecret {
    /// Generate fresh key agreement material.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(rand::thread_rng()),
        }
    }

    /// The public half to put on the wire.
    pub fn public(&self) -> KexPublic {
        KexPublic(x25519_dalek::PublicKey::from(&self.secret).to_bytes())
    }

    /// Run the Diffie-Hellman agreement against a peer's public half.
    pub fn agree(&self, peer: &KexPublic) -> [u8; 32] {
        let peer_key = x25519_dalek::PublicKey::from(peer.0);
        self.secret.diffie_hellman(&peer_key).to_bytes()
    }
}

impl fmt::Debug for KexSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KexSecret({:?})", self.public())
    }
}

/// A 32-byte symmetric channel secret.
#[derive(Clone)]
pub struct ChannelSecret {
    key: [u8; 32],
}

impl ChannelSecret {
    /// Wrap raw key bytes.
    pub const fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// The general secret shared by every member of a named channel.
    pub fn general(channel_name: &str, shared_key: &[u8]) -> Self {
        let mut material = Vec::with_capacity(channel_name.len() + 1 + shared_key.len());
        material.extend_from_slice(channel_name.as_bytes());
        material.push(0);
        material.extend_from_slice(shared_key);
        Self {
            key: blake3::derive_key(GENERAL_CONTEXT, &material),
        }
    }

    /// The pairwise secret for a completed handshake: derived from the DH
    /// output bound to the handshake transcript.
    pub fn pairwise(dh_output: &[u8; 32], transcript: &[u8]) -> Self {
        let mut material = Vec::with_capacity(32 + transcript.len());
        material.extend_from_slice(dh_output);
        material.extend_from_slice(transcript);
        Self {
            key: blake3::derive_key(PAIRWISE_CONTEXT, &material),
        }
    }

    /// Encrypt and authenticate `plaintext`. Output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ChannelError::EncryptFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(ChannelError::CiphertextTruncated(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::DecryptFailed)
    }
}

impl fmt::Debug for ChannelSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelSecret(..)")
    }
}
