//! Channel keys derived from shared passwords.
//!
//! Every member of a channel derives the same AES-256 key from the
//! channel password with Argon2id. The salt is fixed per channel name so
//! independent nodes agree on the key without any exchange.
//!
//! A shared key alone would let any member impersonate any peer id, so
//! channel plaintexts are signed before sealing: the sealed body is
//! `content || verifying_key(32) || signature(64)`. The verifying key
//! travels with the message because multi-hop senders may never have been
//! discovered directly; it cannot be forged for someone else's id since
//! the peer id is a hash of the verifying key.

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use whisper_wire::PeerId;

use crate::aead::{self, NonceGenerator};
use crate::error::CryptoError;
use crate::keys::{
    peer_id_from_verifying_key, verify_signature, Identity, SymmetricKey, SIGNATURE_SIZE,
};

/// Argon2id memory cost in KiB
const ARGON2_MEMORY_KIB: u32 = 65536;
/// Argon2id iteration count
const ARGON2_ITERATIONS: u32 = 3;
/// Argon2id lane count
const ARGON2_LANES: u32 = 4;

/// Maximum derived keys kept in the cache
const MAX_CACHED_KEYS: usize = 32;

const CHANNEL_AAD_TAG: &[u8] = b"whisper/channel/v1";

const KEY_SIZE: usize = 32;
const TRAILER_SIZE: usize = KEY_SIZE + SIGNATURE_SIZE;

/// Derive the AES-256 key for a channel from its password.
///
/// Deliberately slow; results should be cached per (channel, password).
pub fn derive_channel_key(channel: &str, password: &str) -> Result<SymmetricKey, CryptoError> {
    let digest = Sha256::digest(channel.as_bytes());
    let salt = &digest[..16];

    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_LANES, Some(32))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(SymmetricKey::from_bytes(key))
}

fn channel_aad(channel: &str, sender: PeerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CHANNEL_AAD_TAG.len() + channel.len() + 4);
    aad.extend_from_slice(CHANNEL_AAD_TAG);
    aad.extend_from_slice(channel.as_bytes());
    aad.extend_from_slice(sender.as_bytes());
    aad
}

/// Volatile cache of derived channel keys.
///
/// Keys live only in memory; joining a channel after restart reruns the
/// derivation. Bounded with least-recently-derived eviction.
pub struct ChannelKeyring {
    keys: HashMap<String, SymmetricKey>,
    order: VecDeque<String>,
    nonces: NonceGenerator,
}

impl ChannelKeyring {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            nonces: NonceGenerator::new(),
        }
    }

    /// Derive and cache the key for a channel (join)
    pub fn join(&mut self, channel: &str, password: &str) -> Result<(), CryptoError> {
        let key = derive_channel_key(channel, password)?;
        if self.keys.insert(channel.to_string(), key).is_none() {
            self.order.push_back(channel.to_string());
            if self.order.len() > MAX_CACHED_KEYS {
                if let Some(evicted) = self.order.pop_front() {
                    self.keys.remove(&evicted);
                    debug!(channel = %evicted, "evicted channel key");
                }
            }
        }
        Ok(())
    }

    /// Drop a channel's key (leave)
    pub fn leave(&mut self, channel: &str) {
        self.keys.remove(channel);
        self.order.retain(|name| name != channel);
    }

    /// Whether a key is cached for the channel
    pub fn is_member(&self, channel: &str) -> bool {
        self.keys.contains_key(channel)
    }

    /// Drop every cached key
    pub fn wipe(&mut self) {
        self.keys.clear();
        self.order.clear();
        debug!("channel keyring wiped");
    }

    /// Sign and seal a channel message body from `identity`.
    pub fn seal(
        &self,
        channel: &str,
        identity: &Identity,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sender = identity.peer_id();
        let key = self
            .keys
            .get(channel)
            .ok_or(CryptoError::SessionNotFound(sender))?;

        let mut signed = Vec::with_capacity(plaintext.len() + TRAILER_SIZE);
        signed.extend_from_slice(plaintext);
        signed.extend_from_slice(&identity.verifying_key());
        signed.extend_from_slice(&identity.sign(plaintext));

        aead::seal(key, &self.nonces, &signed, &channel_aad(channel, sender))
    }

    /// Open and verify a channel message body claimed to be from `sender`.
    ///
    /// The carried verifying key must hash to the claimed sender id and
    /// the signature must verify under it; a member with the password but
    /// someone else's id fails both ways.
    pub fn open(
        &self,
        channel: &str,
        sender: PeerId,
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .keys
            .get(channel)
            .ok_or(CryptoError::SessionNotFound(sender))?;
        let signed = aead::open(key, sealed, &channel_aad(channel, sender))?;

        if signed.len() < TRAILER_SIZE {
            return Err(CryptoError::CiphertextTruncated);
        }
        let (plaintext, trailer) = signed.split_at(signed.len() - TRAILER_SIZE);
        let mut verifying = [0u8; KEY_SIZE];
        verifying.copy_from_slice(&trailer[..KEY_SIZE]);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&trailer[KEY_SIZE..]);

        if peer_id_from_verifying_key(&verifying) != sender {
            return Err(CryptoError::BadSignature);
        }
        verify_signature(&verifying, plaintext, &signature)?;

        Ok(plaintext.to_vec())
    }
}

impl Default for ChannelKeyring {
    fn default() -> Self {
        Self::new()
    }
}
