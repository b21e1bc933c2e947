//! Node identity and key derivation.
//!
//! Every node owns a long-lived Ed25519 signing identity; the 4-byte mesh
//! peer id is derived from its verifying key. X25519 exchange keys are
//! deliberately NOT part of the identity: they are ephemeral, minted per
//! peer by the [`crate::CryptoEngine`] and never persisted. Secret
//! material is zeroized on drop and never shows up in Debug output.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use whisper_wire::PeerId;

use crate::error::CryptoError;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Derive a key with HKDF-SHA256.
pub fn hkdf_derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(okm)
}

/// A symmetric key derived for one session or channel.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub(crate) [u8; 32]);

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Expose the raw bytes to the AEAD layer
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey(..)")
    }
}

/// Derive a peer id from Ed25519 verifying key bytes.
///
/// The id is the leading bytes of a SHA-256 digest over the key, so any
/// receiver can check that a claimed source id actually belongs to the
/// key that signed the message.
pub fn peer_id_from_verifying_key(verifying_key: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(verifying_key);
    let mut id = [0u8; 4];
    id.copy_from_slice(&digest[..4]);
    PeerId(id)
}

/// Long-lived Ed25519 signing identity.
///
/// Ids are stable across restarts of the same identity; only the 32-byte
/// signing seed is ever stored.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the system RNG
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing }
    }

    /// Restore an identity from its stored signing seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// The mesh peer id derived from the verifying key
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_verifying_key(&self.verifying_key())
    }

    /// Ed25519 verifying key bytes, announced in discovery
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message with the identity key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .field("verifying_key", &hex::encode(self.verifying_key()))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against announced verifying key bytes.
pub fn verify_signature(
    verifying_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(verifying_key).map_err(|_| CryptoError::InvalidKey)?;
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::BadSignature)
}
