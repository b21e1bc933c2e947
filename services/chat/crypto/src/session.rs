//! Private message sessions.
//!
//! A session between two peers derives an AES-256 key from an X25519
//! agreement between ephemeral exchange keys. Each side mints a fresh
//! ephemeral secret per peer, announces its public half in discovery, and
//! destroys the secret when the session is dropped, so the stored signing
//! identity can never unwrap recorded traffic. Messages are signed with
//! the sender's Ed25519 identity before sealing, so tampering and
//! impersonation both surface as failures on open.
//!
//! Keys ratchet forward deterministically after a message budget or time
//! budget. Both sides advance on the same schedule; the receiver tolerates
//! a sender that ratcheted first by probing a small epoch lookahead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use tracing::debug;
use x25519_dalek::{PublicKey, ReusableSecret};

use whisper_wire::PeerId;

use crate::aead::{self, NonceGenerator};
use crate::error::CryptoError;
use crate::keys::{hkdf_derive, verify_signature, Identity, SymmetricKey, SIGNATURE_SIZE};

/// Messages sealed under one epoch key before ratcheting
pub const ROTATION_MESSAGES: u64 = 1000;

/// Wall time one epoch key stays live before ratcheting
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(3600);

/// Epochs the receiver probes ahead of its own when a seal fails to open
const RATCHET_LOOKAHEAD: u32 = 2;

const PRIVATE_AAD_TAG: &[u8] = b"whisper/private/v1";
const SESSION_INFO: &[u8] = b"whisper/private/v1/session";
const RATCHET_INFO: &[u8] = b"whisper/private/v1/ratchet";

fn private_aad(sender: PeerId, recipient: PeerId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PRIVATE_AAD_TAG.len() + 8);
    aad.extend_from_slice(PRIVATE_AAD_TAG);
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

struct Session {
    key: SymmetricKey,
    peer_signing: [u8; 32],
    peer_exchange: [u8; 32],
    epoch: u32,
    sealed_in_epoch: u64,
    epoch_started: Instant,
}

impl Session {
    fn ratchet(&mut self) -> Result<(), CryptoError> {
        self.key = SymmetricKey::from_bytes(hkdf_derive(None, self.key.as_bytes(), RATCHET_INFO)?);
        self.epoch += 1;
        self.sealed_in_epoch = 0;
        self.epoch_started = Instant::now();
        Ok(())
    }

    fn due_for_ratchet(&self) -> bool {
        self.sealed_in_epoch >= ROTATION_MESSAGES
            || self.epoch_started.elapsed() >= ROTATION_INTERVAL
    }
}

/// Owns the node identity, per-peer ephemeral exchange secrets, and every
/// established private session.
pub struct CryptoEngine {
    identity: Identity,
    ephemerals: HashMap<PeerId, ReusableSecret>,
    sessions: HashMap<PeerId, Session>,
    nonces: NonceGenerator,
}

impl CryptoEngine {
    /// Wrap a node identity
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ephemerals: HashMap::new(),
            sessions: HashMap::new(),
            nonces: NonceGenerator::new(),
        }
    }

    /// The owned identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The ephemeral X25519 public key announced to `peer`.
    ///
    /// A fresh secret is minted on first use per peer and lives until the
    /// session is dropped or the engine is wiped or suspended.
    pub fn exchange_key_for(&mut self, peer: PeerId) -> [u8; 32] {
        let secret = self
            .ephemerals
            .entry(peer)
            .or_insert_with(|| ReusableSecret::random_from_rng(OsRng));
        PublicKey::from(&*secret).to_bytes()
    }

    /// Whether a discovery announcement warrants (re-)establishment.
    ///
    /// True when no session exists or when the peer announced a new
    /// ephemeral key, meaning it restarted or destroyed the old session.
    /// An unchanged announcement must not touch the session, which would
    /// reset its ratchet state.
    pub fn needs_session(&self, peer: PeerId, peer_exchange: &[u8; 32]) -> bool {
        match self.sessions.get(&peer) {
            Some(session) => session.peer_exchange != *peer_exchange,
            None => true,
        }
    }

    /// Establish (or refresh) a session from a peer's announced keys.
    ///
    /// Both sides derive the same key from the ephemeral agreement: the
    /// HKDF salt orders the two peer ids so the derivation is symmetric.
    pub fn establish(
        &mut self,
        peer: PeerId,
        peer_exchange: &[u8; 32],
        peer_signing: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let secret = self
            .ephemerals
            .entry(peer)
            .or_insert_with(|| ReusableSecret::random_from_rng(OsRng));
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_exchange));

        let me = self.identity.peer_id();
        let (low, high) = if me <= peer { (me, peer) } else { (peer, me) };
        let mut salt = [0u8; 8];
        salt[..4].copy_from_slice(low.as_bytes());
        salt[4..].copy_from_slice(high.as_bytes());

        let key = hkdf_derive(Some(&salt), shared.as_bytes(), SESSION_INFO)?;
        debug!(peer = %peer, "session established");
        self.sessions.insert(
            peer,
            Session {
                key: SymmetricKey::from_bytes(key),
                peer_signing: *peer_signing,
                peer_exchange: *peer_exchange,
                epoch: 0,
                sealed_in_epoch: 0,
                epoch_started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Whether a session with the peer exists
    pub fn has_session(&self, peer: PeerId) -> bool {
        self.sessions.contains_key(&peer)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sign and seal a private message for `recipient`.
    ///
    /// Output: AEAD-sealed `plaintext || signature(64)` bound to the
    /// (sender, recipient) pair.
    pub fn seal_private(
        &mut self,
        recipient: PeerId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sender = self.identity.peer_id();
        let signature = self.identity.sign(plaintext);

        let session = self
            .sessions
            .get_mut(&recipient)
            .ok_or(CryptoError::SessionNotFound(recipient))?;
        if session.due_for_ratchet() {
            session.ratchet()?;
            debug!(peer = %recipient, epoch = session.epoch, "session key ratcheted");
        }

        let mut signed = Vec::with_capacity(plaintext.len() + SIGNATURE_SIZE);
        signed.extend_from_slice(plaintext);
        signed.extend_from_slice(&signature);

        let sealed = aead::seal(
            &session.key,
            &self.nonces,
            &signed,
            &private_aad(sender, recipient),
        )?;
        session.sealed_in_epoch += 1;
        Ok(sealed)
    }

    /// Open and verify a private message from `sender`.
    ///
    /// Tries the current epoch key first, then probes ahead in case the
    /// sender ratcheted before we did; a successful probe commits the
    /// ratchet locally.
    pub fn open_private(&mut self, sender: PeerId, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let recipient = self.identity.peer_id();
        let aad = private_aad(sender, recipient);

        let session = self
            .sessions
            .get_mut(&sender)
            .ok_or(CryptoError::SessionNotFound(sender))?;

        let mut key = session.key.clone();
        let mut advance = 0u32;
        let signed = loop {
            match aead::open(&key, sealed, &aad) {
                Ok(signed) => break signed,
                Err(CryptoError::AuthenticationFailed) if advance < RATCHET_LOOKAHEAD => {
                    key = SymmetricKey::from_bytes(hkdf_derive(
                        None,
                        key.as_bytes(),
                        RATCHET_INFO,
                    )?);
                    advance += 1;
                }
                Err(err) => return Err(err),
            }
        };
        for _ in 0..advance {
            session.ratchet()?;
        }

        if signed.len() < SIGNATURE_SIZE {
            return Err(CryptoError::CiphertextTruncated);
        }
        let (plaintext, signature) = signed.split_at(signed.len() - SIGNATURE_SIZE);
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(signature);
        verify_signature(&session.peer_signing, plaintext, &sig)?;

        Ok(plaintext.to_vec())
    }

    /// Drop all sessions and ephemeral secrets, zeroizing key material.
    pub fn wipe(&mut self) {
        self.sessions.clear();
        self.ephemerals.clear();
        debug!("all sessions wiped");
    }

    /// Destroy the session with one peer, ephemeral secret included.
    ///
    /// The next contact with the peer mints a fresh ephemeral, so nothing
    /// sealed under the dropped session can be unwrapped again.
    pub fn drop_session(&mut self, peer: PeerId) {
        self.sessions.remove(&peer);
        self.ephemerals.remove(&peer);
    }

    /// Zeroize all key material while the node sleeps.
    ///
    /// Sessions rebuild lazily from discovery after [`CryptoEngine::resume`].
    pub fn suspend(&mut self) {
        let dropped = self.sessions.len();
        self.sessions.clear();
        self.ephemerals.clear();
        debug!(dropped, "crypto engine suspended");
    }

    /// Counterpart of [`CryptoEngine::suspend`]; holds no state of its own.
    pub fn resume(&mut self) {
        debug!("crypto engine resumed, sessions rebuild on discovery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CryptoEngine, CryptoEngine, PeerId, PeerId) {
        let mut a = CryptoEngine::new(Identity::generate());
        let mut b = CryptoEngine::new(Identity::generate());
        let a_id = a.identity().peer_id();
        let b_id = b.identity().peer_id();
        let a_sig = a.identity().verifying_key();
        let b_sig = b.identity().verifying_key();
        let a_eph = a.exchange_key_for(b_id);
        let b_eph = b.exchange_key_for(a_id);
        a.establish(b_id, &b_eph, &b_sig).unwrap();
        b.establish(a_id, &a_eph, &a_sig).unwrap();
        (a, b, a_id, b_id)
    }

    #[test]
    fn test_private_roundtrip() {
        let (mut a, mut b, a_id, b_id) = pair();
        let sealed = a.seal_private(b_id, b"psst").unwrap();
        let opened = b.open_private(a_id, &sealed).unwrap();
        assert_eq!(opened, b"psst");
    }

    #[test]
    fn test_both_directions_use_distinct_aad() {
        let (mut a, mut b, a_id, b_id) = pair();
        let sealed = a.seal_private(b_id, b"to b").unwrap();
        // A message sealed for B cannot be opened as if B had sent it to A.
        assert!(a.open_private(b_id, &sealed).is_err());
        assert_eq!(b.open_private(a_id, &sealed).unwrap(), b"to b");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut a, mut b, a_id, b_id) = pair();
        let mut sealed = a.seal_private(b_id, b"psst").unwrap();
        sealed[aead::NONCE_SIZE] ^= 0x80;
        assert!(b.open_private(a_id, &sealed).is_err());
    }

    #[test]
    fn test_impersonation_rejected() {
        // Mallory exchanges ephemerals with B but signs with her own
        // identity; B only has sessions keyed by A's id.
        let (_a, mut b, a_id, _b_id) = pair();
        let mut mallory = CryptoEngine::new(Identity::generate());
        let m_id = mallory.identity().peer_id();
        let b_id = b.identity().peer_id();
        let b_eph = b.exchange_key_for(m_id);
        mallory
            .establish(b_id, &b_eph, &b.identity().verifying_key())
            .unwrap();
        let sealed = mallory.seal_private(b_id, b"it's me, a").unwrap();
        assert!(b.open_private(a_id, &sealed).is_err());
    }

    #[test]
    fn test_no_session_errors() {
        let mut engine = CryptoEngine::new(Identity::generate());
        let peer = PeerId::from_bytes([9; 4]);
        assert!(matches!(
            engine.seal_private(peer, b"x"),
            Err(CryptoError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_ratchet_after_message_budget() {
        let (mut a, mut b, a_id, b_id) = pair();
        {
            let session = a.sessions.get_mut(&b_id).unwrap();
            session.sealed_in_epoch = ROTATION_MESSAGES;
        }
        let sealed = a.seal_private(b_id, b"fresh epoch").unwrap();
        assert_eq!(a.sessions.get(&b_id).unwrap().epoch, 1);

        // B is still on epoch 0; the lookahead commits the ratchet.
        assert_eq!(b.open_private(a_id, &sealed).unwrap(), b"fresh epoch");
        assert_eq!(b.sessions.get(&a_id).unwrap().epoch, 1);
    }

    #[test]
    fn test_dropped_session_is_not_recoverable() {
        let (mut a, mut b, a_id, b_id) = pair();
        let sealed = a.seal_private(b_id, b"before the drop").unwrap();
        assert_eq!(b.open_private(a_id, &sealed).unwrap(), b"before the drop");

        // Dropping destroys B's ephemeral; re-establishing with the same
        // announced keys derives a different session key, so the recorded
        // ciphertext stays sealed forever.
        b.drop_session(a_id);
        let a_eph = a.exchange_key_for(b_id);
        b.establish(a_id, &a_eph, &a.identity().verifying_key())
            .unwrap();
        assert!(b.open_private(a_id, &sealed).is_err());
    }

    #[test]
    fn test_needs_session_tracks_announced_key() {
        let (mut a, mut b, a_id, b_id) = pair();
        let a_eph = a.exchange_key_for(b_id);
        assert!(!b.needs_session(a_id, &a_eph));

        // A restarting mints a new ephemeral, which must re-establish.
        a.drop_session(b_id);
        let a_fresh = a.exchange_key_for(b_id);
        assert_ne!(a_eph, a_fresh);
        assert!(b.needs_session(a_id, &a_fresh));
    }

    #[test]
    fn test_wipe_drops_sessions() {
        let (mut a, _b, _a_id, b_id) = pair();
        assert!(a.has_session(b_id));
        a.wipe();
        assert!(!a.has_session(b_id));
    }

    #[test]
    fn test_suspend_zeroizes_sessions() {
        let (mut a, _b, _a_id, b_id) = pair();
        a.suspend();
        assert_eq!(a.session_count(), 0);
        assert!(matches!(
            a.seal_private(b_id, b"x"),
            Err(CryptoError::SessionNotFound(_))
        ));
    }
}
