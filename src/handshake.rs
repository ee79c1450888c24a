//! Two-message authenticated handshake.
//!
//! Both peers hold a preshared key derived from the passcode. The
//! initiator sends its ephemeral X25519 public key plus an auth proof
//! sealed under the preshared key; the responder replies with its own
//! ephemeral key plus a proof sealed under a key derived from the fresh
//! shared secret. Transport keys are bound to the full transcript, so a
//! successful handshake gives mutual authentication and forward secrecy.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cryptography::{self, Aead, EphemeralKeyPair};
use crate::{Error, Result, KEY_SIZE};

const CHALLENGE_SIZE: usize = 32;
const AUTH_BLOB_SIZE: usize = CHALLENGE_SIZE + 32;

const LABEL_RESPONDER: &[u8] = b"responder";
const LABEL_I2R: &[u8] = b"initiator_to_responder";
const LABEL_R2I: &[u8] = b"responder_to_initiator";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake state for one tunnel. Created per connection and consumed
/// once transport keys are derived; secrets are zeroed on drop.
pub struct Handshake {
    role: Role,
    local: Option<EphemeralKeyPair>,
    local_public: [u8; 32],
    remote_public: Option<[u8; 32]>,
    shared: Option<Zeroizing<[u8; 32]>>,
    preshared: Zeroizing<[u8; KEY_SIZE]>,
    // Running SHA-256 chain over preshared key and both ephemerals,
    // in the order they enter the conversation.
    transcript: Zeroizing<Vec<u8>>,
}

impl Handshake {
    pub fn new(preshared: &[u8; KEY_SIZE], role: Role) -> Self {
        let local = EphemeralKeyPair::generate();
        let local_public = local.public_bytes();

        // Seed the transcript chain with the preshared key
        let mut hasher = Sha256::new();
        hasher.update(preshared.as_slice());
        let transcript = Zeroizing::new(hasher.finalize().to_vec());

        Self {
            role,
            local: Some(local),
            local_public,
            remote_public: None,
            shared: None,
            preshared: Zeroizing::new(*preshared),
            transcript,
        }
    }

    fn update_transcript(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.transcript.as_slice());
        hasher.update(data);
        *self.transcript = hasher.finalize().to_vec();
    }

    /// `SHA256(transcript || secret || label)`, the key schedule for both
    /// the responder's message key and the transport keys.
    fn derive_label_key(&self, secret: &[u8], label: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut hasher = Sha256::new();
        hasher.update(self.transcript.as_slice());
        hasher.update(secret);
        hasher.update(label);
        let digest = hasher.finalize();

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(digest.as_slice());
        key
    }

    /// `challenge(32) || SHA256(transcript || preshared || challenge)`.
    fn compute_auth_proof(&self) -> Vec<u8> {
        let challenge = cryptography::secure_random(CHALLENGE_SIZE);

        let mut hasher = Sha256::new();
        hasher.update(self.transcript.as_slice());
        hasher.update(self.preshared.as_slice());
        hasher.update(&challenge);
        let proof = hasher.finalize();

        let mut blob = Vec::with_capacity(AUTH_BLOB_SIZE);
        blob.extend_from_slice(&challenge);
        blob.extend_from_slice(proof.as_slice());
        blob
    }

    fn verify_auth_proof(&self, blob: &[u8]) -> bool {
        if blob.len() != AUTH_BLOB_SIZE {
            return false;
        }

        let challenge = &blob[..CHALLENGE_SIZE];
        let received = &blob[CHALLENGE_SIZE..];

        let mut hasher = Sha256::new();
        hasher.update(self.transcript.as_slice());
        hasher.update(self.preshared.as_slice());
        hasher.update(challenge);
        let expected = hasher.finalize();

        cryptography::constant_time_eq(received, expected.as_slice())
    }

    fn learn_remote_public(&mut self, message: &[u8]) -> Result<()> {
        if message.len() < 32 {
            return Err(Error::Protocol("handshake message too short".into()));
        }
        let mut remote = [0u8; 32];
        remote.copy_from_slice(&message[..32]);
        self.remote_public = Some(remote);
        self.update_transcript(&remote);
        Ok(())
    }

    /// Computes the X25519 shared secret, consuming the ephemeral
    /// private scalar. Callable once; low-order points are rejected.
    fn compute_shared(&mut self) -> Result<()> {
        let remote = self
            .remote_public
            .ok_or_else(|| Error::Protocol("remote ephemeral not yet learned".into()))?;
        let local = self
            .local
            .take()
            .ok_or_else(|| Error::Protocol("shared secret already computed".into()))?;

        let shared = local.diffie_hellman(&remote).map_err(|_| Error::AuthenticationFailed)?;
        self.shared = Some(shared);
        Ok(())
    }

    /// Builds M1: `E_i.pub || seal_psk(auth_blob)`.
    pub fn create_initiator_message(&mut self) -> Result<Vec<u8>> {
        if self.role != Role::Initiator {
            return Err(Error::Protocol("only the initiator can send M1".into()));
        }

        let local_public = self.local_public;
        self.update_transcript(&local_public);

        let blob = self.compute_auth_proof();
        let sealed = Aead::new(&self.preshared).seal(&blob)?;

        let mut message = Vec::with_capacity(32 + sealed.len());
        message.extend_from_slice(&local_public);
        message.extend_from_slice(&sealed);
        Ok(message)
    }

    /// Responder side: verifies M1 against the preshared key.
    pub fn process_initiator_message(&mut self, message: &[u8]) -> Result<()> {
        if self.role != Role::Responder {
            return Err(Error::Protocol("only the responder can process M1".into()));
        }

        self.learn_remote_public(message)?;

        let blob = Aead::new(&self.preshared)
            .open(&message[32..])
            .map_err(|_| Error::AuthenticationFailed)?;

        if !self.verify_auth_proof(&blob) {
            return Err(Error::AuthenticationFailed);
        }

        Ok(())
    }

    /// Builds M2: `E_r.pub || seal_{K(s, "responder")}(auth_blob)`.
    pub fn create_responder_message(&mut self) -> Result<Vec<u8>> {
        if self.role != Role::Responder {
            return Err(Error::Protocol("only the responder can send M2".into()));
        }
        if self.remote_public.is_none() {
            return Err(Error::Protocol("M1 must be processed first".into()));
        }

        let local_public = self.local_public;
        self.update_transcript(&local_public);

        let blob = self.compute_auth_proof();

        self.compute_shared()?;
        let shared = self.shared.as_ref().expect("shared secret just computed");
        let message_key = self.derive_label_key(shared.as_slice(), LABEL_RESPONDER);

        let sealed = Aead::new(&message_key).seal(&blob)?;

        let mut message = Vec::with_capacity(32 + sealed.len());
        message.extend_from_slice(&local_public);
        message.extend_from_slice(&sealed);
        Ok(message)
    }

    /// Initiator side: verifies M2 under the freshly derived secret.
    pub fn process_responder_message(&mut self, message: &[u8]) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(Error::Protocol("only the initiator can process M2".into()));
        }

        self.learn_remote_public(message)?;
        self.compute_shared()?;

        let shared = self.shared.as_ref().expect("shared secret just computed");
        let message_key = self.derive_label_key(shared.as_slice(), LABEL_RESPONDER);

        let blob = Aead::new(&message_key)
            .open(&message[32..])
            .map_err(|_| Error::AuthenticationFailed)?;

        if !self.verify_auth_proof(&blob) {
            return Err(Error::AuthenticationFailed);
        }

        Ok(())
    }

    /// Derives the directional transport keys `(send, recv)` for this
    /// peer's role. The initiator sends with the initiator-to-responder
    /// key; the responder does the opposite.
    pub fn transport_keys(
        &self,
    ) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| Error::Protocol("handshake not complete".into()))?;

        let i2r = self.derive_label_key(shared.as_slice(), LABEL_I2R);
        let r2i = self.derive_label_key(shared.as_slice(), LABEL_R2I);

        Ok(match self.role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        })
    }
}
