use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead as _, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::{Error, Result, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

// Argon2id cost parameters. Roughly 100ms per derivation on commodity
// hardware, which is the brute-force gate for both online and offline
// passcode guessing.
const ARGON2_TIME: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_LANES: u32 = 4;

const MIN_SALT_LEN: usize = 8;

/// Derives the 32-byte preshared key from a passcode and session id.
///
/// The session id is the salt, right-padded with zero bytes to 8 if
/// shorter, so every session yields a distinct key for the same passcode.
///
/// # Arguments
/// * `passcode` - The human-transferable passcode (e.g. "493-771")
/// * `session_id` - The session id, used as salt
///
/// # Returns
/// A 32-byte key, zeroed on drop
pub fn derive_key(passcode: &str, session_id: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut salt = session_id.as_bytes().to_vec();
    if salt.len() < MIN_SALT_LEN {
        salt.resize(MIN_SALT_LEN, 0);
    }

    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME, ARGON2_LANES, Some(KEY_SIZE))
        .map_err(|_| Error::InvalidKey)?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(passcode.as_bytes(), &salt, key.as_mut_slice())
        .map_err(|_| Error::InvalidKey)?;

    Ok(key)
}

/// Fills a buffer with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Returns `n` cryptographically secure random bytes.
pub fn secure_random(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf);
    buf
}

/// Constant-time byte comparison to prevent timing attacks.
/// Unequal lengths compare unequal without inspecting content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// An ephemeral X25519 key pair for the handshake.
///
/// The private scalar can be used for exactly one Diffie-Hellman
/// computation and is zeroed when consumed or dropped.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Performs the X25519 exchange with the remote public key.
    ///
    /// Rejects an all-zero shared secret, which only arises from
    /// low-order remote points.
    pub fn diffie_hellman(self, their_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let their_public = PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);

        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.as_bytes());

        let is_zero = out.iter().fold(0u8, |acc, &b| acc | b);
        if is_zero == 0 {
            return Err(Error::InvalidKey);
        }

        Ok(out)
    }
}

/// Authenticated encryption with XChaCha20-Poly1305.
///
/// Each sealed record carries its own 24-byte nonce: the low 16 bytes
/// are fresh randomness, the high 8 bytes are the big-endian send
/// counter. The counter increments before every seal, so nonces are
/// unique per direction and the receiver needs no state beyond the key.
pub struct Aead {
    cipher: XChaCha20Poly1305,
    counter: u64,
}

impl Aead {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
            counter: 0,
        }
    }

    /// Encrypts and authenticates a plaintext.
    ///
    /// # Returns
    /// A record of the form `nonce(24) || ciphertext || tag(16)`
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.counter += 1;

        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce[..16]);
        nonce[16..].copy_from_slice(&self.counter.to_be_bytes());

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::EncryptionFailed)?;

        let mut record = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypts and verifies a sealed record. Any tampering with the
    /// nonce, ciphertext or tag fails verification.
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>> {
        if record.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::DecryptionFailed);
        }

        let (nonce, ciphertext) = record.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptionFailed)
    }

    /// Number of records sealed so far.
    pub fn sealed_count(&self) -> u64 {
        self.counter
    }
}
