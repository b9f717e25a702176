//! Reference crypto adapter (§4.7, §6 "Crypto adapter contract").
//!
//! Out of scope per the core's boundary (§1), but a concrete implementation
//! is provided so the round FSM is runnable end to end in tests and demos.
//! Ephemeral keys are ECDH on secp256k1 (`curv-kzen`, the same curve backing
//! is used as the key/hashing primitives of [`crate::wire`]'s signatures);
//! the shared secret is stretched through HKDF-SHA256 into an AES-256-GCM key.

use curv::arithmetic::traits::Converter;
use curv::cryptographic_primitives::hashing::hash_sha256::HSha256;
use curv::cryptographic_primitives::hashing::traits::Hash;
use curv::elliptic::curves::secp256_k1::{FE, GE};
use curv::elliptic::curves::traits::{ECPoint, ECScalar};
use curv::BigInt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed ciphertext")]
    Malformed,
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("decryption failed (bad key or tampered ciphertext)")]
    DecryptionFailed,
}

/// An ephemeral asymmetric keypair, owned exclusively by a single [`crate::round::Round`]
/// for the lifetime of one attempt (§9, "Shared ephemeral keypair").
pub struct EphemeralKeyPair {
    secret: FE,
    public: GE,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret: FE = ECScalar::new_random();
        let public = GE::generator() * &secret;
        Self { secret, public }
    }

    /// Reconstructs a scoped decryption context from an exported private
    /// key, without mutating any long-lived adapter (§9, REDESIGN FLAGS).
    pub fn restore_from_privkey(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: FE = ECScalar::from(&BigInt::from_bytes(bytes));
        let public = GE::generator() * &secret;
        Ok(Self { secret, public })
    }

    pub fn export_public_key(&self) -> Vec<u8> {
        self.public.pk_to_key_slice()
    }

    pub fn export_private_key(&self) -> Vec<u8> {
        self.secret.to_big_int().to_bytes()
    }

    /// Hybrid-encrypts `plaintext` to `peer_public_key` (ECDH + AES-256-GCM).
    pub fn encrypt(&self, plaintext: &[u8], peer_public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer_point = GE::from_bytes(peer_public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
        let ephemeral: FE = ECScalar::new_random();
        let ephemeral_pub = GE::generator() * &ephemeral;
        let shared = peer_point * &ephemeral;

        let aes_key = derive_key(&shared.pk_to_key_slice());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let ephemeral_pub_bytes = ephemeral_pub.pk_to_key_slice();
        let mut out = Vec::with_capacity(2 + ephemeral_pub_bytes.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&(ephemeral_pub_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&ephemeral_pub_bytes);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a payload produced by [`Self::encrypt`] using this keypair's
    /// private key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < 2 {
            return Err(CryptoError::Malformed);
        }
        let point_len = u16::from_be_bytes([ciphertext[0], ciphertext[1]]) as usize;
        let rest = &ciphertext[2..];
        if rest.len() < point_len + NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let (point_bytes, rest) = rest.split_at(point_len);
        let (nonce_bytes, aes_ct) = rest.split_at(NONCE_LEN);

        let ephemeral_pub = GE::from_bytes(point_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = ephemeral_pub * &self.secret;
        let aes_key = derive_key(&shared.pk_to_key_slice());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&aes_key));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, aes_ct)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"coinshuffle-ecies-v1"), shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(b"aes-256-gcm key", &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Canonical commitment hash used by the equivocation check and the
/// mid-shuffle transcript hash (§4.4.6, §4.4.8). Hashes the *canonical*
/// concatenation of its parts (length-prefixed) rather than a
/// language-specific `repr()`/`str()` (§9.1 open-question resolution).
pub fn hash_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut big_ints = Vec::with_capacity(parts.len() + 1);
    let framing = BigInt::from(parts.len() as u32);
    big_ints.push(framing);
    for part in parts {
        big_ints.push(BigInt::from(part.len() as u32));
        big_ints.push(BigInt::from_bytes(part));
    }
    let refs: Vec<&BigInt> = big_ints.iter().collect();
    HSha256::create_hash(&refs).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let recipient = EphemeralKeyPair::generate();
        let plaintext = b"1BoatSLRHtKNngkdXEeobR76b53LETtpyT";
        let ciphertext = recipient
            .encrypt(plaintext, &recipient.export_public_key())
            .expect("encrypt");
        let decrypted = recipient.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn restore_from_privkey_matches_original() {
        let original = EphemeralKeyPair::generate();
        let restored = EphemeralKeyPair::restore_from_privkey(&original.export_private_key()).unwrap();
        assert_eq!(original.export_public_key(), restored.export_public_key());
    }

    #[test]
    fn hash_is_sensitive_to_part_boundaries() {
        let a = hash_parts(&[b"ab", b"c"]);
        let b = hash_parts(&[b"a", b"bc"]);
        assert_ne!(a, b, "length framing must prevent boundary-shifting collisions");
    }
}
