//! Passphrase-derived wrapping of stored key material.
//!
//! The wrapping key is PBKDF2-HMAC-SHA256 over the slot password with a
//! fixed context salt, so the same password always derives the same key and
//! a restarted module can unwrap everything it wrote before. Values are
//! sealed with AES-256-GCM; the ciphertext authenticates the plaintext, so
//! a wrong password or a tampered file fails loudly instead of yielding
//! garbage key material.

use aes_gcm::aead::Aead;
use aes_gcm::Aes256Gcm;
use aes_gcm::KeyInit;
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::TokenError;

const KDF_ITERATIONS: u32 = 60_000;
const KDF_SALT: &[u8] = b"keyfort-p11-emulator-keywrap-v1";
const NONCE_LEN: usize = 12;

pub(crate) struct KeyCryptor {
    cipher: Aes256Gcm,
}

impl KeyCryptor {
    pub fn new(password: &[u8]) -> Result<Self, TokenError> {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2::<Hmac<Sha256>>(password, KDF_SALT, KDF_ITERATIONS, &mut key[..])
            .map_err(|_| TokenError::other("key derivation failed"))?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| TokenError::other("cannot build wrapping cipher"))?;
        Ok(Self { cipher })
    }

    /// Seals `plaintext`; the random nonce is prepended to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| TokenError::other("key wrapping failed"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        if sealed.len() < NONCE_LEN {
            return Err(TokenError::other("sealed value is truncated"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| TokenError::other("key unwrapping failed, wrong password or corrupt file"))?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_determinism_across_instances() {
        let a = KeyCryptor::new(b"test-1234").unwrap();
        let sealed = a.encrypt(b"private bits").unwrap();

        // a second cryptor over the same password unwraps what the first sealed
        let b = KeyCryptor::new(b"test-1234").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap().as_slice(), b"private bits");
    }

    #[test]
    fn wrong_password_is_detected() {
        let sealed = KeyCryptor::new(b"right").unwrap().encrypt(b"x").unwrap();
        assert!(KeyCryptor::new(b"wrong").unwrap().decrypt(&sealed).is_err());
    }

    #[test]
    fn tampering_is_detected() {
        let cryptor = KeyCryptor::new(b"pw").unwrap();
        let mut sealed = cryptor.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cryptor.decrypt(&sealed).is_err());
    }
}
