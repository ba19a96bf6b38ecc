//! AES-256-GCM envelope encryption for upstream model credentials.
//!
//! Key derivation and wire layout intentionally match the source system byte
//! for byte: key = `sha512(shared_secret)[:32]` (a raw truncated digest, not
//! HKDF, despite HKDF being a more conventional choice), nonce = 12 random
//! bytes, payload = `nonce || ciphertext || tag`, base64url with padding
//! stripped. The Model Proxy must decrypt exactly what Admission encrypts.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha512};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 token")]
    InvalidEncoding,
    #[error("token too short")]
    TooShort,
    #[error("decryption failed")]
    AuthenticationFailed,
}

/// Derives the shared AES-256 key from an operator-configured secret string.
pub fn derive_key(shared_secret: &str) -> [u8; 32] {
    let digest = Sha512::digest(shared_secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

/// Encrypts `plaintext` under `key`, returning a base64url-no-pad token.
pub fn encrypt_token(plaintext: &str, key: &[u8; 32]) -> String {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext.as_bytes(), aad: &[] })
        .expect("AES-GCM encryption with a 12-byte nonce never fails");

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decrypts a token produced by [`encrypt_token`] under the same `key`.
/// Any tampering with nonce, ciphertext, or tag surfaces as
/// [`CryptoError::AuthenticationFailed`].
pub fn decrypt_token(token: &str, key: &[u8; 32]) -> Result<String, CryptoError> {
    let payload = URL_SAFE_NO_PAD.decode(token).map_err(|_| CryptoError::InvalidEncoding)?;
    if payload.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let key = derive_key("shared-secret");
        let token = encrypt_token("sk-live-abc123", &key);
        assert_eq!(decrypt_token(&token, &key).unwrap(), "sk-live-abc123");
    }

    #[test]
    fn token_has_no_base64_padding() {
        let key = derive_key("shared-secret");
        let token = encrypt_token("x", &key);
        assert!(!token.contains('='));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = derive_key("shared-secret");
        let token = encrypt_token("sk-live-abc123", &key);
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(matches!(decrypt_token(&tampered, &key), Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn tampered_nonce_fails_auth() {
        let key = derive_key("shared-secret");
        let token = encrypt_token("sk-live-abc123", &key);
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        raw[0] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(decrypt_token(&tampered, &key).is_err());
    }

    #[test]
    fn wrong_key_fails_auth() {
        let key_a = derive_key("secret-a");
        let key_b = derive_key("secret-b");
        let token = encrypt_token("sk-live-abc123", &key_a);
        assert!(decrypt_token(&token, &key_b).is_err());
    }
}
