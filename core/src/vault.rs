use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};

const NONCE_LEN: usize = 12;

/// Symmetric vault for credentials persisted in the record stores: database
/// passwords, SSH secrets and the S3 secret key. The key is derived once at
/// startup from a process-wide secret; ciphertexts travel as
/// base64(nonce || aes-256-gcm ciphertext).
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("sha-256 digest is a valid aes-256 key");
        Vault { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| BackupError::Decrypt)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(wire))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let wire = BASE64.decode(ciphertext).map_err(|_| BackupError::Decrypt)?;
        if wire.len() <= NONCE_LEN {
            return Err(BackupError::Decrypt);
        }

        let (nonce_bytes, payload) = wire.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|_| BackupError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| BackupError::Decrypt)
    }

    /// Decrypts an optional stored secret, treating the empty string as absent.
    pub fn decrypt_opt(&self, ciphertext: &str) -> Result<Option<String>> {
        if ciphertext.is_empty() {
            return Ok(None);
        }
        self.decrypt(ciphertext).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = Vault::new("test-secret");
        let ciphertext = vault.encrypt("p4ssw0rd").expect("encrypt");
        assert_ne!(ciphertext, "p4ssw0rd");
        assert_eq!(vault.decrypt(&ciphertext).expect("decrypt"), "p4ssw0rd");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let vault = Vault::new("test-secret");
        let a = vault.encrypt("same input").expect("encrypt");
        let b = vault.encrypt("same input").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let ciphertext = Vault::new("key-one").encrypt("secret").expect("encrypt");
        let err = Vault::new("key-two").decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, BackupError::Decrypt));
    }

    #[test]
    fn malformed_ciphertext_is_rejected() {
        let vault = Vault::new("test-secret");
        assert!(matches!(
            vault.decrypt("not base64 at all!"),
            Err(BackupError::Decrypt)
        ));
        assert!(matches!(
            vault.decrypt(&BASE64.encode(b"short")),
            Err(BackupError::Decrypt)
        ));
    }

    #[test]
    fn empty_optional_secret_decrypts_to_none() {
        let vault = Vault::new("test-secret");
        assert!(vault.decrypt_opt("").expect("decrypt").is_none());
    }
}
