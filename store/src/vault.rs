//! Reversible encryption for stored connection secrets.
//!
//! AES-256-GCM with the key derived as SHA-256 of a configured secret. The
//! 12-byte random nonce is prepended to the ciphertext and the whole token is
//! base64-encoded. Decryption validates the GCM tag, so tampering or a wrong
//! key surfaces as a typed error instead of garbage plaintext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("plaintext must not be empty")]
    EmptyPlaintext,
    #[error("ciphertext must not be empty")]
    EmptyCiphertext,
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed, wrong key or corrupted ciphertext")]
    Decrypt,
    #[error("decrypted payload is not valid utf-8")]
    Utf8,
}

/// Encrypts and decrypts connection passwords.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new(&key);
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Err(VaultError::EmptyPlaintext);
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Decrypt)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, VaultError> {
        if token.is_empty() {
            return Err(VaultError::EmptyCiphertext);
        }

        let data = BASE64.decode(token).map_err(|_| VaultError::Encoding)?;
        if data.len() <= NONCE_LEN {
            return Err(VaultError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Utf8)
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let vault = CredentialVault::new("test-secret");
        for plaintext in ["p@ss", "root123", "пароль", "a b c = & $MYSQL_PWD"] {
            let token = vault.encrypt(plaintext).unwrap();
            assert_ne!(token, plaintext);
            assert_eq!(vault.decrypt(&token).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_make_ciphertexts_unique() {
        let vault = CredentialVault::new("test-secret");
        let a = vault.encrypt("p@ss").unwrap();
        let b = vault.encrypt("p@ss").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_the_tag_check() {
        let token = CredentialVault::new("secret-a").encrypt("p@ss").unwrap();
        assert_eq!(
            CredentialVault::new("secret-b").decrypt(&token),
            Err(VaultError::Decrypt)
        );
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let vault = CredentialVault::new("test-secret");
        assert_eq!(vault.encrypt(""), Err(VaultError::EmptyPlaintext));
        assert_eq!(vault.decrypt(""), Err(VaultError::EmptyCiphertext));
        assert_eq!(vault.decrypt("not base64!!!"), Err(VaultError::Encoding));
        assert_eq!(vault.decrypt(&BASE64.encode(b"short")), Err(VaultError::Truncated));
        assert_eq!(
            vault.decrypt(&BASE64.encode(vec![0u8; 64])),
            Err(VaultError::Decrypt)
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let vault = CredentialVault::new("test-secret");
        let token = vault.encrypt("p@ss").unwrap();
        let mut raw = BASE64.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(vault.decrypt(&BASE64.encode(raw)), Err(VaultError::Decrypt));
    }
}
