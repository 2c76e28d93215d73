//! AEAD (Authenticated Encryption with Associated Data) implementation
//!
//! Supports:
//! - ChaCha20-Poly1305
//! - AES-128-GCM
//! - AES-256-GCM

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

use super::{NONCE_SIZE, TAG_SIZE};

/// Cipher types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    /// Get the key size for this cipher
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
        }
    }

    pub fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    pub fn tag_size(&self) -> usize {
        TAG_SIZE
    }
}

/// AEAD cipher trait
pub trait Aead: Send + Sync {
    /// Encrypt plaintext with associated data
    fn encrypt(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt ciphertext with associated data
    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Get the cipher kind
    fn kind(&self) -> CipherKind;
}

/// AEAD cipher implementation
pub struct AeadCipher {
    kind: CipherKind,
    inner: CipherInner,
}

enum CipherInner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?;
                CipherInner::ChaCha20Poly1305(cipher)
            }
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?;
                CipherInner::Aes128Gcm(cipher)
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?;
                CipherInner::Aes256Gcm(cipher)
            }
        };

        Ok(Self { kind, inner })
    }
}

impl Aead for AeadCipher {
    fn encrypt(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, payload),
            CipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, payload),
        };
        result.map_err(|_| Error::Crypto("encryption failed".into()))
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, payload),
            CipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, payload),
        };
        result.map_err(|_| Error::Crypto("decryption failed".into()))
    }

    fn kind(&self) -> CipherKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_ciphers() {
        for kind in [
            CipherKind::ChaCha20Poly1305,
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
        ] {
            let key = vec![0x42u8; kind.key_size()];
            let cipher = AeadCipher::new(kind, &key).unwrap();
            let nonce = [7u8; NONCE_SIZE];

            let ct = cipher.encrypt(&nonce, b"plaintext", b"aad").unwrap();
            assert_eq!(ct.len(), 9 + TAG_SIZE);
            let pt = cipher.decrypt(&nonce, &ct, b"aad").unwrap();
            assert_eq!(pt, b"plaintext");

            assert!(cipher.decrypt(&nonce, &ct, b"wrong-aad").is_err());
        }
    }

    #[test]
    fn rejects_bad_key_size() {
        assert!(AeadCipher::new(CipherKind::Aes256Gcm, &[0u8; 16]).is_err());
    }
}
