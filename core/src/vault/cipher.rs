//! Sealing of vault entries.
//!
//! Stored form is standard-alphabet base64 of `nonce (24 bytes) || ciphertext`,
//! with the entry name bound as associated data so a blob cannot be moved
//! to another name.

use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::errors::VaultError;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

pub struct SecretCipher {
    aead: XChaCha20Poly1305,
}

impl SecretCipher {
    pub fn generate_key() -> Zeroizing<Vec<u8>> {
        Zeroizing::new(XChaCha20Poly1305::generate_key(&mut OsRng).to_vec())
    }

    pub fn from_key(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::Keystore(format!(
                "master key has {} bytes, expected {KEY_LEN}",
                key.len()
            )));
        }
        let aead = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| VaultError::Keystore("master key rejected".into()))?;
        Ok(Self { aead })
    }

    pub fn seal(&self, name: &str, plaintext: &str) -> Result<String, VaultError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Encrypt)?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(nonce.as_slice());
        framed.extend_from_slice(&ciphertext);
        Ok(B64_ENGINE.encode(framed))
    }

    /// Any malformed, truncated, tampered or foreign blob is [`VaultError::Decrypt`].
    pub fn open(&self, name: &str, blob: &str) -> Result<Zeroizing<String>, VaultError> {
        let framed = B64_ENGINE
            .decode(blob.trim())
            .map_err(|_| VaultError::Decrypt)?;
        if framed.len() <= NONCE_LEN {
            return Err(VaultError::Decrypt);
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.aead
                .decrypt(
                    XNonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: name.as_bytes(),
                    },
                )
                .map_err(|_| VaultError::Decrypt)?,
        );
        let text = std::str::from_utf8(&plaintext).map_err(|_| VaultError::Decrypt)?;
        Ok(Zeroizing::new(text.to_string()))
    }
}
