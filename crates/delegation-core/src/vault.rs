//! Encryption at rest for session-key signing material.
//!
//! Sealed format: base64(NONCE (12) || CIPHERTEXT (N + 16 tag)), AES-256-GCM.
//! Plaintext secrets only ever live inside [`Zeroizing`] buffers.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault secret not provided (expected environment variable {0})")]
    MissingSecret(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("sealed payload is malformed: {0}")]
    Malformed(String),
    #[error("invalid signing key material")]
    InvalidKey,
}

/// Holds session-key signing material; exposes only encrypt/decrypt.
pub trait KeyVault: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError>;
    fn decrypt(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, VaultError>;
}

pub struct AesGcmVault {
    cipher: Aes256Gcm,
}

impl AesGcmVault {
    /// Accepts a 64-character hex key, or derives one by hashing any other
    /// non-empty secret with SHA-256.
    pub fn from_secret(secret: &str) -> Result<Self, VaultError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(VaultError::MissingSecret("<empty>".to_string()));
        }

        let key: Zeroizing<Vec<u8>> = match hex::decode(secret) {
            Ok(bytes) if bytes.len() == KEY_LEN => Zeroizing::new(bytes),
            _ => Zeroizing::new(Sha256::digest(secret.as_bytes()).to_vec()),
        };
        Self::from_key_bytes(&key)
    }

    pub fn from_env(var: &str) -> Result<Self, VaultError> {
        let secret = Zeroizing::new(
            std::env::var(var).map_err(|_| VaultError::MissingSecret(var.to_string()))?,
        );
        Self::from_secret(&secret)
    }

    /// Vault with a fresh random key; sealed data does not survive the process.
    pub fn ephemeral() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..])),
        }
    }

    fn from_key_bytes(key: &[u8]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|err| VaultError::Encryption(err.to_string()))?;
        Ok(Self { cipher })
    }
}

impl fmt::Debug for AesGcmVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmVault").finish_non_exhaustive()
    }
}

impl KeyVault for AesGcmVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|err| VaultError::Encryption(err.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let raw = BASE64
            .decode(sealed)
            .map_err(|err| VaultError::Malformed(err.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Malformed(format!(
                "expected at least {} bytes, got {}",
                NONCE_LEN + TAG_LEN,
                raw.len()
            )));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|err| VaultError::Decryption(err.to_string()))
    }
}

/// Fresh secp256k1 signer: raw secret bytes and the Ethereum-style address.
pub(crate) fn generate_signer() -> (Zeroizing<Vec<u8>>, String) {
    let signing_key = SigningKey::random(&mut OsRng);
    let secret = Zeroizing::new(signing_key.to_bytes().to_vec());
    (secret, signer_address(&signing_key))
}

pub(crate) fn signer_address(signing_key: &SigningKey) -> String {
    let point = signing_key.verifying_key().to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Signs `payload` with a decrypted secret. The secret is borrowed and the
/// key object is dropped (and zeroized) before returning.
pub(crate) fn sign_with_secret(secret: &[u8], payload: &[u8]) -> Result<String, VaultError> {
    let signing_key = SigningKey::from_slice(secret).map_err(|_| VaultError::InvalidKey)?;
    let signature: Signature = signing_key.sign(payload);
    Ok(hex::encode(signature.to_bytes()))
}
