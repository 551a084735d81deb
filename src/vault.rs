//! Credential vault: AES-256-GCM encryption and display masking of secrets.
//!
//! Stored values have the layout `<ivHex>:<cipherHex>` where the IV is a
//! fresh random 16 bytes per call and the ciphertext carries the GCM tag.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::config::VaultConfig;
use crate::error::VaultError;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;
/// IV size in bytes; hex-encoded it is 32 characters.
pub const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 16;

const MASK: &str = "***";
const MASK_PREFIX: usize = 8;
const MASK_SUFFIX: usize = 4;

type VaultCipher = AesGcm<Aes256, U16>;

/// Key material right-padded with `'0'` or truncated to exactly 32 bytes.
fn normalize_key(material: &str) -> [u8; KEY_SIZE] {
    let mut key = [b'0'; KEY_SIZE];
    let bytes = material.as_bytes();
    let n = bytes.len().min(KEY_SIZE);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Display form of a secret: the first 8 and last 4 characters.
pub fn mask(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= MASK_PREFIX {
        return MASK.to_string();
    }
    let prefix: String = secret.chars().take(MASK_PREFIX).collect();
    let suffix: String = secret.chars().skip(len.saturating_sub(MASK_SUFFIX)).collect();
    format!("{prefix}{MASK}{suffix}")
}

/// Whether `value` has the stored-secret layout. Does not check the key.
pub fn is_encrypted(value: &str) -> bool {
    let Some((iv, cipher)) = value.split_once(':') else {
        return false;
    };
    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    iv.len() == IV_SIZE * 2
        && is_hex(iv)
        && cipher.len() >= TAG_SIZE * 2
        && cipher.len() % 2 == 0
        && is_hex(cipher)
}

pub struct CredentialVault {
    cipher: VaultCipher,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialVault {
    pub fn new(key_material: &SecretString) -> Result<Self, VaultError> {
        let material = key_material.expose_secret();
        if material.trim().is_empty() {
            return Err(VaultError::EmptyKey);
        }
        if material.len() < KEY_SIZE {
            tracing::warn!("ENCRYPTION_KEY is shorter than 32 bytes and will be zero-padded");
        }
        let key = normalize_key(material);
        Ok(Self {
            cipher: VaultCipher::new(GenericArray::from_slice(&key)),
        })
    }

    pub fn from_config(config: &VaultConfig) -> Result<Self, VaultError> {
        Self::new(&config.encryption_key)
    }

    /// Encrypt a secret into `ivHex:cipherHex`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt("AES-GCM encryption failed".to_string()))?;
        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a stored value. Fails on malformed input, a different key, or
    /// tampered ciphertext.
    pub fn decrypt(&self, stored: &str) -> Result<SecretString, VaultError> {
        let parts: Vec<&str> = stored.split(':').collect();
        let [iv_hex, cipher_hex] = parts.as_slice() else {
            return Err(VaultError::Decrypt(format!(
                "expected 'iv:ciphertext', found {} part(s)",
                parts.len()
            )));
        };
        let iv = hex::decode(iv_hex)
            .map_err(|e| VaultError::Decrypt(format!("IV is not valid hex: {e}")))?;
        if iv.len() != IV_SIZE {
            return Err(VaultError::Decrypt(format!(
                "IV must be {IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        let ciphertext = hex::decode(cipher_hex)
            .map_err(|e| VaultError::Decrypt(format!("ciphertext is not valid hex: {e}")))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| {
                VaultError::Decrypt("authentication failed (wrong key or tampered data)".to_string())
            })?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Decrypt("plaintext is not UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}
