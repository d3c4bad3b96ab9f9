//! At-rest protection for the backend credential kept in settings.toml.
//!
//! AES-256-GCM with a key derived from the host name and user name, so a copied
//! settings file does not carry a usable credential to another machine.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;
const KEY_SALT: &[u8] = b"storefront-assistant-credential-v1";

fn machine_cipher() -> Result<Aes256Gcm, String> {
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
    let username = whoami::username();

    let mut hasher = Sha256::new();
    hasher.update(KEY_SALT);
    hasher.update(hostname.as_bytes());
    hasher.update(b":");
    hasher.update(username.as_bytes());
    let key = hasher.finalize();

    Aes256Gcm::new_from_slice(&key).map_err(|e| format!("Failed to create cipher: {}", e))
}

/// Seal a credential. The output is base64 of `nonce || ciphertext`.
pub fn seal(plaintext: &str) -> Result<String, String> {
    let cipher = machine_cipher()?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill(&mut nonce_bytes);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|e| format!("Encryption failed: {}", e))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + sealed.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&sealed);
    Ok(BASE64.encode(&combined))
}

/// Open a value produced by [`seal`] on this machine.
pub fn open(sealed: &str) -> Result<String, String> {
    let cipher = machine_cipher()?;

    let combined = BASE64
        .decode(sealed)
        .map_err(|e| format!("Failed to decode base64: {}", e))?;
    if combined.len() < NONCE_SIZE {
        return Err("Sealed credential too short".to_string());
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| format!("Decryption failed: {}", e))?;

    String::from_utf8(plaintext).map_err(|e| format!("Invalid UTF-8 in credential: {}", e))
}
