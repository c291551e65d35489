use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

const NONCE_LEN: usize = 12;

/// AES-256-GCM for secrets at rest (provider tokens, TOTP seeds).
/// Output is `base64(nonce || ciphertext)` with a fresh random nonce each call.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build from a 64-character hex key.
    pub fn from_hex(key: &SecretString) -> Result<Self, anyhow::Error> {
        let bytes = hex::decode(key.expose_secret().trim())
            .map_err(|e| anyhow::anyhow!("Invalid TOKEN_ENCRYPTION_KEY hex: {}", e))?;
        if bytes.len() != 32 {
            return Err(anyhow::anyhow!(
                "TOKEN_ENCRYPTION_KEY must be 64 hex chars (32 bytes), got {} bytes",
                bytes.len()
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, anyhow::Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, anyhow::Error> {
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Invalid ciphertext encoding: {}", e))?;
        if blob.len() <= NONCE_LEN {
            return Err(anyhow::anyhow!("Ciphertext too short"));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("Plaintext is not UTF-8: {}", e))
    }
}
