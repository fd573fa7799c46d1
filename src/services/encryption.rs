use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

#[derive(thiserror::Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,
}

/// Normalizes a deployment secret of any length into an AES-256 key.
pub fn derive_key(root_secret: &str) -> [u8; 32] {
    let hash = digest::digest(&digest::SHA256, root_secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(hash.as_ref());
    key
}

/// AES-256-GCM sealing of credential tokens.
///
/// Format: [nonce (12 bytes)][ciphertext + auth tag]. Built once at startup
/// from the root secret and shared read-only afterwards.
///
/// `aad` is authenticated but not stored: a ciphertext only opens with the
/// same associated data it was sealed with, which is how a sealed token is
/// bound to the row that owns it.
pub struct TokenCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl TokenCipher {
    pub fn from_root_secret(root_secret: &str) -> Result<Self, EncryptionError> {
        Self::from_key(&derive_key(root_secret))
    }

    pub fn from_key(key: &[u8; 32]) -> Result<Self, EncryptionError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| EncryptionError::EncryptionFailed("Key rejected".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str, aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| EncryptionError::EncryptionFailed("Failed to generate nonce".to_string()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| EncryptionError::EncryptionFailed("Sealing failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);

        Ok(sealed)
    }

    /// Fails on any modification of the sealed bytes, a different key or
    /// different associated data.
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<String, EncryptionError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(EncryptionError::InvalidFormat);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| EncryptionError::DecryptionFailed("Opening failed".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| EncryptionError::DecryptionFailed("Invalid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher { .. }")
    }
}
