use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Compute HMAC-SHA256 over a sequence of message parts.
///
/// Providers sign different canonical concatenations (raw body, versioned
/// timestamp prefixes, method+URI+body), so callers pass the parts and we
/// feed them to the MAC in order without building an intermediate buffer.
pub fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// HMAC-SHA256, hex-encoded (GitHub, Slack).
pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    hex::encode(hmac_sha256(secret, parts))
}

/// HMAC-SHA256, base64-encoded (Shopify, HubSpot v3).
pub fn hmac_sha256_base64(secret: &[u8], parts: &[&[u8]]) -> String {
    BASE64.encode(hmac_sha256(secret, parts))
}

/// Constant-time equality for signature comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Generate a fresh verification token: 32 random bytes (256 bits of
/// entropy), hex-encoded.
pub fn generate_verification_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key must be 32 hex-encoded bytes")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,
    #[error("invalid ciphertext: {0}")]
    InvalidData(String),
}

/// AES-256-GCM envelope cipher for verification tokens at rest.
///
/// The token is a shared secret with the provider, so the trigger row never
/// stores it in the clear. Stored format: `hex(nonce || ciphertext || tag)`.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&key).expect("valid key size");
        Self { cipher }
    }

    /// Build a cipher from a hex-encoded 32-byte key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(key_hex).map_err(|_| CipherError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CipherError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// Generate a random key. Tokens encrypted with a generated key are
    /// unreadable after a restart, so production deployments configure a key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend(ciphertext);
        Ok(hex::encode(output))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let data = hex::decode(stored)
            .map_err(|e| CipherError::InvalidData(format!("not hex: {e}")))?;
        if data.len() < NONCE_SIZE {
            return Err(CipherError::InvalidData("missing nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::DecryptionFailed)?;
        String::from_utf8(plaintext)
            .map_err(|_| CipherError::InvalidData("not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha256_hex_known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let sig = hmac_sha256_hex(b"Jefe", &[b"what do ya want for nothing?"]);
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_parts_equivalent_to_concatenation() {
        let joined = hmac_sha256_hex(b"secret", &[b"v0:12345:{\"a\":1}"]);
        let parts = hmac_sha256_hex(b"secret", &[b"v0:", b"12345", b":", b"{\"a\":1}"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_hmac_sha256_base64_matches_hex() {
        let raw = hmac_sha256(b"hush", &[br#"{"id":1}"#]);
        assert_eq!(hmac_sha256_base64(b"hush", &[br#"{"id":1}"#]), BASE64.encode(&raw));
        assert_eq!(hmac_sha256_hex(b"hush", &[br#"{"id":1}"#]), hex::encode(&raw));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_verification_token_shape() {
        let token = generate_verification_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_verification_token());
    }

    #[test]
    fn test_cipher_roundtrip() {
        let cipher = TokenCipher::generate();
        let token = generate_verification_token();
        let stored = cipher.encrypt(&token).unwrap();
        assert_ne!(stored, token);
        assert_eq!(cipher.decrypt(&stored).unwrap(), token);
    }

    #[test]
    fn test_cipher_nonce_randomized() {
        let cipher = TokenCipher::generate();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cipher_rejects_wrong_key_and_tampering() {
        let cipher = TokenCipher::generate();
        let stored = cipher.encrypt("secret").unwrap();

        let other = TokenCipher::generate();
        assert!(matches!(other.decrypt(&stored), Err(CipherError::DecryptionFailed)));

        let mut tampered = hex::decode(&stored).unwrap();
        *tampered.last_mut().unwrap() ^= 0xff;
        assert!(matches!(
            cipher.decrypt(&hex::encode(tampered)),
            Err(CipherError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_cipher_from_hex_validates_key() {
        assert!(TokenCipher::from_hex("deadbeef").is_err());
        assert!(TokenCipher::from_hex(&"ab".repeat(32)).is_ok());
    }
}
