//! Carrier key handling

use super::{random_bytes, CryptoError, KEY_LEN};
use std::fmt;

/// The two direction keys of a carrier link. `client_to_server` encrypts
/// what the minor (connecting) side sends; `server_to_client` encrypts
/// what the major (accepting) side sends.
#[derive(Clone)]
pub struct KeyPair {
    pub client_to_server: CipherKey,
    pub server_to_client: CipherKey,
}

impl KeyPair {
    /// Generate a fresh random pair
    pub fn generate() -> Self {
        Self {
            client_to_server: CipherKey::generate(),
            server_to_client: CipherKey::generate(),
        }
    }
}

/// A 16-byte AES key, stored base64 in configuration files.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        random_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode as base64 (be careful with this!)
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherKey([REDACTED])")
    }
}

// Zeroize key material on drop
impl Drop for CipherKey {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_round_trip() {
        let key = CipherKey::generate();
        let b64 = key.to_base64();
        let recovered = CipherKey::from_base64(&b64).unwrap();
        assert_eq!(key, recovered);
    }

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            CipherKey::from_bytes(&[0u8; 8]),
            Err(CryptoError::InvalidKeyLength)
        ));
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 8]);
        assert!(CipherKey::from_base64(&short).is_err());
        assert!(CipherKey::from_base64("not base64!!").is_err());
    }

    #[test]
    fn test_generated_pairs_differ() {
        let pair = KeyPair::generate();
        assert_ne!(pair.client_to_server, pair.server_to_client);
    }
}
