//! Cryptographic primitives
//!
//! This module provides:
//! - AES-128-CTR carrier ciphers (one continuously-keyed stream per
//!   direction)
//! - 16-byte symmetric key handling with base64 config encoding
//! - Random byte generation
//!
//! There is no key exchange here: the two direction keys are supplied by
//! the operator and the carrier starts encrypting from byte zero.

mod ctr;
mod keys;

pub use ctr::CarrierCipher;
pub use keys::{CipherKey, KeyPair};

use rand::RngCore;
use thiserror::Error;

/// Length of a carrier key in bytes (AES-128).
pub const KEY_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid key encoding: {0}")]
    KeyEncoding(String),
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
