//! Continuous AES-128-CTR stream for one carrier direction

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;

use super::CipherKey;

/// One direction's cipher stream. Keyed once with a zero IV and advanced
/// across the whole transport lifetime; it is never reset per frame, so a
/// single dropped or duplicated transport byte corrupts everything after
/// it. Both ends must construct their streams from the same keys in
/// mirrored orientation.
pub struct CarrierCipher {
    inner: Ctr128BE<Aes128>,
}

impl CarrierCipher {
    pub fn new(key: &CipherKey) -> Self {
        let iv = [0u8; 16];
        Self {
            inner: Ctr128BE::<Aes128>::new(key.as_bytes().into(), (&iv).into()),
        }
    }

    /// Encrypt or decrypt `data` in place, advancing the keystream.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> CipherKey {
        CipherKey::from_bytes(&[byte; 16]).unwrap()
    }

    #[test]
    fn test_known_keystream() {
        // First keystream block under an all-zero key and zero IV is the
        // AES-128 encryption of the zero block (AESAVS known answer).
        let mut cipher = CarrierCipher::new(&key(0));
        let mut block = [0u8; 16];
        cipher.apply(&mut block);
        assert_eq!(
            block,
            [
                0x66, 0xe9, 0x4b, 0xd4, 0xef, 0x8a, 0x2c, 0x3b, 0x88, 0x4c, 0xfa, 0x59, 0xca,
                0x34, 0x2b, 0x2e
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let mut enc = CarrierCipher::new(&key(7));
        let mut dec = CarrierCipher::new(&key(7));
        let mut data = b"multiplexed carrier traffic".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data[..], b"multiplexed carrier traffic");
        dec.apply(&mut data);
        assert_eq!(&data[..], b"multiplexed carrier traffic");
    }

    #[test]
    fn test_stream_continuity_across_chunks() {
        // Applying the stream in arbitrary chunk sizes must equal one pass.
        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();

        let mut whole = payload.clone();
        CarrierCipher::new(&key(3)).apply(&mut whole);

        let mut chunked = payload;
        let mut cipher = CarrierCipher::new(&key(3));
        let mut offset = 0;
        for size in [1, 15, 16, 17, 100, 851] {
            cipher.apply(&mut chunked[offset..offset + size]);
            offset += size;
        }
        assert_eq!(offset, chunked.len());
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut a = CarrierCipher::new(&key(1));
        let mut b = CarrierCipher::new(&key(2));
        let mut x = [0xAAu8; 32];
        let mut y = [0xAAu8; 32];
        a.apply(&mut x);
        b.apply(&mut y);
        assert_ne!(x, y);
    }
}
