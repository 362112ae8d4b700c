use blowfish::Blowfish;

use ::cipher::generic_array::GenericArray;
use ::cipher::{BlockCipher, NewBlockCipher};

use crate::error::{ErrorKind, NetResult};

/// Width of one cipher block in bytes.
pub const BLOCK_SIZE: usize = 8;
/// Shortest key accepted by the key schedule.
pub const MIN_KEY_SIZE: usize = 1;
/// Longest key accepted by the key schedule (448 bits).
pub const MAX_KEY_SIZE: usize = 56;

// Shortest key `Blowfish::new_varkey` accepts.
const VARKEY_MIN_SIZE: usize = 4;

/// A Blowfish key schedule together with the padding pipeline that maps
/// arbitrary-length payloads onto whole cipher blocks.
///
/// Payloads are padded with 1 to 8 trailing bytes, each holding the padding
/// count, so the padding is self-describing and always present. The cipher
/// runs in ECB mode over the padded buffer.
pub struct Cipher {
    context: Blowfish,
}

impl Cipher {
    /// Derives a key schedule from `key`. Fails with `Cipher` when the key
    /// length is outside `MIN_KEY_SIZE..=MAX_KEY_SIZE`.
    pub fn new(key: &[u8]) -> NetResult<Cipher> {
        if key.len() < MIN_KEY_SIZE || key.len() > MAX_KEY_SIZE {
            return Err(ErrorKind::Cipher);
        }

        // The schedule consumes key bytes cyclically, so a key repeated to a
        // whole multiple of its length derives the identical schedule. That
        // bridges keys below the four-byte floor of `new_varkey`.
        let expanded;
        let key = if key.len() < VARKEY_MIN_SIZE {
            let repeats = (VARKEY_MIN_SIZE + key.len() - 1) / key.len();
            expanded = key.repeat(repeats);
            &expanded[..]
        } else {
            key
        };

        let context = Blowfish::new_varkey(key).map_err(|_| ErrorKind::Cipher)?;
        Ok(Cipher { context })
    }

    /// Encrypts `payload` into a freshly allocated buffer of
    /// `payload.len() + pad` bytes, where `pad` is in `1..=8`.
    pub fn encrypt(&self, payload: &[u8]) -> NetResult<Vec<u8>> {
        let pad = BLOCK_SIZE - payload.len() % BLOCK_SIZE;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(payload.len() + pad)
            .map_err(|_| ErrorKind::Cipher)?;
        buffer.extend_from_slice(payload);
        buffer.resize(payload.len() + pad, pad as u8);

        for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
            self.context.encrypt_block(GenericArray::from_mut_slice(block));
        }

        Ok(buffer)
    }

    /// Decrypts `buffer` in place and validates the trailing padding. Returns
    /// the payload length with the padding stripped; the stripped tail is
    /// zeroed. Fails with `Cipher` on empty or misaligned input and on a
    /// padding byte outside `1..=8`.
    pub fn decrypt(&self, buffer: &mut [u8]) -> NetResult<usize> {
        if buffer.is_empty() || buffer.len() % BLOCK_SIZE != 0 {
            return Err(ErrorKind::Cipher);
        }

        for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
            self.context.decrypt_block(GenericArray::from_mut_slice(block));
        }

        let pad = buffer[buffer.len() - 1] as usize;

        if pad < 1 || pad > BLOCK_SIZE {
            return Err(ErrorKind::Cipher);
        }

        let length = buffer.len() - pad;

        for byte in &mut buffer[length..] {
            *byte = 0;
        }

        Ok(length)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Cipher { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};

    const KEY: &[u8] = b"secret";
    const PAYLOAD_SAMPLE: &[u8] = b"abcdefghijklmnopqrstuvwxyz!@#$%^&*()1234567890";

    #[test]
    fn test_roundtrip_all_small_lengths() {
        let cipher = Cipher::new(KEY).unwrap();

        for len in 0..=96 {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let mut encrypted = cipher.encrypt(&payload).unwrap();

            let pad = encrypted.len() - payload.len();
            assert!(pad >= 1 && pad <= BLOCK_SIZE);
            assert_eq!(encrypted.len() % BLOCK_SIZE, 0);

            let stripped = cipher.decrypt(&mut encrypted).unwrap();

            assert_eq!(stripped, payload.len());
            assert_eq!(&encrypted[..stripped], &payload[..]);
        }
    }

    #[test]
    fn test_roundtrip_all_key_lengths() {
        let payload = b"abcdefghijklmnopqrstuvwxyz!@#$%^&*()1234567890";

        for key_len in MIN_KEY_SIZE..=MAX_KEY_SIZE {
            let key: Vec<u8> = (1..=key_len).map(|i| i as u8).collect();
            let cipher = Cipher::new(&key).unwrap();

            let mut encrypted = cipher.encrypt(&payload[..]).unwrap();

            assert_eq!(encrypted.len(), 48);
            assert_ne!(&encrypted[..payload.len()], &payload[..]);

            let stripped = cipher.decrypt(&mut encrypted).unwrap();

            assert_eq!(&encrypted[..stripped], &payload[..]);
        }
    }

    #[test]
    fn test_padding_fills_a_whole_block_on_aligned_input() {
        let cipher = Cipher::new(KEY).unwrap();

        let mut encrypted = cipher.encrypt(&[7u8; 16]).unwrap();

        assert_eq!(encrypted.len(), 24);

        let stripped = cipher.decrypt(&mut encrypted).unwrap();

        assert_eq!(stripped, 16);
        // the stripped tail is zeroed
        assert_eq!(&encrypted[16..], &[0u8; 8]);
    }

    #[test]
    fn test_rejects_out_of_range_keys() {
        assert_eq!(Cipher::new(b"").unwrap_err(), ErrorKind::Cipher);
        assert_eq!(Cipher::new(&[1u8; 57]).unwrap_err(), ErrorKind::Cipher);
    }

    #[test]
    fn test_short_keys_derive_the_cyclic_schedule() {
        // a repeated key cycles into the same schedule, so ciphertexts match
        for (short, cycled) in &[
            (&b"x"[..], &b"xxxx"[..]),
            (&b"xy"[..], &b"xyxy"[..]),
            (&b"xyz"[..], &b"xyzxyz"[..]),
        ] {
            let encrypted = Cipher::new(short).unwrap().encrypt(PAYLOAD_SAMPLE).unwrap();
            let expected = Cipher::new(cycled).unwrap().encrypt(PAYLOAD_SAMPLE).unwrap();

            assert_eq!(encrypted, expected);
        }
    }

    #[test]
    fn test_rejects_misaligned_ciphertext() {
        let cipher = Cipher::new(KEY).unwrap();

        assert_eq!(cipher.decrypt(&mut []).unwrap_err(), ErrorKind::Cipher);
        assert_eq!(cipher.decrypt(&mut [0u8; 7]).unwrap_err(), ErrorKind::Cipher);
        assert_eq!(cipher.decrypt(&mut [0u8; 12]).unwrap_err(), ErrorKind::Cipher);
    }

    #[test]
    fn test_rejects_invalid_padding() {
        let cipher = Cipher::new(KEY).unwrap();

        // Forge ciphertext blocks whose decrypted last byte is out of range.
        for bad_pad in &[0u8, 9, 255] {
            let mut block = [0u8; BLOCK_SIZE];
            block[BLOCK_SIZE - 1] = *bad_pad;

            cipher
                .context
                .encrypt_block(GenericArray::from_mut_slice(&mut block));

            assert_eq!(cipher.decrypt(&mut block).unwrap_err(), ErrorKind::Cipher);
        }
    }

    quickcheck! {
        fn prop_roundtrip(payload: Vec<u8>, key: Vec<u8>) -> TestResult {
            if key.is_empty() {
                return TestResult::discard();
            }

            let key = &key[..key.len().min(MAX_KEY_SIZE)];
            let payload = &payload[..payload.len().min(4096)];

            let cipher = Cipher::new(key).unwrap();
            let mut encrypted = cipher.encrypt(payload).unwrap();

            let pad = encrypted.len() - payload.len();
            if pad < 1 || pad > BLOCK_SIZE {
                return TestResult::failed();
            }

            match cipher.decrypt(&mut encrypted) {
                Ok(stripped) => TestResult::from_bool(&encrypted[..stripped] == payload),
                Err(_) => TestResult::failed(),
            }
        }
    }
}
