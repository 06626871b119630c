//! Session key derivation
//!
//! The session key is built from 160-bit blocks. Block `n` is the ZBD hash
//! of both nonces followed by the ASCII shared secret starting at hex digit
//! `n * 40`, wrapped by the secret's length.

use super::hash::{ZbdHash, DIGEST_LEN};
use super::NONCE_SIZE;

const BLOCK_BITS: usize = DIGEST_LEN * 8;

/// Derive session key material for a negotiated key size in bits
///
/// The returned buffer covers `key_size` bits rounded up to a whole number
/// of digests. Unused trailing bytes are zero.
pub fn generate_session_key(
    client_nonce: &[u8; NONCE_SIZE],
    server_nonce: &[u8; NONCE_SIZE],
    shared_secret: &str,
    key_size: u16,
) -> Vec<u8> {
    let key_size = key_size as usize;
    let secret = shared_secret.as_bytes();
    let len = secret.len();

    let mut key = vec![0u8; (key_size / BLOCK_BITS + 1) * DIGEST_LEN];

    for bits in (0..key_size).step_by(BLOCK_BITS) {
        let mut nybbles = bits / 4;
        if nybbles > len && len > 0 {
            nybbles %= len;
        }

        let digest = ZbdHash::digest(&[client_nonce, server_nonce, &secret[nybbles.min(len)..]]);

        let offset = bits / 8;
        key[offset..offset + DIGEST_LEN].copy_from_slice(&digest);
    }

    key
}

/// Blowfish key for `key_size` bits of session key material
///
/// The size is rounded up to a multiple of 4 bits; a trailing half byte
/// keeps only its high nybble.
pub fn blowfish_key(session_key: &[u8], key_size: u16) -> Vec<u8> {
    let bits = (key_size as usize + 3) / 4 * 4;
    let len = ((bits + 7) / 8).min(session_key.len());

    let mut key = session_key[..len].to_vec();
    if bits % 8 != 0 {
        if let Some(last) = key.last_mut() {
            *last &= 0xf0;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_NONCE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    const SERVER_NONCE: [u8; 8] = [0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17];
    const SECRET: &str = "abcdef0123456789";

    #[test]
    fn test_known_answer_single_block() {
        let key = generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, SECRET, 128);
        assert_eq!(hex::encode(&key), "97d7bfa40c1f26bd0ba46257b6955937b38a87e9");
    }

    #[test]
    fn test_known_answer_wrapped_offset() {
        // Second block starts at hex digit 40, wrapped to 40 % 16 = 8
        let key = generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, SECRET, 320);
        assert_eq!(
            hex::encode(&key),
            concat!(
                "97d7bfa40c1f26bd0ba46257b6955937b38a87e9",
                "46718fedb38c93d166480f988c4ae760fc0d6001",
                "0000000000000000000000000000000000000000"
            )
        );
    }

    #[test]
    fn test_pure_function_of_inputs() {
        let base = generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, SECRET, 128);
        assert_eq!(base, generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, SECRET, 128));

        let mut other_nonce = CLIENT_NONCE;
        other_nonce[0] ^= 1;
        assert_ne!(base, generate_session_key(&other_nonce, &SERVER_NONCE, SECRET, 128));
        assert_ne!(base, generate_session_key(&CLIENT_NONCE, &other_nonce, SECRET, 128));
        assert_ne!(base, generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, "abcdef012345678a", 128));
        assert_ne!(
            blowfish_key(&base, 128),
            blowfish_key(&generate_session_key(&CLIENT_NONCE, &SERVER_NONCE, SECRET, 320), 320)
        );
    }

    #[test]
    fn test_blowfish_key_rounding() {
        let material: Vec<u8> = (0xA0..0xC8).collect();

        assert_eq!(blowfish_key(&material, 128).len(), 16);

        // 61 bits round to 64: exactly 8 bytes, no masking
        assert_eq!(blowfish_key(&material, 61), material[..8].to_vec());

        // 57 bits round to 60: 8 bytes with the last nybble cleared
        let key = blowfish_key(&material, 57);
        assert_eq!(key.len(), 8);
        assert_eq!(key[7], material[7] & 0xf0);
    }
}
