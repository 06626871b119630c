//! Cryptographic primitives for ZBD tunnels
//!
//! This module provides:
//! - The ZBD hash (SHA-1 with an un-rotated message schedule)
//! - Diffie-Hellman over hex-encoded big integers, with built-in defaults
//! - Identity hashes for public keys
//! - Session key derivation from nonces and the shared secret
//! - Blowfish CFB-64 encrypt/decrypt contexts
//! - Private key sources (CSPRNG or external command)
//! - Challenge-response helpers

mod cipher;
mod dh;
mod hash;
mod kdf;
mod keys;

pub use cipher::{cipher_pair, Decryptor, Encryptor, IV, MAX_KEY_BYTES};
pub use dh::{
    canonical_generator, canonical_hex, canonical_modulus, diffie_hellman, identity_hash,
    public_identity, public_key, validate_hex, DEFAULT_GENERATOR, DEFAULT_MODULUS, MAX_NUM_LENGTH,
};
pub use hash::{ZbdHash, DIGEST_LEN};
pub use kdf::{blowfish_key, generate_session_key};
pub use keys::{generate_private_key, CommandKeySource, KeySource, RandomKeySource};

use crate::{Error, Result};
use rand::RngCore;

/// Length of a handshake nonce in bytes
pub const NONCE_SIZE: usize = 8;

/// Length of a challenge in bytes
pub const CHALLENGE_SIZE: usize = 4;

/// Every challenge byte is answered XORed with this value
pub const CHALLENGE_ANSWER: u8 = 42;

/// Length of a generated private key in bytes
pub const PRIVATE_KEY_LEN: usize = 20;

/// Fill `buf` from the system CSPRNG
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| Error::Protocol("system random generator failed".to_string()))
}

/// Per-connection nonce
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Random challenge for the challenge-response exchange
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Expected reply to `challenge`
pub fn challenge_answer(challenge: &[u8]) -> Vec<u8> {
    challenge.iter().map(|b| b ^ CHALLENGE_ANSWER).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_challenge_answer_is_involution() {
        for x in [[0u8; 4], [42, 42, 42, 42], [0xff, 0x00, 0x2a, 0x80], generate_challenge()] {
            assert_eq!(challenge_answer(&challenge_answer(&x)), x.to_vec());
        }
        assert_eq!(challenge_answer(&[0, 1]), vec![42, 43]);
    }
}
