//! Blowfish in 64-bit cipher feedback mode
//!
//! Each direction of a tunnel keeps its own context. The keystream position
//! carries over from one message to the next, so both ends must process
//! exactly the same bytes in the same order.

use crate::{Error, Result};
use blowfish::Blowfish;
use cfb_mode::cipher::InnerIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

/// Fixed initialization vector, "Time4Bed"
pub const IV: [u8; 8] = [0x54, 0x69, 0x6d, 0x65, 0x34, 0x42, 0x65, 0x64];

/// Longest Blowfish key in bytes (576 bits)
pub const MAX_KEY_BYTES: usize = 72;

fn keyed_blowfish(key: &[u8]) -> Result<Blowfish> {
    if key.is_empty() || key.len() > MAX_KEY_BYTES {
        return Err(Error::Protocol(format!(
            "invalid Blowfish key length: {} bytes",
            key.len()
        )));
    }

    // The bcrypt entry points accept the full 72-byte key range
    let mut cipher: Blowfish = Blowfish::bc_init_state();
    cipher.bc_expand_key(key);
    Ok(cipher)
}

/// Encrypting half of a cipher context
pub struct Encryptor {
    inner: BufEncryptor<Blowfish>,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let inner = BufEncryptor::inner_iv_slice_init(keyed_blowfish(key)?, &IV)
            .map_err(|_| Error::Protocol("invalid CFB initialization vector".to_string()))?;
        Ok(Self { inner })
    }

    /// Encrypt `data` in place, continuing the keystream
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.encrypt(data);
    }
}

/// Decrypting half of a cipher context
pub struct Decryptor {
    inner: BufDecryptor<Blowfish>,
}

impl Decryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let inner = BufDecryptor::inner_iv_slice_init(keyed_blowfish(key)?, &IV)
            .map_err(|_| Error::Protocol("invalid CFB initialization vector".to_string()))?;
        Ok(Self { inner })
    }

    /// Decrypt `data` in place, continuing the keystream
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.decrypt(data);
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Encryptor(Blowfish-CFB64)")
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Decryptor(Blowfish-CFB64)")
    }
}

/// Independent encrypt and decrypt contexts for one key
pub fn cipher_pair(key: &[u8]) -> Result<(Encryptor, Decryptor)> {
    Ok((Encryptor::new(key)?, Decryptor::new(key)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x97, 0xd7, 0xbf, 0xa4, 0x0c, 0x1f, 0x26, 0xbd, 0x0b, 0xa4, 0x62, 0x57, 0xb6, 0x95, 0x59,
        0x37,
    ];

    #[test]
    fn test_cfb64_known_answer_across_messages() {
        let mut enc = Encryptor::new(&KEY).unwrap();

        let mut first = *b"hello";
        let mut second = *b", tunnel world";
        enc.apply(&mut first);
        enc.apply(&mut second);

        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);
        assert_eq!(hex::encode(stream), "fd9206bf4f1546cb4e1b26c7e6fec05fd3927d");
    }

    #[test]
    fn test_decrypt_with_different_chunking() {
        let (mut enc, _) = cipher_pair(&KEY).unwrap();
        let (_, mut dec) = cipher_pair(&KEY).unwrap();

        let plain: Vec<u8> = (0..100u8).collect();
        let mut data = plain.clone();
        enc.apply(&mut data[..3]);
        enc.apply(&mut data[3..50]);
        enc.apply(&mut data[50..]);

        for chunk in data.chunks_mut(7) {
            dec.apply(chunk);
        }
        assert_eq!(data, plain);
    }

    #[test]
    fn test_key_length_limits() {
        assert!(Encryptor::new(&[]).is_err());
        assert!(Encryptor::new(&[1u8; MAX_KEY_BYTES]).is_ok());
        assert!(Decryptor::new(&[1u8; MAX_KEY_BYTES + 1]).is_err());
    }
}
