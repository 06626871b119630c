//! ZBD hash
//!
//! SHA-1 input padding, state, round functions and constants, but the
//! message schedule is expanded without the one-bit left rotation:
//!
//! ```text
//! w[i] = w[i-3] ^ w[i-8] ^ w[i-14] ^ w[i-16]
//! ```
//!
//! This is the original SHA (SHA-0) algorithm. Peers derive keys and
//! identities with it, so it must not be replaced by SHA-1.

/// Digest length in bytes
pub const DIGEST_LEN: usize = 20;

const BLOCK_LEN: usize = 64;

const INITIAL_STATE: [u32; 5] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0];

/// Incremental ZBD hash
#[derive(Clone)]
pub struct ZbdHash {
    state: [u32; 5],
    block: [u8; BLOCK_LEN],
    block_len: usize,
    total_len: u64,
}

impl ZbdHash {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            block: [0u8; BLOCK_LEN],
            block_len: 0,
            total_len: 0,
        }
    }

    /// Absorb `data`
    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len = self.total_len.wrapping_add(data.len() as u64);

        while !data.is_empty() {
            let take = (BLOCK_LEN - self.block_len).min(data.len());
            self.block[self.block_len..self.block_len + take].copy_from_slice(&data[..take]);
            self.block_len += take;
            data = &data[take..];

            if self.block_len == BLOCK_LEN {
                compress(&mut self.state, &self.block);
                self.block_len = 0;
            }
        }
    }

    /// Pad, process the final block(s) and return the digest
    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let bit_len = self.total_len.wrapping_mul(8);

        let mut padding = [0u8; BLOCK_LEN + 8];
        padding[0] = 0x80;
        let pad_len = if self.block_len < 56 {
            56 - self.block_len
        } else {
            BLOCK_LEN + 56 - self.block_len
        };
        padding[pad_len..pad_len + 8].copy_from_slice(&bit_len.to_be_bytes());

        // update() would count the padding into total_len; it is already captured
        let tail = &padding[..pad_len + 8];
        let mut offset = 0;
        while offset < tail.len() {
            let take = (BLOCK_LEN - self.block_len).min(tail.len() - offset);
            self.block[self.block_len..self.block_len + take]
                .copy_from_slice(&tail[offset..offset + take]);
            self.block_len += take;
            offset += take;
            if self.block_len == BLOCK_LEN {
                compress(&mut self.state, &self.block);
                self.block_len = 0;
            }
        }

        let mut digest = [0u8; DIGEST_LEN];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(self.state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        digest
    }

    /// One-shot digest of the concatenation of `parts`
    pub fn digest(parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
        let mut hash = Self::new();
        for part in parts {
            hash.update(part);
        }
        hash.finalize()
    }
}

impl Default for ZbdHash {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(state: &mut [u32; 5], block: &[u8; BLOCK_LEN]) {
    let mut w = [0u32; 80];
    for (i, chunk) in block.chunks_exact(4).enumerate() {
        w[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    for i in 16..80 {
        // No rotate here
        w[i] = w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16];
    }

    let [mut a, mut b, mut c, mut d, mut e] = *state;

    for (i, wi) in w.iter().enumerate() {
        let (f, k) = match i {
            0..=19 => ((b & c) | (!b & d), 0x5A82_7999),
            20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
            40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
            _ => (b ^ c ^ d, 0xCA62_C1D6),
        };

        let temp = a
            .rotate_left(5)
            .wrapping_add(f)
            .wrapping_add(e)
            .wrapping_add(k)
            .wrapping_add(*wi);
        e = d;
        d = c;
        c = b.rotate_left(30);
        b = a;
        a = temp;
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
    state[4] = state[4].wrapping_add(e);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_digest(data: &[u8]) -> String {
        hex::encode(ZbdHash::digest(&[data]))
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(hex_digest(b""), "f96cea198ad1dd5617ac084a3d92c6107708c0ef");
        assert_eq!(hex_digest(b"abc"), "0164b8a914cd2a5e74c4f7ff082c4d97f1edf880");
        assert_eq!(
            hex_digest(&[b'a'; 100]),
            "36875316f4a0658b1f37cda3e4ca663c377bfcda"
        );
    }

    #[test]
    fn test_differs_from_sha1() {
        // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_ne!(hex_digest(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut hash = ZbdHash::new();
        for piece in data.chunks(37) {
            hash.update(piece);
        }

        assert_eq!(hash.finalize(), ZbdHash::digest(&[&data]));
    }
}
