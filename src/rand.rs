//! Deterministic randomness for handlers.
//!
//! Replays of the same invocation must observe the same random values, so the
//! generator is seeded from the invocation id ([`crate::Input::random_seed`])
//! rather than from entropy. SDKs must not expose it while
//! [`crate::VM::is_inside_side_effect`] returns true.

use std::fmt::Write;

#[cfg(feature = "sha2_random_seed")]
pub(crate) fn compute_random_seed(id: &[u8]) -> u64 {
    use bytes::Buf;
    use sha2::{Digest, Sha256};

    let id_hash = Sha256::digest(id);
    let mut b = id_hash.as_slice();
    b.get_u64()
}

#[cfg(not(feature = "sha2_random_seed"))]
pub(crate) fn compute_random_seed(id: &[u8]) -> u64 {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// xoshiro256++ generator with a splitmix64-expanded seed. The algorithm
/// must never change: replayed invocations have to observe the same values
/// the first execution did.
#[derive(Debug, Clone)]
pub struct Random {
    state: [u64; 4],
}

impl Random {
    pub fn new(seed: u64) -> Self {
        // splitmix64, as recommended for seeding the xoshiro family.
        let mut sm_state = seed;
        let mut next = || {
            sm_state = sm_state.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = sm_state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            z ^ (z >> 31)
        };
        Self {
            state: [next(), next(), next(), next()],
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = self.state[0]
            .wrapping_add(self.state[3])
            .rotate_left(23)
            .wrapping_add(self.state[0]);

        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);

        result
    }

    /// Uniformly distributed in `[0, 1)`, using the upper 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Random (version 4) UUID, hyphenated lowercase hex.
    pub fn uuid_v4(&mut self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.next_u64().to_le_bytes());
        bytes[8..].copy_from_slice(&self.next_u64().to_le_bytes());
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;

        let mut out = String::with_capacity(36);
        for (i, b) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                out.push('-');
            }
            write!(&mut out, "{b:02x}").expect("writing to a String cannot fail");
        }
        out
    }
}
