// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! A fixed-bit Bloom filter sized to fit one introduction-request packet.
//!
//! The prefix byte is randomized per filter instance (not per key) so that two peers building a
//! filter over an overlapping packet set get decorrelated false positives — this is a cheap way
//! to avoid every peer in a community converging on the exact same false-negative-free-but-wrong
//! answer.

use rand::Rng;
use sha1::{Digest, Sha1};
use std::f64::consts::LN_2;

/// Default false-positive rate used when a community does not override it.
pub const DEFAULT_ERROR_RATE: f64 = 0.01;

/// MTU-derived default bit count for the sync bloom filter, per spec:
/// `(1500 - 60 - 8 - 51 - sig_len - 21 - 30) * 8`, rounded down to a multiple of 8.
///
/// `sig_len` varies with the signer's key (typically 60 bytes); we use that typical value here
/// as the crate-wide default. Callers with a different signature length should compute their own
/// bit count with [`mtu_bits`].
pub fn mtu_bits(sig_len: usize) -> usize {
    let bytes = 1500usize
        .saturating_sub(60)
        .saturating_sub(8)
        .saturating_sub(51)
        .saturating_sub(sig_len)
        .saturating_sub(21)
        .saturating_sub(30);
    bytes * 8
}

/// A fixed-size Bloom filter with a randomized one-byte prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
    prefix: u8,
}

impl BloomFilter {
    /// Creates an empty filter. `bits` must be a multiple of 8, and `error_rate` is used only to
    /// choose the number of hash functions, not the size (size is given explicitly).
    pub fn new(bits: usize, error_rate: f64, prefix: u8) -> Self {
        assert!(bits % 8 == 0, "bloom filter bit count must be a multiple of 8");
        let num_bits = bits.max(8);
        let num_hashes = optimal_hash_count(num_bits, error_rate);
        Self {
            bits: vec![0u8; num_bits / 8],
            num_bits,
            num_hashes,
            prefix,
        }
    }

    /// Creates an empty filter with a random prefix byte, sized by the MTU budget for the given
    /// signature length.
    pub fn for_mtu(sig_len: usize, error_rate: f64) -> Self {
        let prefix = rand::thread_rng().gen();
        Self::new(mtu_bits(sig_len), error_rate, prefix)
    }

    /// The number of distinct keys this filter can hold while keeping `error_rate` false
    /// positives, given this filter's bit count.
    pub fn capacity(&self, error_rate: f64) -> usize {
        let m = self.num_bits as f64;
        let n = m * LN_2 * LN_2 / (-error_rate.ln());
        n.floor().max(1.0) as usize
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len()
    }

    pub fn add(&mut self, key: &[u8]) {
        for index in self.indices(key) {
            let byte = index / 8;
            let bit = index % 8;
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn add_keys<'a, I: IntoIterator<Item = &'a [u8]>>(&mut self, keys: I) {
        for key in keys {
            self.add(key);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.indices(key).all(|index| {
            let byte = index / 8;
            let bit = index % 8;
            self.bits[byte] & (1 << bit) != 0
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 1);
        out.push(self.prefix);
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8], error_rate: f64) -> Option<Self> {
        let (&prefix, rest) = bytes.split_first()?;
        let num_bits = rest.len() * 8;
        if num_bits == 0 {
            return None;
        }
        Some(Self {
            bits: rest.to_vec(),
            num_bits,
            num_hashes: optimal_hash_count(num_bits, error_rate),
            prefix,
        })
    }

    /// Kirsch-Mitzenmacher double hashing: derive `num_hashes` bit indices from two independent
    /// SHA-1 digests of `prefix || key`, instead of computing `num_hashes` separate hashes.
    fn indices<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let mut hasher = Sha1::new();
        hasher.update([self.prefix]);
        hasher.update(key);
        let digest = hasher.finalize();

        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());

        let num_bits = self.num_bits as u64;
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % num_bits) as usize
        })
    }
}

fn optimal_hash_count(num_bits: usize, error_rate: f64) -> u32 {
    let k = -(error_rate.ln() / LN_2);
    (k.round() as i64).clamp(1, 32) as u32
}
