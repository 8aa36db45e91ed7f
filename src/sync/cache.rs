// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The per-candidate sync cache: a previously-sent bloom filter range, kept around so an
//! introduction-request can reuse it instead of recomputing and resending the same filter.

use crate::bloom::BloomFilter;
use std::net::SocketAddr;

/// A reusable bloom-filter range offered to (or claimed from) one candidate.
///
/// Grounded on `_claim_sync_bloom_filter_largest`/`_modulo`'s reuse check in
/// `original_source/community.py`: a filter is reused until it has either been sent too many
/// times or stopped producing any useful replies.
#[derive(Clone, Debug)]
pub struct SyncCache {
    pub candidate: SocketAddr,
    pub time_low: i64,
    pub time_high: i64,
    pub modulo: u32,
    pub offset: u32,
    pub bloom_filter: BloomFilter,
    pub times_used: u32,
    pub responses_received: u32,
}

/// A cache entry is discarded once reused 100 times, or once it has been reused at least once
/// and produced no responses at all — matching the Python original's `TIMES_USED` cap.
pub const REUSE_CAP: u32 = 100;

impl SyncCache {
    pub fn new(
        candidate: SocketAddr,
        time_low: i64,
        time_high: i64,
        modulo: u32,
        offset: u32,
        bloom_filter: BloomFilter,
    ) -> Self {
        Self {
            candidate,
            time_low,
            time_high,
            modulo,
            offset,
            bloom_filter,
            times_used: 0,
            responses_received: 0,
        }
    }

    /// Records one more use of this cache entry (one more introduction-request sent carrying it).
    pub fn mark_used(&mut self) {
        self.times_used += 1;
    }

    /// Records a sync response attributable to this cache entry.
    pub fn record_response(&mut self) {
        self.responses_received += 1;
    }

    /// Whether this entry should be discarded rather than reused again.
    pub fn is_exhausted(&self) -> bool {
        self.times_used >= REUSE_CAP || (self.times_used > 0 && self.responses_received == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::DEFAULT_ERROR_RATE;

    fn cache() -> SyncCache {
        SyncCache::new(
            "127.0.0.1:1234".parse().unwrap(),
            1,
            100,
            1,
            0,
            BloomFilter::new(800, DEFAULT_ERROR_RATE, 0),
        )
    }

    #[test]
    fn fresh_cache_is_not_exhausted() {
        assert!(!cache().is_exhausted());
    }

    #[test]
    fn exhausted_after_reuse_cap() {
        let mut entry = cache();
        for _ in 0..REUSE_CAP {
            entry.mark_used();
            entry.record_response();
        }
        assert!(entry.is_exhausted());
    }

    #[test]
    fn exhausted_after_one_reuse_with_no_response() {
        let mut entry = cache();
        entry.mark_used();
        assert!(entry.is_exhausted());
    }

    #[test]
    fn not_exhausted_before_first_reuse_even_with_no_responses_yet() {
        let entry = cache();
        assert_eq!(entry.times_used, 0);
        assert!(!entry.is_exhausted());
    }
}
