// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The sync engine: builds the `(time_low, time_high, modulo, offset, bloom_filter)` tuple
//! attached to an introduction-request's sync payload, per spec.md §4.4.
//!
//! Grounded directly on `original_source/community.py`'s `dispersy_claim_sync_bloom_filter_*`
//! family: a "largest" strategy that samples a pivot global time and picks whichever side of it
//! holds more syncable messages, truncating trailing same-global-time groups to fit one bloom
//! filter; and a "modulo" strategy that instead partitions the whole range by `global_time %
//! modulo` when the set is too large to cover any other way. Reuse of a previously claimed range
//! (`SyncCache`) is preferred over computing a fresh one when it is not yet exhausted.

use crate::bloom::BloomFilter;
use crate::sync::cache::{SyncCache, REUSE_CAP};
use crate::sync::store::{StoredMessage, SyncStore};
use crate::wire::CommunityId;
use crate::Result;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, trace};

/// The sync tuple to attach to an outgoing introduction-request.
#[derive(Clone, Debug)]
pub struct ClaimedRange {
    pub time_low: i64,
    pub time_high: i64,
    pub modulo: u32,
    pub offset: u32,
    pub bloom_filter: BloomFilter,
}

impl ClaimedRange {
    /// The degenerate range sent when a community has no syncable messages at all:
    /// `(1, acceptable_gt, 1, 0, <empty 8-bit filter>)`.
    fn degenerate(acceptable_gt: i64, error_rate: f64) -> Self {
        Self {
            time_low: 1,
            time_high: acceptable_gt.max(1),
            modulo: 1,
            offset: 0,
            bloom_filter: BloomFilter::new(8, error_rate, 0),
        }
    }
}

pub struct SyncEngine<S: SyncStore> {
    store: Arc<S>,
    error_rate: f64,
}

impl<S: SyncStore> SyncEngine<S> {
    pub fn new(store: Arc<S>, error_rate: f64) -> Self {
        Self { store, error_rate }
    }

    /// Produces a sync tuple for `community`, reusing `cache` if it is given, has already
    /// produced at least one response, and hasn't hit its reuse cap; otherwise computes a fresh
    /// claim, defaulting to the "largest" strategy and falling back to "modulo" only once the
    /// syncable set is too large for a single contiguous window to cover densely.
    pub async fn claim(
        &self,
        cache: Option<&mut SyncCache>,
        community: CommunityId,
        meta_ids: &[u64],
        acceptable_gt: i64,
        sig_len: usize,
    ) -> Result<ClaimedRange> {
        if let Some(entry) = cache {
            if entry.responses_received > 0 && entry.times_used < REUSE_CAP {
                entry.mark_used();
                trace!(candidate = %entry.candidate, times_used = entry.times_used, "reusing sync cache entry");
                return Ok(ClaimedRange {
                    time_low: entry.time_low,
                    time_high: entry.time_high,
                    modulo: entry.modulo,
                    offset: entry.offset,
                    bloom_filter: entry.bloom_filter.clone(),
                });
            }
            debug!(candidate = %entry.candidate, times_used = entry.times_used, responses_received = entry.responses_received, "discarding unproductive or exhausted sync cache entry");
        }

        let bloom = BloomFilter::for_mtu(sig_len, self.error_rate);
        let capacity = bloom.capacity(self.error_rate).max(1);
        let nr_sync_packets = self.store.nr_sync_packets(community, meta_ids).await?;

        // "largest" is the default (spec.md §4.4); a single contiguous window still covers the
        // syncable set densely as long as it's no more than a couple of filters' worth. Only once
        // the set has grown beyond that does a single window stop being dense enough, and we fall
        // back to partitioning the whole range by "modulo" instead.
        if nr_sync_packets <= capacity.saturating_mul(2) {
            self.claim_largest(community, meta_ids, acceptable_gt, sig_len).await
        } else {
            self.claim_modulo(community, meta_ids, acceptable_gt, sig_len).await
        }
    }

    /// Samples a pivot, bounds each side of it to at most one bloom filter's worth of messages,
    /// and returns whichever bounded selection is denser — `_claim_sync_bloom_filter_largest`
    /// plus `_select_bloomfilter_range`'s bounded-then-compare side selection. When there aren't
    /// even `capacity` syncable messages in total, skips the pivot split entirely and returns the
    /// oldest `capacity` messages ascending.
    pub async fn claim_largest(
        &self,
        community: CommunityId,
        meta_ids: &[u64],
        acceptable_gt: i64,
        sig_len: usize,
    ) -> Result<ClaimedRange> {
        let highest = self.store.highest_global_time(community).await?;
        if highest == 0 || acceptable_gt <= 1 {
            return Ok(ClaimedRange::degenerate(acceptable_gt, self.error_rate));
        }

        let bloom = BloomFilter::for_mtu(sig_len, self.error_rate);
        let capacity = bloom.capacity(self.error_rate).max(1);
        let nr_sync_packets = self.store.nr_sync_packets(community, meta_ids).await?;

        let (low, mut high, mut messages) = if nr_sync_packets < capacity {
            let messages = self.store.range(community, meta_ids, 1, acceptable_gt).await?;
            let high = messages.last().map(|m| m.global_time).unwrap_or(acceptable_gt);
            (1, high, messages)
        } else {
            let pivot = sample_pivot(acceptable_gt);
            let mut lower = self.store.range(community, meta_ids, 1, pivot).await?;
            let mut upper = self
                .store
                .range(community, meta_ids, pivot + 1, acceptable_gt)
                .await?;

            // Bound each side to at most `capacity` messages closest to the pivot before
            // comparing, instead of comparing raw unbounded counts across the whole half.
            if lower.len() > capacity {
                lower = lower.split_off(lower.len() - capacity);
            }
            if upper.len() > capacity {
                upper.truncate(capacity);
            }

            // Prefer whichever bounded selection packs more messages into a smaller span; ties
            // favor the lower (older) side.
            let upper_wins = !upper.is_empty()
                && (lower.is_empty()
                    || upper.len() > lower.len()
                    || (upper.len() == lower.len() && span(&upper) < span(&lower)));

            if upper_wins {
                let low = upper.first().map(|m| m.global_time).unwrap_or(pivot + 1);
                let high = upper.last().map(|m| m.global_time).unwrap_or(acceptable_gt);
                (low, high, upper)
            } else {
                let low = lower.first().map(|m| m.global_time).unwrap_or(1);
                let high = lower.last().map(|m| m.global_time).unwrap_or(pivot);
                (low, high, lower)
            }
        };

        if messages.len() > capacity {
            messages.truncate(capacity);
        }
        if let Some(last) = messages.last().map(|m| m.global_time) {
            while messages.len() > 1 && messages[messages.len() - 2].global_time == last {
                messages.pop();
            }
            high = last;
        }
        if messages.is_empty() {
            high = low;
        }

        let mut bloom = bloom;
        bloom.add_keys(messages.iter().map(|m| m.packet.as_slice()));

        Ok(ClaimedRange {
            time_low: low,
            time_high: high,
            modulo: 1,
            offset: 0,
            bloom_filter: bloom,
        })
    }

    /// Partitions the whole `[1, acceptable_gt]` range by `global_time % modulo` when even the
    /// larger-half strategy can't cover the set in one filter — `_claim_sync_bloom_filter_modulo`.
    pub async fn claim_modulo(
        &self,
        community: CommunityId,
        meta_ids: &[u64],
        acceptable_gt: i64,
        sig_len: usize,
    ) -> Result<ClaimedRange> {
        let highest = self.store.highest_global_time(community).await?;
        if highest == 0 || acceptable_gt <= 1 {
            return Ok(ClaimedRange::degenerate(acceptable_gt, self.error_rate));
        }

        let bloom = BloomFilter::for_mtu(sig_len, self.error_rate);
        let capacity = bloom.capacity(self.error_rate).max(1);
        let total = self
            .store
            .count_range(community, meta_ids, 1, acceptable_gt)
            .await?;
        let modulo = ((total as f64 / capacity as f64).ceil() as u32).max(1);
        let offset = if modulo > 1 {
            rand::thread_rng().gen_range(0, modulo)
        } else {
            0
        };

        let messages: Vec<_> = self
            .store
            .range(community, meta_ids, 1, acceptable_gt)
            .await?
            .into_iter()
            .filter(|message| (message.global_time as u32 + offset) % modulo == 0)
            .collect();

        let mut bloom = bloom;
        bloom.add_keys(messages.iter().map(|m| m.packet.as_slice()));

        Ok(ClaimedRange {
            time_low: 1,
            time_high: acceptable_gt,
            modulo,
            offset,
            bloom_filter: bloom,
        })
    }
}

/// The `global_time` span covered by a sorted, non-empty slice of messages; `0` if empty.
fn span(messages: &[StoredMessage]) -> i64 {
    match (messages.first(), messages.last()) {
        (Some(first), Some(last)) => last.global_time - first.global_time,
        _ => 0,
    }
}

/// `pivot = acceptable_gt - Exponential(mean = acceptable_gt / 2)`, clamped to `[1, acceptable_gt
/// - 1]` — biases the pivot toward recent history while still occasionally sampling deep into the
/// past, per `_select_bloomfilter_range`.
fn sample_pivot(acceptable_gt: i64) -> i64 {
    let mean = (acceptable_gt as f64 / 2.0).max(1.0);
    let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON, 1.0);
    let sample = -mean * uniform.ln();
    let pivot = (acceptable_gt as f64 - sample).round() as i64;
    pivot.clamp(1, (acceptable_gt - 1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Mid;
    use crate::sync::store::memory::MemoryStore;
    use crate::sync::store::StoredMessage;

    fn engine() -> (SyncEngine<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (SyncEngine::new(store.clone(), 0.01), store)
    }

    fn row(cid: CommunityId, gt: i64) -> StoredMessage {
        StoredMessage {
            community: cid,
            global_time: gt,
            member: Mid([1u8; 20]),
            meta_database_id: 1,
            packet: gt.to_be_bytes().to_vec(),
            undone: false,
        }
    }

    #[tokio::test]
    async fn empty_community_gets_degenerate_claim() {
        let (engine, _store) = engine();
        let cid = CommunityId([1u8; 20]);
        let claim = engine.claim_largest(cid, &[1], 500, 60).await.unwrap();
        assert_eq!(claim.time_low, 1);
        assert_eq!(claim.time_high, 500);
        assert_eq!(claim.modulo, 1);
        assert_eq!(claim.offset, 0);
        assert_eq!(claim.bloom_filter.num_bits(), 8);
    }

    #[tokio::test]
    async fn largest_claim_covers_stored_messages_without_false_negatives() {
        let (engine, store) = engine();
        let cid = CommunityId([2u8; 20]);
        for gt in 1..=50i64 {
            store.store(row(cid, gt)).await.unwrap();
        }

        let claim = engine.claim_largest(cid, &[1], 50, 60).await.unwrap();
        assert!(claim.time_low >= 1);
        assert!(claim.time_high <= 50);

        for gt in claim.time_low..=claim.time_high {
            assert!(claim.bloom_filter.contains(&gt.to_be_bytes()));
        }
    }

    #[tokio::test]
    async fn largest_claim_falls_back_to_oldest_when_below_capacity() {
        let (engine, store) = engine();
        let cid = CommunityId([5u8; 20]);
        // A handful of messages, far fewer than one bloom filter's capacity: the pivot split
        // should be skipped entirely in favor of the oldest-ascending fallback.
        for gt in 1..=3i64 {
            store.store(row(cid, gt)).await.unwrap();
        }

        let claim = engine.claim_largest(cid, &[1], 1_000, 60).await.unwrap();
        assert_eq!(claim.time_low, 1);
        assert_eq!(claim.time_high, 3);
        for gt in 1..=3i64 {
            assert!(claim.bloom_filter.contains(&gt.to_be_bytes()));
        }
    }

    #[tokio::test]
    async fn modulo_claim_covers_selected_subset_without_false_negatives() {
        let (engine, store) = engine();
        let cid = CommunityId([3u8; 20]);
        for gt in 1..=50i64 {
            store.store(row(cid, gt)).await.unwrap();
        }

        let claim = engine.claim_modulo(cid, &[1], 50, 60).await.unwrap();
        for gt in 1..=50i64 {
            if (gt as u32 + claim.offset) % claim.modulo == 0 {
                assert!(claim.bloom_filter.contains(&gt.to_be_bytes()));
            }
        }
    }

    #[tokio::test]
    async fn fresh_cache_with_no_responses_is_not_reused() {
        let (engine, store) = engine();
        let cid = CommunityId([4u8; 20]);
        for gt in 1..=10i64 {
            store.store(row(cid, gt)).await.unwrap();
        }
        let mut cache = SyncCache::new(
            "127.0.0.1:9000".parse().unwrap(),
            1,
            100,
            1,
            0,
            BloomFilter::new(800, 0.01, 3),
        );

        engine
            .claim(Some(&mut cache), cid, &[1], 500, 60)
            .await
            .unwrap();
        // A cache entry with zero responses is bypassed, not reused: `times_used` stays at 0
        // rather than being incremented by the reuse branch.
        assert_eq!(cache.times_used, 0);
    }

    #[tokio::test]
    async fn cache_reuse_increments_times_used_instead_of_recomputing() {
        let (engine, _store) = engine();
        let cid = CommunityId([4u8; 20]);
        let mut cache = SyncCache::new(
            "127.0.0.1:9000".parse().unwrap(),
            1,
            100,
            1,
            0,
            BloomFilter::new(800, 0.01, 3),
        );
        cache.record_response();

        let claim = engine
            .claim(Some(&mut cache), cid, &[1], 500, 60)
            .await
            .unwrap();
        assert_eq!(claim.time_low, 1);
        assert_eq!(claim.time_high, 100);
        assert_eq!(cache.times_used, 1);
    }
}
