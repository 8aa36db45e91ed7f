// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The `SyncStore` seam: an async query interface over syncable messages, ordered by
//! `global_time`, and an in-memory implementation for tests.
//!
//! Grounded on the teacher's `async-trait` usage for its storage-backed traits
//! (`client::connections::messaging`): the crate defines the interface; a real deployment plugs
//! in a database-backed implementation, out of scope here per spec.md §1.

use crate::member::Mid;
use crate::wire::CommunityId;
use crate::Result;
use async_trait::async_trait;

/// One stored, syncable message row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub community: CommunityId,
    pub global_time: i64,
    pub member: Mid,
    pub meta_database_id: u64,
    pub packet: Vec<u8>,
    /// Set by an `undo` message; undone rows are excluded from bloom-filter population but kept
    /// for history (spec.md §4.6 glossary: "undo").
    pub undone: bool,
}

/// Async query interface a concrete storage backend implements. All queries are ordered by
/// `global_time` ascending unless noted.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Persists a message, replacing any existing row with the same `(community, member,
    /// meta_database_id, global_time)` key.
    async fn store(&self, message: StoredMessage) -> Result<()>;

    /// All non-undone rows for `community` whose `meta_database_id` is in `meta_ids` and whose
    /// `global_time` falls in `[low, high]` inclusive, ordered by `global_time`.
    async fn range(
        &self,
        community: CommunityId,
        meta_ids: &[u64],
        low: i64,
        high: i64,
    ) -> Result<Vec<StoredMessage>>;

    /// Count of matching rows, without materialising them — used to pick between the "largest"
    /// and "modulo" claim strategies without paying for a full scan.
    async fn count_range(
        &self,
        community: CommunityId,
        meta_ids: &[u64],
        low: i64,
        high: i64,
    ) -> Result<usize>;

    /// The highest `global_time` stored for `community`, or `0` if nothing is stored yet.
    async fn highest_global_time(&self, community: CommunityId) -> Result<i64>;

    /// Total count of non-undone rows for `community` whose `meta_database_id` is in `meta_ids`,
    /// across the whole history — not bounded to any `[low, high]` range. Used to gate the
    /// "largest" claim strategy's oldest-packets fallback and the largest/modulo strategy choice
    /// (spec.md §4.4; `original_source/community.py`'s `_nr_sync_packets` counter).
    async fn nr_sync_packets(&self, community: CommunityId, meta_ids: &[u64]) -> Result<usize>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod memory {
    use super::*;
    use std::sync::RwLock;

    /// A simple, unindexed in-memory `SyncStore` for tests and examples.
    #[derive(Default)]
    pub struct MemoryStore {
        rows: RwLock<Vec<StoredMessage>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SyncStore for MemoryStore {
        async fn store(&self, message: StoredMessage) -> Result<()> {
            let mut rows = self.rows.write().unwrap();
            if let Some(existing) = rows.iter_mut().find(|row| {
                row.community == message.community
                    && row.member == message.member
                    && row.meta_database_id == message.meta_database_id
                    && row.global_time == message.global_time
            }) {
                *existing = message;
            } else {
                rows.push(message);
            }
            Ok(())
        }

        async fn range(
            &self,
            community: CommunityId,
            meta_ids: &[u64],
            low: i64,
            high: i64,
        ) -> Result<Vec<StoredMessage>> {
            let mut matches: Vec<StoredMessage> = self
                .rows
                .read()
                .unwrap()
                .iter()
                .filter(|row| {
                    row.community == community
                        && !row.undone
                        && meta_ids.contains(&row.meta_database_id)
                        && row.global_time >= low
                        && row.global_time <= high
                })
                .cloned()
                .collect();
            matches.sort_by_key(|row| row.global_time);
            Ok(matches)
        }

        async fn count_range(
            &self,
            community: CommunityId,
            meta_ids: &[u64],
            low: i64,
            high: i64,
        ) -> Result<usize> {
            Ok(self.range(community, meta_ids, low, high).await?.len())
        }

        async fn highest_global_time(&self, community: CommunityId) -> Result<i64> {
            Ok(self
                .rows
                .read()
                .unwrap()
                .iter()
                .filter(|row| row.community == community && !row.undone)
                .map(|row| row.global_time)
                .max()
                .unwrap_or(0))
        }

        async fn nr_sync_packets(&self, community: CommunityId, meta_ids: &[u64]) -> Result<usize> {
            Ok(self
                .rows
                .read()
                .unwrap()
                .iter()
                .filter(|row| {
                    row.community == community
                        && !row.undone
                        && meta_ids.contains(&row.meta_database_id)
                })
                .count())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    fn row(cid: CommunityId, gt: i64, meta: u64) -> StoredMessage {
        StoredMessage {
            community: cid,
            global_time: gt,
            member: Mid([1u8; 20]),
            meta_database_id: meta,
            packet: vec![0u8; 4],
            undone: false,
        }
    }

    #[tokio::test]
    async fn range_is_sorted_and_filtered() {
        let store = MemoryStore::new();
        let cid = CommunityId([9u8; 20]);
        store.store(row(cid, 30, 1)).await.unwrap();
        store.store(row(cid, 10, 1)).await.unwrap();
        store.store(row(cid, 20, 2)).await.unwrap();

        let results = store.range(cid, &[1], 0, 1_000).await.unwrap();
        let times: Vec<i64> = results.iter().map(|row| row.global_time).collect();
        assert_eq!(times, vec![10, 30]);
    }

    #[tokio::test]
    async fn undone_rows_are_excluded() {
        let store = MemoryStore::new();
        let cid = CommunityId([9u8; 20]);
        let mut undone = row(cid, 10, 1);
        undone.undone = true;
        store.store(undone).await.unwrap();

        let results = store.range(cid, &[1], 0, 1_000).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn highest_global_time_defaults_to_zero() {
        let store = MemoryStore::new();
        let cid = CommunityId([9u8; 20]);
        assert_eq!(store.highest_global_time(cid).await.unwrap(), 0);
        store.store(row(cid, 42, 1)).await.unwrap();
        assert_eq!(store.highest_global_time(cid).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn nr_sync_packets_ignores_range_and_undone_rows() {
        let store = MemoryStore::new();
        let cid = CommunityId([9u8; 20]);
        store.store(row(cid, 10, 1)).await.unwrap();
        store.store(row(cid, 20, 1)).await.unwrap();
        let mut undone = row(cid, 30, 1);
        undone.undone = true;
        store.store(undone).await.unwrap();
        store.store(row(cid, 40, 2)).await.unwrap();

        assert_eq!(store.nr_sync_packets(cid, &[1]).await.unwrap(), 2);
        assert_eq!(store.nr_sync_packets(cid, &[1, 2]).await.unwrap(), 3);
    }
}
