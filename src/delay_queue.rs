// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Coalesces packets/messages delayed on the same missing dependency and releases them together
//! once it arrives, dropping whatever is still waiting past a TTL.
//!
//! Grounded on the teacher's DKG voter backlog (`routing::dkg::voter`): out-of-order votes are
//! held keyed by the round they're waiting on and replayed once that round's state lands, rather
//! than each waiter polling or re-requesting independently.

use crate::error::MissingDependency;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A queue of items parked on a [`MissingDependency`], released in a batch once that dependency
/// is satisfied, or dropped once they've waited longer than `ttl`.
pub struct DelayQueue<T> {
    waiters: DashMap<MissingDependency, Vec<(T, Instant)>>,
    ttl: Duration,
}

impl<T> DelayQueue<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            waiters: DashMap::new(),
            ttl,
        }
    }

    /// Parks `item` behind `dependency`. Multiple items waiting on the same dependency coalesce
    /// into one entry rather than each holding a separate timer/retry.
    pub fn wait(&self, dependency: MissingDependency, item: T) {
        self.waiters.entry(dependency).or_insert_with(Vec::new).push((item, Instant::now()));
    }

    /// `dependency` has arrived: returns every item that was waiting on it, in the order they were
    /// parked, removing the entry.
    pub fn release(&self, dependency: &MissingDependency) -> Vec<T> {
        match self.waiters.remove(dependency) {
            Some((_, entries)) => {
                debug!(count = entries.len(), "releasing delayed items");
                entries.into_iter().map(|(item, _)| item).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drops every item that has waited longer than `ttl`, returning the dependencies it was
    /// dropped for (for logging/metrics). Dependencies with at least one still-fresh waiter are
    /// left in place with only their expired entries removed.
    pub fn expire(&self, now: Instant) -> Vec<MissingDependency> {
        let mut expired_keys = Vec::new();
        self.waiters.retain(|dependency, entries| {
            let before = entries.len();
            entries.retain(|(_, parked_at)| now.duration_since(*parked_at) < self.ttl);
            if entries.len() < before {
                expired_keys.push(dependency.clone());
            }
            !entries.is_empty()
        });
        expired_keys
    }

    pub fn pending_dependencies(&self) -> usize {
        self.waiters.len()
    }

    pub fn pending_items(&self) -> usize {
        self.waiters.iter().map(|entry| entry.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_coalesce_on_shared_dependency() {
        let queue: DelayQueue<&'static str> = DelayQueue::new(Duration::from_secs(60));
        queue.wait(MissingDependency::Member, "packet-a");
        queue.wait(MissingDependency::Member, "packet-b");
        assert_eq!(queue.pending_dependencies(), 1);
        assert_eq!(queue.pending_items(), 2);
    }

    #[test]
    fn release_returns_all_waiters_in_order() {
        let queue: DelayQueue<&'static str> = DelayQueue::new(Duration::from_secs(60));
        queue.wait(MissingDependency::Proof, "first");
        queue.wait(MissingDependency::Proof, "second");

        let released = queue.release(&MissingDependency::Proof);
        assert_eq!(released, vec!["first", "second"]);
        assert_eq!(queue.pending_dependencies(), 0);
    }

    #[test]
    fn release_on_unknown_dependency_is_empty() {
        let queue: DelayQueue<&'static str> = DelayQueue::new(Duration::from_secs(60));
        assert!(queue.release(&MissingDependency::Sequence).is_empty());
    }

    #[test]
    fn expire_drops_only_stale_entries() {
        let queue: DelayQueue<&'static str> = DelayQueue::new(Duration::from_millis(0));
        queue.wait(MissingDependency::Message("dispersy-identity".to_string()), "stale");
        std::thread::sleep(Duration::from_millis(5));

        let expired = queue.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.pending_dependencies(), 0);
    }
}
