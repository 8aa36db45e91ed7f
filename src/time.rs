// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The per-community Lamport-like logical clock.
//!
//! Ported from `Community.global_time` / `Community.acceptable_global_time` in the original
//! Python implementation: a peer's own claims are strictly monotonic, but the *acceptable* upper
//! bound on global times we'll take from others is softened by a six-peer quorum median so a
//! single fast-talking peer can't unilaterally yank the window forward.

use std::time::{Duration, Instant};

/// How far past the local/quorum time we will accept an incoming global time.
pub const ACCEPTABLE_RANGE: i64 = 10_000;

/// How long an `acceptable_gt()` computation is cached before being recomputed.
pub const ACCEPTABLE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Quorum size: below this many opinions, a peer's own clock is trusted outright.
const QUORUM_MIN: usize = 5;

/// Clamp applied to the final acceptable time so overflow never reaches storage.
const MAX_GLOBAL_TIME: i64 = i64::MAX;

/// Per-community logical clock.
///
/// `local_gt` only ever grows: [`GlobalTime::claim`] increments it and
/// [`GlobalTime::update`] folds in the max of any value we observe on the wire.
#[derive(Debug)]
pub struct GlobalTime {
    local_gt: i64,
    cache: Option<(i64, Instant)>,
}

impl Default for GlobalTime {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalTime {
    pub fn new() -> Self {
        Self {
            local_gt: 0,
            cache: None,
        }
    }

    /// The highest global time we have locally claimed or observed. Never below 1 once at least
    /// one claim has happened; before that it is 0.
    pub fn local(&self) -> i64 {
        self.local_gt
    }

    /// Claims the next global time for an outgoing sync-distributed message.
    ///
    /// Strictly monotonic: after `claim()` returns `g`, no subsequent `claim()` returns `<= g`.
    pub fn claim(&mut self) -> i64 {
        self.local_gt += 1;
        self.local_gt
    }

    /// Folds in a global time observed from any valid incoming message.
    pub fn update(&mut self, observed: i64) {
        if observed > self.local_gt {
            self.local_gt = observed;
        }
    }

    /// The upper bound we will accept for incoming messages right now, recomputed at most once
    /// per [`ACCEPTABLE_CACHE_TTL`].
    ///
    /// `opinions` must be the sorted global times (`> 0`) reported by candidates that are
    /// currently active in this community; the caller gathers these from the candidate table
    /// because `GlobalTime` itself has no notion of candidates.
    pub fn acceptable_gt(&mut self, now: Instant, opinions: impl Fn() -> Vec<i64>) -> i64 {
        if let Some((value, deadline)) = self.cache {
            if now < deadline {
                return value;
            }
        }

        let mut options = opinions();
        options.sort_unstable();

        let median = if options.len() > QUORUM_MIN {
            options[options.len() / 2]
        } else {
            0
        };

        let value = (self.local_gt.max(median) + ACCEPTABLE_RANGE).min(MAX_GLOBAL_TIME);
        self.cache = Some((value, now + ACCEPTABLE_CACHE_TTL));
        value
    }

    /// Invalidates the cached acceptable-time value, forcing recomputation on next call.
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_monotonicity() {
        let mut gt = GlobalTime::new();
        assert_eq!(gt.claim(), 1);
        assert_eq!(gt.claim(), 2);
        assert_eq!(gt.claim(), 3);
        assert_eq!(gt.claim(), 4);

        gt.update(100);
        assert_eq!(gt.claim(), 101);
    }

    #[test]
    fn update_never_decreases() {
        let mut gt = GlobalTime::new();
        gt.update(50);
        assert_eq!(gt.local(), 50);
        gt.update(10);
        assert_eq!(gt.local(), 50);
    }

    #[test]
    fn acceptable_time_quorum_of_six() {
        let mut gt = GlobalTime::new();
        gt.update(5);
        let now = Instant::now();
        let value = gt.acceptable_gt(now, || vec![10, 20, 30, 40, 50, 60]);
        // median of 6 sorted values, floor(6/2) = index 3 -> 40
        assert_eq!(value, 40 + ACCEPTABLE_RANGE);
    }

    #[test]
    fn acceptable_time_below_quorum_ignores_opinions() {
        let mut gt = GlobalTime::new();
        gt.update(5);
        let now = Instant::now();
        let value = gt.acceptable_gt(now, || vec![10, 20, 30, 40, 50]);
        assert_eq!(value, 5 + ACCEPTABLE_RANGE);
    }

    #[test]
    fn acceptable_time_is_cached() {
        let mut gt = GlobalTime::new();
        gt.update(5);
        let now = Instant::now();
        let first = gt.acceptable_gt(now, || vec![10, 20, 30, 40, 50, 60]);
        // Even though local time changes, the cached value is returned within the TTL.
        gt.update(1_000_000);
        let second = gt.acceptable_gt(now, || vec![10, 20, 30, 40, 50, 60]);
        assert_eq!(first, second);

        let later = now + ACCEPTABLE_CACHE_TTL;
        let third = gt.acceptable_gt(later, || vec![10, 20, 30, 40, 50, 60]);
        assert!(third > second);
    }
}
