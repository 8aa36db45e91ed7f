// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The permission timeline: an ordered log of `authorize`/`revoke`/`dynamic-settings` entries and
//! the decision table derived from it.
//!
//! Grounded on the teacher's `routing::section` membership-state model (`node_state.rs`): a
//! causally ordered log of state-changing entries, queried by folding the log up to a point in
//! time rather than mutating a single shared "current" value in place.

use crate::member::Mid;
use crate::message::{MetaMessage, Permission, Resolution};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::trace;

/// One row of the timeline: `(member, message_name, permission)` granted or revoked at
/// `global_time`, per spec.md §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimelineEntry {
    pub global_time: i64,
    pub member: Mid,
    pub message_name: String,
    pub permission: Permission,
    /// `true` grants the permission, `false` revokes it.
    pub grant: bool,
}

type DecisionKey = (Mid, String, Permission);

/// The permission timeline for one community.
///
/// Internally this is a `BTreeMap<(gt, insertion order), TimelineEntry>` log plus a derived
/// `DashMap` decision table mapping `(member, message_name, permission)` to its sorted history of
/// `(global_time, grant)` pairs — queried with a binary search for "the most recent grant/revoke
/// at or before `at_gt`", exactly as `allowed` needs.
#[derive(Default)]
pub struct Timeline {
    log: RwLock<BTreeMap<(i64, u64), TimelineEntry>>,
    next_seq: std::sync::atomic::AtomicU64,
    decisions: DashMap<DecisionKey, Vec<(i64, bool)>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one timeline-affecting entry. Malformed or out-of-order entries are the caller's
    /// responsibility to filter before calling this — `apply` always succeeds.
    pub fn apply(&self, entry: TimelineEntry) {
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let key = (
            entry.member,
            entry.message_name.clone(),
            entry.permission,
        );
        self.decisions
            .entry(key)
            .or_insert_with(Vec::new)
            .push((entry.global_time, entry.grant));
        self.decisions
            .get_mut(&(entry.member, entry.message_name.clone(), entry.permission))
            .unwrap()
            .sort_by_key(|(gt, _)| *gt);
        self.log.write().unwrap().insert((entry.global_time, seq), entry);
    }

    /// Whether `member` holds `permission` over `meta` as of `at_gt` — i.e. strictly before
    /// `at_gt`, not including an entry whose own `global_time` equals `at_gt` (spec.md §4.3: state
    /// is evaluated "as of gt−1" so a message's own timeline entry never validates itself).
    ///
    /// Public-resolution messages always allow `Permit` regardless of the log (spec.md §3:
    /// "absence denies... except Public-resolution permit, which is always allowed"). Everything
    /// else defaults to deny absent an explicit grant, and the most recent entry strictly before
    /// `at_gt` wins.
    pub fn allowed(&self, member: &Mid, meta: &MetaMessage, permission: Permission, at_gt: i64) -> bool {
        if meta.resolution == Resolution::Public && permission == Permission::Permit {
            return true;
        }
        let key = (*member, meta.name.clone(), permission);
        let decision = match self.decisions.get(&key) {
            None => false,
            Some(history) => history
                .iter()
                .rev()
                .find(|(gt, _)| *gt < at_gt)
                .map(|(_, grant)| *grant)
                .unwrap_or(false),
        };
        trace!(%member, message = %meta.name, ?permission, at_gt, decision, "timeline decision");
        decision
    }

    /// All entries in `(global_time, insertion order)` order, e.g. for persistence or debugging.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.log.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().unwrap().is_empty()
    }

    /// Replays a batch of already-ordered `(global_time, entry)` pairs, e.g. while loading a
    /// community from storage. Entries must already be sorted by `global_time`; this is the
    /// caller's invariant to uphold (typically the store's load query, which orders by
    /// `global_time` per spec.md §4.3).
    ///
    /// `initializing` is accepted for symmetry with the original distinction between loading a
    /// fresh timeline and applying newly arrived packets, but both cases apply identically here:
    /// causal ordering is enforced purely by `global_time`, not by call site.
    pub fn replay<I: IntoIterator<Item = TimelineEntry>>(&self, entries: I, _initializing: bool) {
        for entry in entries {
            self.apply(entry);
        }
    }
}
