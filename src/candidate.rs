// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Candidates: peers known by socket address, with per-community walk state.
//!
//! Grounded on the teacher's `routing::section` node table (`node_state.rs`): a global,
//! `DashMap`-keyed table of peer records that individual communities filter into their own view
//! rather than own outright — matching spec.md §4.5's note that Dispersy, not the community, owns
//! the candidate pool, with communities holding only a weak association keyed by `sock_addr`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::wire::{CommunityId, WireAddress};

/// How a candidate was learned about, and therefore which walk bucket it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CandidateCategory {
    /// Actively walked: we've exchanged a full introduction-request/response with it.
    Walk,
    /// Learned about via someone else's introduction-response but not yet walked ourselves.
    Stumble,
    /// Introduced to us as the recipient of someone else's introduction-request (intro-ed *to*
    /// us, not *by* us).
    Intro,
    /// No relationship yet beyond having seen a packet from this address.
    None,
}

/// Per-community state a candidate carries: which bucket it's in here, and when we last
/// interacted so eligibility windows can be computed.
#[derive(Clone, Debug)]
pub struct CommunityCandidateState {
    pub category: CandidateCategory,
    pub last_walk: Option<Instant>,
    pub last_stumble: Option<Instant>,
    pub last_intro: Option<Instant>,
}

impl Default for CommunityCandidateState {
    fn default() -> Self {
        Self {
            category: CandidateCategory::None,
            last_walk: None,
            last_stumble: None,
            last_intro: None,
        }
    }
}

/// A peer, keyed by its externally visible socket address.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub sock_addr: SocketAddr,
    pub tunnel: bool,
    pub lan_address: WireAddress,
    pub wan_address: WireAddress,
    pub connection_type: u8,
    pub communities: HashMap<CommunityId, CommunityCandidateState>,
}

impl Candidate {
    pub fn new(sock_addr: SocketAddr, lan_address: WireAddress, wan_address: WireAddress) -> Self {
        Self {
            sock_addr,
            tunnel: false,
            lan_address,
            wan_address,
            connection_type: 0,
            communities: HashMap::new(),
        }
    }

    pub fn state_for(&self, community: &CommunityId) -> CommunityCandidateState {
        self.communities.get(community).cloned().unwrap_or_default()
    }

    pub fn set_category(&mut self, community: CommunityId, category: CandidateCategory) {
        let state = self.communities.entry(community).or_default();
        let now = Instant::now();
        trace!(sock_addr = %self.sock_addr, ?community, from = ?state.category, to = ?category, "candidate category transition");
        state.category = category;
        match category {
            CandidateCategory::Walk => state.last_walk = Some(now),
            CandidateCategory::Stumble => state.last_stumble = Some(now),
            CandidateCategory::Intro => state.last_intro = Some(now),
            CandidateCategory::None => {}
        }
    }
}

/// How long a normal candidate stays eligible for re-walking without fresh contact.
pub const WALK_REWALK_INTERVAL_SECS: u64 = 30;
/// How long a bootstrap candidate stays eligible for re-walking without fresh contact — longer,
/// since bootstrap nodes are scarce and we don't want to hammer them.
pub const BOOTSTRAP_REWALK_INTERVAL_SECS: u64 = 55;

/// Global candidate pool, shared across all communities on this node.
#[derive(Clone, Default)]
pub struct CandidatePool {
    candidates: Arc<DashMap<SocketAddr, Candidate>>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(
        &self,
        sock_addr: SocketAddr,
        lan_address: WireAddress,
        wan_address: WireAddress,
    ) -> Candidate {
        self.candidates
            .entry(sock_addr)
            .or_insert_with(|| Candidate::new(sock_addr, lan_address, wan_address))
            .clone()
    }

    pub fn get(&self, sock_addr: &SocketAddr) -> Option<Candidate> {
        self.candidates.get(sock_addr).map(|entry| entry.clone())
    }

    pub fn update<F: FnOnce(&mut Candidate)>(&self, sock_addr: SocketAddr, update: F) {
        if let Some(mut entry) = self.candidates.get_mut(&sock_addr) {
            update(&mut entry);
        }
    }

    pub fn remove(&self, sock_addr: &SocketAddr) {
        self.candidates.remove(sock_addr);
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// A community's view over the pool: every candidate with any recorded state for
    /// `community`, matching the given category.
    pub fn view(&self, community: CommunityId, category: CandidateCategory) -> Vec<Candidate> {
        self.candidates
            .iter()
            .filter(|entry| {
                entry
                    .communities
                    .get(&community)
                    .map(|state| state.category == category)
                    .unwrap_or(false)
            })
            .map(|entry| entry.clone())
            .collect()
    }

    /// Every candidate known at all for `community`, regardless of category.
    pub fn members_of(&self, community: CommunityId) -> Vec<Candidate> {
        self.candidates
            .iter()
            .filter(|entry| entry.communities.contains_key(&community))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Demotes every `Walk`-category candidate whose `last_walk` is older than `walk_lifetime`
    /// back to `CandidateCategory::None`, across every community. spec.md §4.5's `walk -> none`
    /// transition for a walk that's gone stale with no further activity.
    pub fn expire(&self, walk_lifetime: Duration) {
        let now = Instant::now();
        for mut entry in self.candidates.iter_mut() {
            let sock_addr = entry.sock_addr;
            for (community, state) in entry.communities.iter_mut() {
                if state.category != CandidateCategory::Walk {
                    continue;
                }
                if state.last_walk.map(|last| now.duration_since(last) > walk_lifetime).unwrap_or(false) {
                    trace!(%sock_addr, ?community, "walk lifetime expired, demoting to none");
                    state.category = CandidateCategory::None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> WireAddress {
        WireAddress {
            ip: "127.0.0.1".parse().unwrap(),
            port,
        }
    }

    #[test]
    fn get_or_insert_is_idempotent() {
        let pool = CandidatePool::new();
        let sock_addr: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let first = pool.get_or_insert(sock_addr, addr(1000), addr(1000));
        let second = pool.get_or_insert(sock_addr, addr(2000), addr(2000));
        assert_eq!(first.lan_address, second.lan_address);
    }

    #[test]
    fn category_transition_is_visible_in_view() {
        let pool = CandidatePool::new();
        let sock_addr: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let cid = CommunityId([1u8; 20]);
        pool.get_or_insert(sock_addr, addr(1001), addr(1001));
        pool.update(sock_addr, |candidate| {
            candidate.set_category(cid, CandidateCategory::Walk);
        });

        let walked = pool.view(cid, CandidateCategory::Walk);
        assert_eq!(walked.len(), 1);
        assert_eq!(walked[0].sock_addr, sock_addr);

        let stumbled = pool.view(cid, CandidateCategory::Stumble);
        assert!(stumbled.is_empty());
    }

    #[test]
    fn expire_demotes_stale_walk_candidates_to_none() {
        let pool = CandidatePool::new();
        let sock_addr: SocketAddr = "127.0.0.1:1003".parse().unwrap();
        let cid = CommunityId([3u8; 20]);
        pool.get_or_insert(sock_addr, addr(1003), addr(1003));
        pool.update(sock_addr, |candidate| {
            candidate.set_category(cid, CandidateCategory::Walk);
            // Back-date the walk so it reads as stale without sleeping in the test.
            let state = candidate.communities.get_mut(&cid).unwrap();
            state.last_walk = Some(Instant::now() - std::time::Duration::from_secs(60));
        });

        pool.expire(std::time::Duration::from_secs(30));

        let candidate = pool.get(&sock_addr).unwrap();
        assert_eq!(
            candidate.state_for(&cid).category,
            CandidateCategory::None
        );
    }

    #[test]
    fn expire_leaves_fresh_walk_candidates_alone() {
        let pool = CandidatePool::new();
        let sock_addr: SocketAddr = "127.0.0.1:1004".parse().unwrap();
        let cid = CommunityId([4u8; 20]);
        pool.get_or_insert(sock_addr, addr(1004), addr(1004));
        pool.update(sock_addr, |candidate| {
            candidate.set_category(cid, CandidateCategory::Walk);
        });

        pool.expire(std::time::Duration::from_secs(30));

        let candidate = pool.get(&sock_addr).unwrap();
        assert_eq!(
            candidate.state_for(&cid).category,
            CandidateCategory::Walk
        );
    }

    #[test]
    fn members_of_includes_any_category() {
        let pool = CandidatePool::new();
        let sock_addr: SocketAddr = "127.0.0.1:1002".parse().unwrap();
        let cid = CommunityId([2u8; 20]);
        pool.get_or_insert(sock_addr, addr(1002), addr(1002));
        pool.update(sock_addr, |candidate| {
            candidate.set_category(cid, CandidateCategory::Stumble);
        });
        assert_eq!(pool.members_of(cid).len(), 1);
    }
}
