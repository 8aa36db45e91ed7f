// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! The candidate walker: who to contact next, and the introduction/puncture handshake that turns
//! a stranger into a known candidate.
//!
//! Grounded on the teacher's `routing::dkg::voter` retry/backoff model for the master member
//! download loop, and on its round-based peer selection for the walk tick itself.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, Instant};

use crate::candidate::{Candidate, CandidateCategory, CandidatePool};
use crate::config::Config;
use crate::message::Payload;
use crate::wire::{CommunityId, WireAddress};

/// Selects the next candidate to walk, per community, on each scheduler tick.
pub struct Walker {
    pool: CandidatePool,
}

impl Walker {
    pub fn new(pool: CandidatePool) -> Self {
        Self { pool }
    }

    /// One walk-selection tick: first demotes any candidate whose walk has gone stale past
    /// `config.walk_lifetime` back to `CandidateCategory::None`, then picks the next candidate —
    /// ~0.5% chance of a shuffled bootstrap pick, otherwise ~50% walk / ~50% split evenly between
    /// stumble and intro, oldest-eligible-first within whichever category is chosen.
    pub fn tick(&self, community: CommunityId, bootstrap: &[Candidate], config: &Config) -> Option<Candidate> {
        self.pool.expire(config.walk_lifetime);
        let mut rng = rand::thread_rng();

        if rng.gen_bool(0.005) && !bootstrap.is_empty() {
            let mut shuffled: Vec<Candidate> = bootstrap.to_vec();
            shuffled.shuffle(&mut rng);
            return shuffled.into_iter().next();
        }

        let category = if rng.gen_bool(0.5) {
            CandidateCategory::Walk
        } else if rng.gen_bool(0.5) {
            CandidateCategory::Stumble
        } else {
            CandidateCategory::Intro
        };

        self.oldest_eligible(community, category, config)
    }

    fn oldest_eligible(
        &self,
        community: CommunityId,
        category: CandidateCategory,
        config: &Config,
    ) -> Option<Candidate> {
        let rewalk = config.walk_rewalk_interval;
        let now = Instant::now();

        let mut candidates = self.pool.view(community, category);
        candidates.retain(|candidate| {
            let state = candidate.state_for(&community);
            let last = match category {
                CandidateCategory::Walk => state.last_walk,
                CandidateCategory::Stumble => state.last_stumble,
                CandidateCategory::Intro => state.last_intro,
                CandidateCategory::None => None,
            };
            match last {
                None => true,
                Some(instant) => now.duration_since(instant) >= rewalk,
            }
        });

        candidates.sort_by_key(|candidate| {
            let state = candidate.state_for(&community);
            match category {
                CandidateCategory::Walk => state.last_walk,
                CandidateCategory::Stumble => state.last_stumble,
                CandidateCategory::Intro => state.last_intro,
                CandidateCategory::None => None,
            }
            .map(|instant| instant.elapsed())
            .unwrap_or(Duration::MAX)
        });

        candidates.pop()
    }
}

/// Builds the payload for an introduction-response, nominating a third candidate from the same
/// community by round-robin, excluding the requester itself.
pub fn build_introduction_response(
    destination_addr: WireAddress,
    lan: WireAddress,
    wan: WireAddress,
    identifier: u16,
) -> Payload {
    Payload::IntroductionResponse {
        destination_addr,
        lan,
        wan,
        identifier,
    }
}

/// Picks the next candidate to nominate in an introduction-response, round-robin over
/// `candidates`, excluding `requester`.
pub fn nominate(candidates: &[Candidate], requester: std::net::SocketAddr, cursor: &mut usize) -> Option<Candidate> {
    let eligible: Vec<&Candidate> = candidates.iter().filter(|c| c.sock_addr != requester).collect();
    if eligible.is_empty() {
        return None;
    }
    let chosen = eligible[*cursor % eligible.len()].clone();
    *cursor = cursor.wrapping_add(1);
    Some(chosen)
}

pub fn build_puncture_request(lan: WireAddress, wan: WireAddress) -> Payload {
    Payload::PunctureRequest { lan, wan }
}

pub fn build_puncture(lan: WireAddress, wan: WireAddress) -> Payload {
    Payload::Puncture { lan, wan }
}

/// Tracks the exponential-backoff retry state for downloading a community's master member
/// identity (public key), per the `DkgVoter`-style retry loop this is grounded on.
pub struct MasterDownloadRetry {
    last_delay: Option<Duration>,
    pub attempts: u32,
}

impl Default for MasterDownloadRetry {
    fn default() -> Self {
        Self {
            last_delay: None,
            attempts: 0,
        }
    }
}

impl MasterDownloadRetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delay to wait before the next attempt, advancing internal state.
    pub fn next_delay(&mut self, config: &Config) -> Duration {
        let delay = config.next_master_download_delay(self.last_delay);
        self.last_delay = Some(delay);
        self.attempts += 1;
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidatePool;

    fn wire_addr(port: u16) -> WireAddress {
        WireAddress {
            ip: "127.0.0.1".parse().unwrap(),
            port,
        }
    }

    #[test]
    fn nominate_excludes_requester_and_round_robins() {
        let pool = CandidatePool::new();
        let a = pool.get_or_insert("127.0.0.1:1".parse().unwrap(), wire_addr(1), wire_addr(1));
        let b = pool.get_or_insert("127.0.0.1:2".parse().unwrap(), wire_addr(2), wire_addr(2));
        let requester: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();

        let mut cursor = 0;
        let first = nominate(&[a.clone(), b.clone()], requester, &mut cursor).unwrap();
        assert_eq!(first.sock_addr, b.sock_addr);
    }

    #[test]
    fn nominate_returns_none_when_only_requester_known() {
        let pool = CandidatePool::new();
        let a = pool.get_or_insert("127.0.0.1:1".parse().unwrap(), wire_addr(1), wire_addr(1));
        let requester: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut cursor = 0;
        assert!(nominate(&[a], requester, &mut cursor).is_none());
    }

    #[test]
    fn master_download_retry_backs_off_and_caps() {
        let config = Config::default();
        let mut retry = MasterDownloadRetry::new();
        let first = retry.next_delay(&config);
        assert_eq!(first, config.master_download_initial_delay);

        let mut last = first;
        for _ in 0..500 {
            last = retry.next_delay(&config);
        }
        assert_eq!(last, config.master_download_max_delay);
        assert!(retry.attempts > 0);
    }

    #[test]
    fn tick_demotes_stale_walk_candidates_before_selecting() {
        let pool = CandidatePool::new();
        let cid = CommunityId([2u8; 20]);
        let walker = Walker::new(pool.clone());
        let mut config = Config::default();
        config.walk_lifetime = Duration::from_secs(30);

        let addr: std::net::SocketAddr = "127.0.0.1:2".parse().unwrap();
        pool.get_or_insert(addr, wire_addr(2), wire_addr(2));
        pool.update(addr, |candidate| {
            candidate.set_category(cid, CandidateCategory::Walk);
            let state = candidate.communities.get_mut(&cid).unwrap();
            state.last_walk = Some(Instant::now() - Duration::from_secs(60));
        });

        walker.tick(cid, &[], &config);

        let candidate = pool.get(&addr).unwrap();
        assert_eq!(candidate.state_for(&cid).category, CandidateCategory::None);
    }

    #[test]
    fn oldest_eligible_prefers_never_walked_candidate() {
        let pool = CandidatePool::new();
        let cid = CommunityId([1u8; 20]);
        let walker = Walker::new(pool.clone());
        let config = Config::default();

        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        pool.get_or_insert(addr, wire_addr(1), wire_addr(1));
        pool.update(addr, |candidate| candidate.set_category(cid, CandidateCategory::Walk));

        let picked = walker.oldest_eligible(cid, CandidateCategory::Walk, &config);
        assert_eq!(picked.unwrap().sock_addr, addr);
    }
}
