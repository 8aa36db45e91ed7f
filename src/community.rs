// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! `Community`: the per-overlay state bundle, and its `create`/`join`/`load`/`destroy` lifecycle.
//!
//! Grounded on the teacher's `routing::section` module, which bundles a section's membership,
//! message log, and prefix into one owned struct with explicit lifecycle transitions
//! (`Section::new`, elder promotion, relocation) rather than a god-object service.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::candidate::CandidatePool;
use crate::member::Member;
use crate::message::{is_timeline_message, Conversion, Message, MessageCatalog, Payload, Permission};
use crate::sync::SyncCache;
use crate::time::GlobalTime;
use crate::timeline::{Timeline, TimelineEntry};
use crate::wire::{CommunityId, CommunityPrefix, DestroyDegree};
use crate::{Error, Result};
use std::net::SocketAddr;
use tracing::{info, warn};

/// What stage of its lifecycle a community is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunityStatus {
    Running,
    /// Frozen at `gt_cap`; anything claiming a higher global time is rejected. Cleanup of
    /// community-specific state beyond that is left to the subclass (open question, spec.md §9).
    SoftKilled { gt_cap: i64 },
    /// All state discarded except the destroy proof; only ever responds to introduction-requests
    /// with that proof.
    HardKilled,
}

/// Running counters kept for diagnostics; not persisted.
#[derive(Default, Debug)]
pub struct Statistics {
    pub packets_received: std::sync::atomic::AtomicU64,
    pub packets_dropped: std::sync::atomic::AtomicU64,
    pub packets_delayed: std::sync::atomic::AtomicU64,
    pub sync_responses_sent: std::sync::atomic::AtomicU64,
}

/// One joined or created overlay.
///
/// Invariant: exactly one `my_member` (spec.md §4.1); `global_time` is monotonically
/// non-decreasing for the lifetime of the struct.
pub struct Community {
    pub database_id: u64,
    pub cid: CommunityId,
    pub master_member: Member,
    pub my_member: Member,
    global_time: Mutex<GlobalTime>,
    pub meta_messages: MessageCatalog,
    pub conversions: DashMap<u8, Arc<dyn Conversion>>,
    pub timeline: Timeline,
    pub candidates: CandidatePool,
    pub sync_cache: DashMap<SocketAddr, SyncCache>,
    pub statistics: Statistics,
    status: std::sync::RwLock<CommunityStatus>,
    gt_cap: AtomicI64,
}

impl Community {
    fn new(
        database_id: u64,
        master_member: Member,
        my_member: Member,
        candidates: CandidatePool,
    ) -> Self {
        let cid = match master_member.public_key() {
            Some(public_key) => CommunityId::of_master_public_key(public_key),
            None => {
                // Dummy master member: derive a placeholder cid from its mid so the community is
                // at least addressable until the real public key arrives.
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(&master_member.mid.0);
                CommunityId(bytes)
            }
        };

        Self {
            database_id,
            cid,
            master_member,
            my_member,
            global_time: Mutex::new(GlobalTime::new()),
            meta_messages: MessageCatalog::new(),
            conversions: DashMap::new(),
            timeline: Timeline::new(),
            candidates,
            sync_cache: DashMap::new(),
            statistics: Statistics::default(),
            status: std::sync::RwLock::new(CommunityStatus::Running),
            gt_cap: AtomicI64::new(i64::MAX),
        }
    }

    /// Creates a brand-new community: `my_member` is also its master member (it mints the
    /// community), starting at `global_time = 1`.
    pub fn create(my_member: Member, database_id: u64, candidates: CandidatePool) -> Self {
        let master_member = my_member.clone();
        let community = Self::new(database_id, master_member, my_member, candidates);
        community.claim_global_time();
        info!(cid = %community.cid, database_id, "community created");
        community
    }

    /// Joins an existing community given its master member (possibly still a dummy, pending
    /// identity download) and our own member identity.
    pub fn join(
        master_member: Member,
        my_member: Member,
        database_id: u64,
        candidates: CandidatePool,
    ) -> Self {
        Self::new(database_id, master_member, my_member, candidates)
    }

    /// Loads a previously joined community's bundle from storage. `timeline_entries` must already
    /// be ordered by `global_time`, per the store's load query contract.
    pub fn load(
        master_member: Member,
        my_member: Member,
        database_id: u64,
        candidates: CandidatePool,
        highest_global_time: i64,
        timeline_entries: impl IntoIterator<Item = crate::timeline::TimelineEntry>,
    ) -> Result<Self> {
        if master_member.is_dummy() && my_member.is_dummy() {
            return Err(Error::CommunityNotFound(CommunityId(my_member.mid.0)));
        }
        let community = Self::new(database_id, master_member, my_member, candidates);
        for _ in 0..highest_global_time {
            community.claim_global_time();
        }
        community.timeline.replay(timeline_entries, true);
        Ok(community)
    }

    pub fn prefix(&self, dispersy_version: u8, community_version: u8) -> CommunityPrefix {
        CommunityPrefix {
            dispersy_version,
            community_version,
            cid: self.cid,
        }
    }

    pub fn status(&self) -> CommunityStatus {
        *self.status.read().unwrap()
    }

    /// Claims the next global time for an outgoing sync-distributed message.
    pub fn claim_global_time(&self) -> i64 {
        self.global_time.lock().unwrap().claim()
    }

    /// The highest global time this community has locally claimed or observed.
    pub fn local_global_time(&self) -> i64 {
        self.global_time.lock().unwrap().local()
    }

    /// Folds in a global time observed from a valid incoming message.
    pub fn update_global_time(&self, observed: i64) {
        self.global_time.lock().unwrap().update(observed);
    }

    /// The upper bound this community will accept for incoming messages right now.
    pub fn acceptable_global_time(&self, now: Instant, opinions: impl Fn() -> Vec<i64>) -> i64 {
        self.global_time.lock().unwrap().acceptable_gt(now, opinions)
    }

    /// `dispersy-destroy-community`, soft-kill degree: freezes the community at its current
    /// global time.
    pub fn soft_kill(&self) {
        let gt_cap = self.local_global_time();
        self.gt_cap.store(gt_cap, Ordering::SeqCst);
        *self.status.write().unwrap() = CommunityStatus::SoftKilled { gt_cap };
        warn!(cid = %self.cid, gt_cap, "community soft-killed");
    }

    /// `dispersy-destroy-community`, hard-kill degree: discards everything but the destroy proof.
    pub fn hard_kill(&self) {
        self.timeline.replay(Vec::new(), false);
        self.conversions.clear();
        self.sync_cache.clear();
        *self.status.write().unwrap() = CommunityStatus::HardKilled;
        warn!(cid = %self.cid, "community hard-killed, state discarded");
    }

    /// Logs `err` at the severity its kind warrants, unloading (hard-killing) this community if
    /// it was fatal.
    pub fn note_error(&self, err: &Error) {
        err.log(self.cid);
        if err.is_fatal() {
            self.hard_kill();
        }
    }

    pub fn destroy(&self, degree: DestroyDegree) {
        match degree {
            DestroyDegree::SoftKill => self.soft_kill(),
            DestroyDegree::HardKill => self.hard_kill(),
        }
    }

    /// Whether a packet claiming `global_time` should be accepted given the current lifecycle
    /// status.
    pub fn accepts_global_time(&self, global_time: i64) -> bool {
        match self.status() {
            CommunityStatus::Running => true,
            CommunityStatus::SoftKilled { gt_cap } => global_time <= gt_cap,
            CommunityStatus::HardKilled => false,
        }
    }

    /// Decodes `bytes` with `conversion` and runs the decoded message through the permission
    /// timeline, per spec.md §4.6: every message is checked against `Timeline::allowed` before
    /// being admitted, and `dispersy-authorize`/`dispersy-revoke`/`dispersy-dynamic-settings`
    /// additionally fold their grants into the timeline itself.
    pub fn accept_packet(&self, conversion: &dyn Conversion, bytes: &[u8]) -> Result<Message> {
        let message = conversion.decode(bytes)?;
        self.accept_message(&message)?;
        Ok(message)
    }

    /// Validates an already-decoded `message` against the permission timeline, applying its
    /// grants if it is itself a timeline-affecting message.
    pub fn accept_message(&self, message: &Message) -> Result<()> {
        let meta = self.meta_messages.get(&message.meta_name).ok_or_else(|| {
            Error::DropMessage(format!("unknown meta-message: {}", message.meta_name))
        })?;

        if !self
            .timeline
            .allowed(&message.signer, &meta, Permission::Permit, message.global_time)
        {
            return Err(Error::DropMessage(format!(
                "{} not permitted to {} at gt {}",
                message.signer, meta.name, message.global_time
            )));
        }

        if is_timeline_message(&meta.name) {
            self.apply_timeline_payload(message)?;
        }
        Ok(())
    }

    /// Folds the grants carried by a `dispersy-authorize`/`dispersy-revoke`/
    /// `dispersy-dynamic-settings` message into `self.timeline` via [`Timeline::apply`].
    fn apply_timeline_payload(&self, message: &Message) -> Result<()> {
        match &message.payload {
            Payload::Authorize(grants) | Payload::Revoke(grants) => {
                let granting = matches!(message.payload, Payload::Authorize(_));
                for grant in grants {
                    self.timeline.apply(TimelineEntry {
                        global_time: message.global_time,
                        member: grant.member,
                        message_name: grant.message_name.clone(),
                        permission: grant.permission,
                        grant: granting,
                    });
                }
                Ok(())
            }
            Payload::DynamicSettings(settings) => {
                for (message_name, _resolution) in settings {
                    self.timeline.apply(TimelineEntry {
                        global_time: message.global_time,
                        member: message.signer,
                        message_name: message_name.clone(),
                        permission: Permission::Permit,
                        grant: true,
                    });
                }
                Ok(())
            }
            _ => Err(Error::DropMessage(format!(
                "{} is a timeline message name but carries a non-timeline payload",
                message.meta_name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberKeys;

    fn full_member(byte: u8) -> Member {
        let public_key = vec![byte; 32];
        Member {
            mid: crate::member::Mid::of_public_key(&public_key),
            database_id: byte as u64,
            keys: MemberKeys::Full {
                public_key,
                private_key: Some(vec![byte; 32]),
            },
        }
    }

    #[test]
    fn create_sets_cid_from_own_public_key() {
        let me = full_member(1);
        let community = Community::create(me.clone(), 0, CandidatePool::new());
        assert_eq!(
            community.cid,
            CommunityId::of_master_public_key(me.public_key().unwrap())
        );
        assert_eq!(community.local_global_time(), 1);
    }

    #[test]
    fn hard_kill_rejects_every_global_time() {
        let me = full_member(2);
        let community = Community::create(me, 0, CandidatePool::new());
        community.hard_kill();
        assert!(!community.accepts_global_time(1));
        assert!(!community.accepts_global_time(i64::MAX));
    }

    #[test]
    fn soft_kill_freezes_at_current_global_time() {
        let me = full_member(3);
        let community = Community::create(me, 0, CandidatePool::new());
        community.claim_global_time();
        community.claim_global_time();
        let frozen_at = community.local_global_time();
        community.soft_kill();

        assert!(community.accepts_global_time(frozen_at));
        assert!(!community.accepts_global_time(frozen_at + 1));
    }

    #[test]
    fn note_error_hard_kills_on_fatal() {
        let me = full_member(4);
        let community = Community::create(me, 0, CandidatePool::new());
        community.note_error(&Error::DropPacket("bad signature".to_string()));
        assert_eq!(community.status(), CommunityStatus::Running);

        community.note_error(&Error::Fatal("database corrupted".to_string()));
        assert_eq!(community.status(), CommunityStatus::HardKilled);
    }

    fn gated_meta() -> crate::message::MetaMessage {
        crate::message::MetaMessage {
            name: "gated-msg".to_string(),
            database_id: 1,
            authentication: crate::message::Authentication::MemberAuthentication,
            resolution: crate::message::Resolution::Linear,
            distribution: crate::message::Distribution::FullSync,
            destination: crate::message::Destination::Community,
            priority: 100,
            undo_callback: None,
        }
    }

    fn authorize_meta() -> crate::message::MetaMessage {
        crate::message::MetaMessage {
            name: crate::message::NAME_AUTHORIZE.to_string(),
            database_id: 2,
            authentication: crate::message::Authentication::MemberAuthentication,
            resolution: crate::message::Resolution::Public,
            distribution: crate::message::Distribution::FullSync,
            destination: crate::message::Destination::Community,
            priority: 100,
            undo_callback: None,
        }
    }

    #[test]
    fn accept_message_denies_without_prior_authorization() {
        let me = full_member(5);
        let community = Community::create(me.clone(), 0, CandidatePool::new());
        community.meta_messages.register(gated_meta()).unwrap();

        let message = Message {
            meta_name: "gated-msg".to_string(),
            signer: me.mid,
            global_time: 1,
            payload: Payload::Custom(Vec::new()),
        };
        assert!(community.accept_message(&message).is_err());
    }

    #[test]
    fn accept_message_admits_a_message_authorized_on_the_timeline() {
        let me = full_member(6);
        let community = Community::create(me.clone(), 0, CandidatePool::new());
        community.meta_messages.register(gated_meta()).unwrap();
        community.meta_messages.register(authorize_meta()).unwrap();

        let authorize = Message {
            meta_name: crate::message::NAME_AUTHORIZE.to_string(),
            signer: me.mid,
            global_time: 1,
            payload: Payload::Authorize(vec![crate::message::PermissionGrant {
                member: me.mid,
                message_name: "gated-msg".to_string(),
                permission: Permission::Permit,
            }]),
        };
        community.accept_message(&authorize).unwrap();

        let message = Message {
            meta_name: "gated-msg".to_string(),
            signer: me.mid,
            global_time: 2,
            payload: Payload::Custom(Vec::new()),
        };
        assert!(community.accept_message(&message).is_ok());
    }

    #[test]
    fn accept_message_rejects_unknown_meta_name() {
        let me = full_member(7);
        let community = Community::create(me.clone(), 0, CandidatePool::new());
        let message = Message {
            meta_name: "never-registered".to_string(),
            signer: me.mid,
            global_time: 1,
            payload: Payload::Custom(Vec::new()),
        };
        assert!(community.accept_message(&message).is_err());
    }

    #[test]
    fn load_without_any_known_member_fails() {
        let dummy_master = crate::member::Member {
            mid: crate::member::Mid([9u8; 20]),
            database_id: 0,
            keys: MemberKeys::Dummy,
        };
        let dummy_me = crate::member::Member {
            mid: crate::member::Mid([10u8; 20]),
            database_id: 1,
            keys: MemberKeys::Dummy,
        };
        let result = Community::load(dummy_master, dummy_me, 0, CandidatePool::new(), 0, Vec::new());
        assert!(result.is_err());
    }
}
