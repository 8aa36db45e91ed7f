// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Member identity: the `mid` (20-byte SHA-1 of a public key) and the registry that interns
//! members globally, upgrading `DummyMember` stubs to full `Member`s in place as public keys
//! arrive.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::Arc;

/// 20-byte SHA-1 digest of a member's public key.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Mid(pub [u8; 20]);

impl Mid {
    pub fn of_public_key(public_key: &[u8]) -> Self {
        let digest = Sha1::digest(public_key);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Mid(bytes)
    }
}

impl fmt::Debug for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mid({})", hex::encode(self.0))
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A member's key material: either only the `mid` is known (`DummyMember`, e.g. referenced by an
/// authorize packet we haven't yet seen the identity packet for), or the full public key (and
/// optionally our own private key, for `my_member`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberKeys {
    Dummy,
    Full {
        public_key: Vec<u8>,
        private_key: Option<Vec<u8>>,
    },
}

/// A registry entry: a stable `database_id` plus the key material known about this `mid` so far.
#[derive(Clone, Debug)]
pub struct Member {
    pub mid: Mid,
    pub database_id: u64,
    pub keys: MemberKeys,
}

impl Member {
    pub fn is_dummy(&self) -> bool {
        matches!(self.keys, MemberKeys::Dummy)
    }

    pub fn public_key(&self) -> Option<&[u8]> {
        match &self.keys {
            MemberKeys::Dummy => None,
            MemberKeys::Full { public_key, .. } => Some(public_key),
        }
    }

    pub fn private_key(&self) -> Option<&[u8]> {
        match &self.keys {
            MemberKeys::Dummy => None,
            MemberKeys::Full { private_key, .. } => private_key.as_deref(),
        }
    }
}

/// Global interning table for members, keyed by `mid`.
///
/// Grounded on the `DashMap`-keyed session table in the teacher's DKG voter: a shared,
/// concurrency-tolerant map that individual communities look entries up in rather than owning
/// their own copies.
#[derive(Clone, Default)]
pub struct MemberRegistry {
    members: Arc<DashMap<Mid, Member>>,
    next_database_id: Arc<std::sync::atomic::AtomicU64>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a member by `mid`, if anything is known about it (dummy or full).
    pub fn get(&self, mid: &Mid) -> Option<Member> {
        self.members.get(mid).map(|entry| entry.clone())
    }

    /// Returns the existing record for `mid`, creating a `DummyMember` stub if nothing is known
    /// yet.
    pub fn get_or_create_dummy(&self, mid: Mid) -> Member {
        if let Some(existing) = self.members.get(&mid) {
            return existing.clone();
        }
        let database_id = self
            .next_database_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let member = Member {
            mid,
            database_id,
            keys: MemberKeys::Dummy,
        };
        self.members.entry(mid).or_insert(member.clone());
        member
    }

    /// Interns a full member from its public key, upgrading an existing `DummyMember` stub in
    /// place (preserving `database_id`) if one already existed for this `mid`.
    pub fn intern_full(&self, public_key: Vec<u8>, private_key: Option<Vec<u8>>) -> Member {
        let mid = Mid::of_public_key(&public_key);
        let database_id = self
            .next_database_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut resolved = None;
        self.members
            .entry(mid)
            .and_modify(|entry| {
                entry.keys = MemberKeys::Full {
                    public_key: public_key.clone(),
                    private_key: private_key.clone(),
                };
                resolved = Some(entry.clone());
            })
            .or_insert_with(|| {
                let member = Member {
                    mid,
                    database_id,
                    keys: MemberKeys::Full {
                        public_key,
                        private_key,
                    },
                };
                resolved = Some(member.clone());
                member
            });

        resolved.expect("entry API always populates `resolved`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> Vec<u8> {
        vec![byte; 32]
    }

    #[test]
    fn mid_is_sha1_of_public_key() {
        let member = Member {
            mid: Mid::of_public_key(&pk(1)),
            database_id: 0,
            keys: MemberKeys::Full {
                public_key: pk(1),
                private_key: None,
            },
        };
        assert_eq!(member.mid, Mid::of_public_key(member.public_key().unwrap()));
    }

    #[test]
    fn dummy_upgrade_preserves_database_id() {
        let registry = MemberRegistry::new();
        let mid = Mid::of_public_key(&pk(7));
        let dummy = registry.get_or_create_dummy(mid);
        assert!(dummy.is_dummy());

        let full = registry.intern_full(pk(7), None);
        assert_eq!(full.database_id, dummy.database_id);
        assert!(!full.is_dummy());

        let looked_up = registry.get(&mid).unwrap();
        assert_eq!(looked_up.database_id, dummy.database_id);
        assert!(!looked_up.is_dummy());
    }

    #[test]
    fn distinct_keys_get_distinct_mids() {
        let registry = MemberRegistry::new();
        let a = registry.intern_full(pk(1), None);
        let b = registry.intern_full(pk(2), None);
        assert_ne!(a.mid, b.mid);
    }
}
