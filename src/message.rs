// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! `MetaMessage` descriptors, the per-community `MessageCatalog`, and the `Conversion` seam that
//! turns wire bytes into a parsed [`Message`].
//!
//! Grounded on the teacher's `SystemMsg` enum (`messaging::system::mod`): one tagged-variant type
//! carries every built-in message kind, dispatched on load by a catalog keyed by name, exactly as
//! spec.md §4.6 describes ("a tagged-variant `MetaMessage`... no inheritance hierarchy").

use crate::member::Mid;
use crate::wire::{CommunityPrefix, DestroyDegree, IntroductionRequestPayload};
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a message's signature is validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authentication {
    /// No signature; anyone may claim to be the author (rare, e.g. pure gossip pings).
    NoAuthentication,
    /// Signed by exactly one member.
    MemberAuthentication,
    /// Signed by two or more members (e.g. a mutually agreed handshake message).
    DoubleMemberAuthentication,
}

/// Which permission policy governs who may issue this message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Anyone may `permit`; no timeline entry is required for that permission to be granted.
    Public,
    /// A single `dispersy-authorize` is sufficient and is never revisited.
    Linear,
    /// Governed by `dispersy-dynamic-settings`: the effective resolution can itself change over
    /// time, recorded in the timeline like any other permission.
    Dynamic,
}

/// Whether and how a message participates in anti-entropy sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Every instance is kept and synced.
    FullSync,
    /// Only the last `history_size` instances per signer are kept and synced.
    LastSync { history_size: u32 },
    /// Never stored for sync; delivered once, point to point.
    Direct,
}

impl Distribution {
    /// `distribution is SyncDistribution`, per the glossary's definition of "syncable".
    pub fn is_sync_distribution(&self) -> bool {
        !matches!(self, Distribution::Direct)
    }
}

/// Where a message is addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// Broadcast-ish: relevant to the whole community (subject to sync, not direct delivery).
    Community,
    /// Addressed to a specific candidate (e.g. introduction-response, puncture).
    Candidate,
}

/// Immutable descriptor of one message kind within a community.
///
/// Priority `> 32` marks a message as syncable (together with a `SyncDistribution`), per the
/// glossary.
#[derive(Clone)]
pub struct MetaMessage {
    pub name: String,
    pub database_id: u64,
    pub authentication: Authentication,
    pub resolution: Resolution,
    pub distribution: Distribution,
    pub destination: Destination,
    pub priority: u8,
    pub undo_callback: Option<Arc<dyn Fn(&Mid, i64) + Send + Sync>>,
}

impl fmt::Debug for MetaMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaMessage")
            .field("name", &self.name)
            .field("database_id", &self.database_id)
            .field("authentication", &self.authentication)
            .field("resolution", &self.resolution)
            .field("distribution", &self.distribution)
            .field("destination", &self.destination)
            .field("priority", &self.priority)
            .field("undo_callback", &self.undo_callback.is_some())
            .finish()
    }
}

impl MetaMessage {
    /// `syncable = distribution is SyncDistribution && priority > 32`.
    pub fn is_syncable(&self) -> bool {
        self.distribution.is_sync_distribution() && self.priority > 32
    }

    /// Dispersy-internal message names must start with `"dispersy-"`; user messages must not.
    pub fn is_internal(&self) -> bool {
        self.name.starts_with("dispersy-")
    }
}

/// The built-in dispersy message names that always flow through `Timeline::replay` in addition
/// to their normal handling (spec.md §4.6).
pub const NAME_IDENTITY: &str = "dispersy-identity";
pub const NAME_AUTHORIZE: &str = "dispersy-authorize";
pub const NAME_REVOKE: &str = "dispersy-revoke";
pub const NAME_DYNAMIC_SETTINGS: &str = "dispersy-dynamic-settings";
pub const NAME_DESTROY_COMMUNITY: &str = "dispersy-destroy-community";
pub const NAME_INTRODUCTION_REQUEST: &str = "dispersy-introduction-request";
pub const NAME_INTRODUCTION_RESPONSE: &str = "dispersy-introduction-response";
pub const NAME_PUNCTURE_REQUEST: &str = "dispersy-puncture-request";
pub const NAME_PUNCTURE: &str = "dispersy-puncture";
pub const NAME_MISSING_IDENTITY: &str = "dispersy-missing-identity";

pub fn is_timeline_message(name: &str) -> bool {
    matches!(name, NAME_AUTHORIZE | NAME_REVOKE | NAME_DYNAMIC_SETTINGS)
}

/// Per-community table of `MetaMessage`s, populated from the framework's built-ins first and
/// then the subclass's own, rejecting a duplicate `name` either way.
#[derive(Default)]
pub struct MessageCatalog {
    by_name: DashMap<String, Arc<MetaMessage>>,
}

impl MessageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a meta-message. Returns `Err` if `name` is already registered — the uniqueness
    /// check spec.md §4.6 requires, applied uniformly to framework and subclass messages.
    pub fn register(&self, meta: MetaMessage) -> Result<()> {
        if self.by_name.contains_key(&meta.name) {
            return Err(Error::Fatal(format!(
                "duplicate meta-message name: {}",
                meta.name
            )));
        }
        self.by_name.insert(meta.name.clone(), Arc::new(meta));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<MetaMessage>> {
        self.by_name.get(name).map(|entry| entry.clone())
    }

    pub fn by_database_id(&self, database_id: u64) -> Option<Arc<MetaMessage>> {
        self.by_name
            .iter()
            .find(|entry| entry.database_id == database_id)
            .map(|entry| entry.clone())
    }

    /// Every syncable meta-message's `database_id`, used by the sync engine to build `S` (spec.md
    /// §4.4).
    pub fn syncable_database_ids(&self) -> Vec<u64> {
        self.by_name
            .iter()
            .filter(|entry| entry.is_syncable())
            .map(|entry| entry.database_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// A granted or revoked permission, as carried by `dispersy-authorize`/`dispersy-revoke`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub member: Mid,
    pub message_name: String,
    pub permission: Permission,
}

/// The permission kinds the timeline tracks, per spec.md §3 `TimelineEntry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Permit,
    Authorize,
    Revoke,
    Undo,
}

/// The parsed, dispatch-ready form of a packet. Wire-level decoding into this shape is the
/// externalized packet codec's job (spec.md §1); this type is the seam `Conversion`
/// implementations produce and every handler consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub meta_name: String,
    pub signer: Mid,
    pub global_time: i64,
    pub payload: Payload,
}

/// Built-in dispersy payload kinds. Community-specific messages carry `Payload::Custom` and are
/// dispatched to subclass handlers, which are out of scope for this crate (spec.md §1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Identity,
    Authorize(Vec<PermissionGrant>),
    Revoke(Vec<PermissionGrant>),
    DynamicSettings(Vec<(String, Resolution)>),
    DestroyCommunity(DestroyDegree),
    IntroductionRequest(IntroductionRequestPayload),
    IntroductionResponse {
        destination_addr: crate::wire::WireAddress,
        lan: crate::wire::WireAddress,
        wan: crate::wire::WireAddress,
        identifier: u16,
    },
    PunctureRequest {
        lan: crate::wire::WireAddress,
        wan: crate::wire::WireAddress,
    },
    Puncture {
        lan: crate::wire::WireAddress,
        wan: crate::wire::WireAddress,
    },
    MissingIdentity {
        mid: Mid,
    },
    Custom(Vec<u8>),
}

/// Turns wire bytes into a [`Message`] (and back), selected by a 22-byte community prefix.
///
/// A default, `bincode`-based implementation ([`DefaultConversion`]) is provided so the engine is
/// exercisable end to end; community authors are expected to supply their own for custom payload
/// formats, exactly as the `default`/`alternate` `conversions` map in spec.md §3 anticipates.
pub trait Conversion: Send + Sync {
    fn prefix(&self) -> CommunityPrefix;
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// The default `bincode`+`serde` conversion: not a byte-exact reimplementation of the original
/// wire format, but sufficient to round-trip every built-in message kind for testing and for
/// communities that don't need interop with the Python implementation's wire bytes.
pub struct DefaultConversion {
    prefix: CommunityPrefix,
}

impl DefaultConversion {
    pub fn new(prefix: CommunityPrefix) -> Self {
        Self { prefix }
    }
}

impl Conversion for DefaultConversion {
    fn prefix(&self) -> CommunityPrefix {
        self.prefix
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        bincode::serialize(message).map_err(crate::error::convert_bincode_error)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        bincode::deserialize(bytes).map_err(crate::error::convert_bincode_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, database_id: u64, priority: u8) -> MetaMessage {
        MetaMessage {
            name: name.to_string(),
            database_id,
            authentication: Authentication::MemberAuthentication,
            resolution: Resolution::Public,
            distribution: Distribution::FullSync,
            destination: Destination::Community,
            priority,
            undo_callback: None,
        }
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let catalog = MessageCatalog::new();
        catalog.register(meta("foo", 1, 100)).unwrap();
        assert!(catalog.register(meta("foo", 2, 100)).is_err());
    }

    #[test]
    fn syncable_requires_priority_above_32() {
        let catalog = MessageCatalog::new();
        catalog.register(meta("low", 1, 32)).unwrap();
        catalog.register(meta("high", 2, 33)).unwrap();
        let ids = catalog.syncable_database_ids();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn direct_distribution_never_syncable() {
        let mut direct = meta("direct-msg", 1, 255);
        direct.distribution = Distribution::Direct;
        assert!(!direct.is_syncable());
    }

    #[test]
    fn internal_name_prefix() {
        assert!(is_timeline_message(NAME_AUTHORIZE));
        assert!(is_timeline_message(NAME_REVOKE));
        assert!(is_timeline_message(NAME_DYNAMIC_SETTINGS));
        assert!(!is_timeline_message(NAME_IDENTITY));
    }

    #[test]
    fn default_conversion_round_trips_identity() {
        let conv = DefaultConversion::new(CommunityPrefix {
            dispersy_version: 1,
            community_version: 1,
            cid: crate::wire::CommunityId([0u8; 20]),
        });
        let message = Message {
            meta_name: NAME_IDENTITY.to_string(),
            signer: Mid([1u8; 20]),
            global_time: 1,
            payload: Payload::Identity,
        };
        let bytes = conv.encode(&message).unwrap();
        let decoded = conv.decode(&bytes).unwrap();
        assert_eq!(message, decoded);
    }
}
