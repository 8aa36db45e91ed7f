// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Wire-shape constants and plain data structs for the frames spec.md §6 describes.
//!
//! This module intentionally stops short of being a byte-exact encoder: bit-for-bit wire framing
//! is the externalized packet codec's job (spec.md §1 names it out of scope). What lives here is
//! the vocabulary the rest of the crate needs to reason about sizes and shapes — the 51-byte
//! dispersy header, the 22-byte community prefix, and the introduction-request payload — so that
//! `SyncEngine`/`Walker` can be exercised without depending on a concrete wire codec crate.

use crate::member::Mid;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Size in bytes of the dispersy wire header: `version(2) || cid(20) || type(1) ||
/// member_mid_or_public_key(20) || global_time(8)`.
pub const DISPERSY_HEADER_LEN: usize = 2 + 20 + 1 + 20 + 8;

/// Size in bytes of the 22-byte community prefix prepended to every community-level packet:
/// `dispersy_version(1) || community_version(1) || cid(20)`.
pub const COMMUNITY_PREFIX_LEN: usize = 1 + 1 + 20;

/// Size in bytes of an address on the wire: 4-byte IPv4 + 2-byte big-endian port.
pub const ADDRESS_LEN: usize = 6;

/// Fixed overhead of the non-sync portion of an introduction-request payload:
/// `destination_addr(6) + source_lan(6) + source_wan(6) + flags(1) + identifier(2)`.
pub const INTRODUCTION_REQUEST_FIXED_LEN: usize = ADDRESS_LEN * 3 + 1 + 2;

/// Fixed overhead of the sync portion of an introduction-request payload, not counting the bloom
/// filter bytes themselves: `time_low(8) + time_high(8) + modulo(4) + offset(4) + function(1) +
/// bits(4) + prefix(1)`.
pub const SYNC_HEADER_LEN: usize = 8 + 8 + 4 + 4 + 1 + 4 + 1;

/// A wire address: 4-byte IPv4 address + 2-byte big-endian port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl WireAddress {
    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        out[0..4].copy_from_slice(&self.ip.octets());
        out[4..6].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; ADDRESS_LEN]) -> Self {
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Self { ip, port }
    }
}

/// `cid = SHA1(master_public_key)`: 20-byte community identifier.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CommunityId(pub [u8; 20]);

impl CommunityId {
    pub fn of_master_public_key(master_public_key: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(master_public_key);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        CommunityId(bytes)
    }
}

impl std::fmt::Debug for CommunityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommunityId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for CommunityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The 22-byte prefix prepended to every community-level packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityPrefix {
    pub dispersy_version: u8,
    pub community_version: u8,
    pub cid: CommunityId,
}

impl CommunityPrefix {
    pub const LEN: usize = COMMUNITY_PREFIX_LEN;
}

/// Identifies the signer of a packet: either just the `mid` (common case) or, rarely, the raw
/// public key itself (e.g. the first identity packet for a member the recipient has never seen).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRef {
    Mid(Mid),
    PublicKey(Vec<u8>),
}

/// The 51-byte dispersy header preceding every message's payload and signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispersyHeader {
    pub version: u16,
    pub cid: CommunityId,
    pub message_type: u8,
    pub member: MemberRef,
    pub global_time: i64,
}

/// Flags packed into the single flags byte of an introduction-request payload.
pub mod introduction_flags {
    pub const ADVICE: u8 = 0b0000_0001;
    pub const CONNECTION_TYPE: u8 = 0b0000_0010;
    pub const SYNC: u8 = 0b0000_0100;
}

/// The sync tuple attached to an introduction-request when `SYNC` is set, carrying the bloom
/// filter the requester wants the recipient to diff their syncable messages against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub time_low: i64,
    pub time_high: i64,
    pub modulo: u32,
    pub offset: u32,
    pub bloom_bits: u32,
    pub bloom_prefix: u8,
    pub bloom_bytes: Vec<u8>,
}

/// `dispersy-introduction-request` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionRequestPayload {
    pub destination_addr: WireAddress,
    pub source_lan: WireAddress,
    pub source_wan: WireAddress,
    pub flags: u8,
    pub identifier: u16,
    pub sync: Option<SyncPayload>,
}

/// The two degrees of `dispersy-destroy-community`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyDegree {
    /// Freeze the community at the destroy packet's global time; reject anything claiming a
    /// higher time. Cleanup for soft-kill is left to the community (open question, spec.md §9).
    SoftKill,
    /// Discard all state except the destroy proof; respond to every introduction-request with
    /// only the destroy packet.
    HardKill,
}
