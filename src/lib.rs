// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Dispersy: a decentralized gossip overlay for authenticated communities.
//!
//! A node joins one or more [`community::Community`] overlays, each keyed by the SHA-1 of its
//! master member's public key ([`wire::CommunityId`]). Messages are gossiped rather than routed:
//! peers periodically diff their stored history against a peer's [`bloom::BloomFilter`] and push
//! whatever the filter says the peer is missing. Who may say what is governed by a per-community
//! [`timeline::Timeline`]; who to gossip with is chosen by the [`walker::Walker`] from a shared
//! [`candidate::CandidatePool`].
//!
//! This crate implements the overlay's logic: identity, global time, sync claim strategies,
//! timeline, candidates, and the walker's handshakes. Wire-level byte framing and transport I/O
//! are deliberately out of scope (see [`wire`] for the data shapes involved without a bundled
//! codec), matching the framework/network-layer split the original implementation draws.

pub mod bloom;
pub mod candidate;
pub mod community;
pub mod config;
pub mod delay_queue;
pub mod error;
pub mod member;
pub mod message;
pub mod scheduler;
pub mod sync;
pub mod time;
pub mod timeline;
pub mod walker;
pub mod wire;

pub use error::{Error, MissingDependency, Result};
