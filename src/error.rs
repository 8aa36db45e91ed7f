// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

use crate::wire::CommunityId;
use std::result;
use thiserror::Error;
use tracing::{debug, error};

/// A specialised `Result` type for the crate.
pub type Result<T> = result::Result<T, Error>;

/// The dependency a `DelayPacket`/`DelayMessage` is waiting on before it can be
/// reprocessed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum MissingDependency {
    /// We are missing the `dispersy-identity` for the message's signer.
    Member,
    /// We are missing a proof (authorize/revoke) that would grant or deny permission.
    Proof,
    /// We are missing an earlier packet in a sequence-numbered stream.
    Sequence,
    /// We are missing a specific, named message this one depends on.
    Message(String),
}

/// Main error type for the crate.
///
/// Per-packet and per-message errors never propagate past the handler that raised them: one bad
/// peer cannot halt a community. Only [`Error::Fatal`] is surfaced to the scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Packet is malformed, signature invalid, or violates the timeline at its global time.
    /// Discarded silently; may be logged.
    #[error("dropped packet: {0}")]
    DropPacket(String),

    /// Packet parked because it depends on a dependency that has not arrived yet.
    #[error("delaying packet, missing dependency: {0:?}")]
    DelayPacket(MissingDependency),

    /// Message-level rejection raised by a handler after decode. Same effect as `DropPacket`.
    #[error("dropped message: {0}")]
    DropMessage(String),

    /// Message parked pending a dependency, at message granularity.
    #[error("delaying message, missing dependency: {0:?}")]
    DelayMessage(MissingDependency),

    /// Packet failed to (de)serialise.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Database corruption, crypto backend failure, or other unrecoverable condition. Causes
    /// community unload.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// `load` was asked for a community that has no matching row in the store.
    #[error("community not found: {0}")]
    CommunityNotFound(CommunityId),
}

impl Error {
    /// Whether this error should cause the community owning it to be unloaded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Logs this error at the severity its kind warrants: `error!` for anything fatal (about to
    /// trigger community unload), `debug!` for the routine per-packet/per-message rejections.
    pub fn log(&self, cid: CommunityId) {
        if self.is_fatal() {
            error!(%cid, error = %self, "fatal error, unloading community");
        } else {
            debug!(%cid, error = %self, "rejected packet or message");
        }
    }
}

pub(crate) fn convert_bincode_error(err: bincode::Error) -> Error {
    Error::Serialisation(err.to_string())
}
