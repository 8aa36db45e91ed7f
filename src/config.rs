// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Tunables for one dispersy instance, collected in a single plain struct.
//!
//! Grounded on the teacher's `qp2p`-style `Config` structs: one struct of `Duration`s and plain
//! numbers with a `Default` impl, rather than scattering magic numbers across the modules that
//! use them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `dispersy_sync_response_limit` is carried over from the original implementation verbatim —
/// `5 * 1025`, not a round number, not `5 * 1024`. Preserved as-is rather than "fixed" to a power
/// of two; open question resolved in favor of wire compatibility with the original network.
pub const DISPERSY_SYNC_RESPONSE_LIMIT: usize = 5 * 1025;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// False-positive rate used for every bloom filter unless a community overrides it.
    pub bloom_error_rate: f64,

    /// `ACCEPTABLE_GLOBAL_TIME_RANGE` added on top of the observed quorum median.
    pub acceptable_time_range: i64,
    /// How long an `acceptable_global_time` computation is cached before being recomputed.
    pub acceptable_time_cache_ttl: Duration,

    /// How many times a `SyncCache` entry may be reused before it is discarded outright.
    pub sync_cache_reuse_cap: u32,

    /// How often a normal (non-bootstrap) candidate becomes eligible to be walked again.
    pub walk_rewalk_interval: Duration,
    /// How often a bootstrap candidate becomes eligible to be walked again.
    pub bootstrap_rewalk_interval: Duration,
    /// How long a walk's three-way handshake stays open before it's considered abandoned.
    pub walk_lifetime: Duration,

    /// How long we wait for a double-signed message's second signature before giving up.
    pub signature_request_timeout: Duration,
    /// How often the sync loop fires per community.
    pub sync_interval: Duration,
    /// How long a puncture-request waits for its puncture before being considered failed.
    pub puncture_timeout: Duration,

    /// Delay before the first retry of a master member download.
    pub master_download_initial_delay: Duration,
    /// Ceiling the retry delay backs off toward.
    pub master_download_max_delay: Duration,
    /// Multiplicative backoff factor applied to the master member download retry delay.
    pub master_download_backoff: f64,

    /// Maximum payload bytes per sync response packet.
    pub dispersy_sync_response_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bloom_error_rate: crate::bloom::DEFAULT_ERROR_RATE,

            acceptable_time_range: 10_000,
            acceptable_time_cache_ttl: Duration::from_secs(5),

            sync_cache_reuse_cap: crate::sync::cache::REUSE_CAP,

            walk_rewalk_interval: Duration::from_secs(30),
            bootstrap_rewalk_interval: Duration::from_secs(55),
            walk_lifetime: Duration::from_secs(30),

            signature_request_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(20),
            puncture_timeout: Duration::from_secs(5),

            master_download_initial_delay: Duration::from_secs(2),
            master_download_max_delay: Duration::from_secs(300),
            master_download_backoff: 1.1,

            dispersy_sync_response_limit: DISPERSY_SYNC_RESPONSE_LIMIT,
        }
    }
}

impl Config {
    /// The next retry delay for a master member download, given the previous delay (or `None` for
    /// the first attempt).
    pub fn next_master_download_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.master_download_initial_delay,
            Some(previous) => {
                let scaled = previous.mul_f64(self.master_download_backoff);
                scaled.min(self.master_download_max_delay)
            }
        }
    }

    /// Serialises this configuration to JSON, e.g. for a config file on disk.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| crate::Error::Serialisation(err.to_string()))
    }

    /// Parses a configuration previously written by [`Config::to_json`].
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw).map_err(|err| crate::Error::Serialisation(err.to_string()))
    }
}
