// Copyright 2024 Dispersy Contributors.
//
// This software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the software.

//! Anti-entropy sync: the storage seam (`store`), per-candidate claim reuse (`cache`), and the
//! claim strategies themselves (`engine`).

pub mod cache;
pub mod engine;
pub mod store;

pub use cache::SyncCache;
pub use engine::{ClaimedRange, SyncEngine};
pub use store::{StoredMessage, SyncStore};
