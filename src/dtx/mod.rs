// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shard side of distributed transactions: entries, prepare and commit handling, coordination by
//! leaders and background resolution.

mod aggregator;
mod conflict;
mod entry;
mod leader;
mod resolver;
mod resync;
mod shard;
mod table;
mod types;

pub use self::aggregator::{Aggregation, Aggregator, TaskHandle};
pub use self::conflict::ConflictDetector;
pub use self::entry::DtxEntry;
pub use self::leader::Leader;
pub use self::resolver::UncertaintyResolver;
pub use self::resync::{ResyncEngine, ResyncReport};
pub use self::shard::{Shard, ShardState};
pub use self::table::DtxTable;
pub use self::types::{
    AbortCause,
    CommitRequest,
    PrepareRequest,
    ShardError,
    ShardOps,
    ShardRequest,
    ShardResponse,
    Write,
};
