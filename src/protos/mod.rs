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

//! Protobuf messages persisted by shards.

mod record;
mod txn;

/// Transaction identity: coordinator uuid plus a per coordinator sequence.
#[derive(Copy, Eq, Hash, PartialOrd, Ord)]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnId {
    #[prost(uint64, tag = "1")]
    pub msb: u64,
    #[prost(uint64, tag = "2")]
    pub lsb: u64,
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

/// Status of a DTX entry on one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DtxStatus {
    Prepared = 0,
    Committable = 1,
    Committed = 2,
    Aborted = 3,
}

/// Durable image of a DTX entry.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DtxRecord {
    #[prost(message, optional, tag = "1")]
    pub txn_id: Option<TxnId>,
    #[prost(uint64, tag = "2")]
    pub epoch: u64,
    /// Participant bitmap words.
    #[prost(uint64, repeated, tag = "3")]
    pub participants: Vec<u64>,
    #[prost(enumeration = "DtxStatus", tag = "4")]
    pub status: i32,
    #[prost(uint32, tag = "5")]
    pub leader: u32,
    /// Milliseconds since unix epoch.
    #[prost(uint64, tag = "6")]
    pub created_ms: u64,
    #[prost(bool, tag = "7")]
    pub read_only: bool,
    /// Keys staged on this shard.
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub keys: Vec<Vec<u8>>,
    /// Tombstone of a garbage collected entry.
    #[prost(bool, tag = "9")]
    pub forgotten: bool,
}
