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

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use thiserror::Error;

use crate::clock::Epoch;
use crate::ilog::Value;
use crate::placement::{ShardBitmap, ShardId};
use crate::protos::{DtxStatus, TxnId};

/// Buffered write of a key, `None` value punches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub key: Vec<u8>,
    pub value: Option<Value>,
}

/// Operations of one transaction on one shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardOps {
    pub shard: ShardId,
    pub reads: Vec<Vec<u8>>,
    pub writes: Vec<Write>,
}

/// Prepare sub-operation sent by leader to each participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareRequest {
    pub txn_id: TxnId,
    pub epoch: Epoch,
    pub leader: ShardId,
    pub participants: ShardBitmap,
    pub membership: u64,
    pub reads: Vec<Vec<u8>>,
    pub writes: Vec<Write>,
    /// Whether participant keeps an entry for read only operations.
    pub tracked: bool,
    pub read_only: bool,
}

/// Whole transaction sent by client to its leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRequest {
    pub txn_id: TxnId,
    pub epoch: Epoch,
    pub membership: u64,
    pub participants: ShardBitmap,
    pub ops: Vec<ShardOps>,
    pub read_only: bool,
    pub tracked: bool,
    pub fan_in_timeout: Duration,
}

impl CommitRequest {
    pub fn prepare_request(&self, leader: ShardId, ops: &ShardOps) -> PrepareRequest {
        PrepareRequest {
            txn_id: self.txn_id,
            epoch: self.epoch,
            leader,
            participants: self.participants.clone(),
            membership: self.membership,
            reads: ops.reads.clone(),
            writes: ops.writes.clone(),
            tracked: self.tracked,
            read_only: self.read_only,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardRequest {
    /// Coordinates commit of a whole transaction, served by its leader.
    Coordinate(CommitRequest),
    /// Asks leader to abort a transaction whose commit outcome was ambiguous to client.
    Cancel { txn_id: TxnId },
    Prepare(PrepareRequest),
    Commit { txn_id: TxnId },
    Abort { txn_id: TxnId, cause: AbortCause },
    Status { txn_id: TxnId },
    Fetch { key: Vec<u8>, epoch: Epoch, reader: TxnId, membership: u64, record_read: bool },
    Enumerate { epoch: Epoch, reader: TxnId, membership: u64 },
}

impl ShardRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ShardRequest::Coordinate(_) => "coordinate",
            ShardRequest::Cancel { .. } => "cancel",
            ShardRequest::Prepare(_) => "prepare",
            ShardRequest::Commit { .. } => "commit",
            ShardRequest::Abort { .. } => "abort",
            ShardRequest::Status { .. } => "status",
            ShardRequest::Fetch { .. } => "fetch",
            ShardRequest::Enumerate { .. } => "enumerate",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardResponse {
    Done,
    Status(Option<DtxStatus>),
    Value(Option<Value>),
    Keys(Vec<Vec<u8>>),
}

/// Why a transaction got aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbortCause {
    Conflict { epoch: Epoch },
    StaleMembership,
    Io,
    Timeout,
    /// Client gave up.
    Requested,
    /// Resync found a participant missing or aborted.
    Resync,
    /// Cause did not survive restart.
    Unknown,
}

impl AbortCause {
    /// Precedence when participants fail differently, higher wins.
    fn rank(&self) -> u8 {
        match self {
            AbortCause::Io => 6,
            AbortCause::Requested => 5,
            AbortCause::Resync => 4,
            AbortCause::Unknown => 3,
            AbortCause::StaleMembership => 2,
            AbortCause::Conflict { .. } => 1,
            AbortCause::Timeout => 0,
        }
    }

    pub fn max(self, other: AbortCause) -> AbortCause {
        match (self, other) {
            (AbortCause::Conflict { epoch: a }, AbortCause::Conflict { epoch: b }) => {
                AbortCause::Conflict { epoch: a.max(b) }
            },
            _ if other.rank() > self.rank() => other,
            _ => self,
        }
    }
}

impl Display for AbortCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Conflict { epoch } => write!(f, "conflict at epoch {epoch}"),
            AbortCause::StaleMembership => f.write_str("stale membership"),
            AbortCause::Io => f.write_str("io failure"),
            AbortCause::Timeout => f.write_str("fan-in timeout"),
            AbortCause::Requested => f.write_str("requested"),
            AbortCause::Resync => f.write_str("resync"),
            AbortCause::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    #[error("txn {txn_id} conflicts on key {key:?} with epoch {epoch}")]
    Conflict { txn_id: TxnId, key: Vec<u8>, epoch: Epoch },
    #[error("stale membership version {version}, current {current}")]
    StaleMembership { version: u64, current: u64 },
    #[error("shard {shard} io failure: {message}")]
    Io { shard: ShardId, message: String },
    #[error("txn {txn_id} still in progress, ask leader shard {leader}")]
    InProgress { txn_id: TxnId, leader: ShardId },
    #[error("txn {txn_id} aborted: {cause}")]
    Aborted { txn_id: TxnId, cause: AbortCause },
    #[error("txn {txn_id} already committed")]
    Committed { txn_id: TxnId },
    #[error("txn {txn_id} outcome uncertain")]
    Uncertain { txn_id: TxnId },
    #[error("shard {shard} unreachable")]
    Unreachable { shard: ShardId },
    #[error("request to shard {shard} timed out")]
    Timeout { shard: ShardId },
    #[error("unexpected response for {request} request")]
    UnexpectedResponse { request: &'static str },
}

impl ShardError {
    pub fn io(shard: ShardId, message: impl Into<String>) -> Self {
        Self::Io { shard, message: message.into() }
    }

    /// Abort cause leader records when a participant fails prepare with this error.
    pub fn abort_cause(&self) -> AbortCause {
        match self {
            ShardError::Conflict { epoch, .. } => AbortCause::Conflict { epoch: *epoch },
            ShardError::StaleMembership { .. } => AbortCause::StaleMembership,
            ShardError::Timeout { .. } => AbortCause::Timeout,
            ShardError::Aborted { cause, .. } => *cause,
            ShardError::Io { .. }
            | ShardError::Unreachable { .. }
            | ShardError::InProgress { .. }
            | ShardError::Committed { .. }
            | ShardError::Uncertain { .. }
            | ShardError::UnexpectedResponse { .. } => AbortCause::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn abort_cause_precedence() {
        let conflict = AbortCause::Conflict { epoch: Epoch::new(5) };
        assert_that!(conflict.max(AbortCause::Io)).is_equal_to(AbortCause::Io);
        assert_that!(AbortCause::Io.max(conflict)).is_equal_to(AbortCause::Io);
        assert_that!(AbortCause::Timeout.max(conflict)).is_equal_to(conflict);
        assert_that!(conflict.max(AbortCause::Conflict { epoch: Epoch::new(9) }))
            .is_equal_to(AbortCause::Conflict { epoch: Epoch::new(9) });
        assert_that!(AbortCause::StaleMembership.max(conflict)).is_equal_to(AbortCause::StaleMembership);
    }

    #[test]
    fn abort_cause_of_errors() {
        let txn_id = TxnId::new(uuid::Uuid::new_v4(), 1);
        let conflict = ShardError::Conflict { txn_id, key: b"k".to_vec(), epoch: Epoch::new(3) };
        assert_that!(conflict.abort_cause()).is_equal_to(AbortCause::Conflict { epoch: Epoch::new(3) });
        assert_that!(ShardError::io(1, "disk").abort_cause()).is_equal_to(AbortCause::Io);
        assert_that!(ShardError::Unreachable { shard: 1 }.abort_cause()).is_equal_to(AbortCause::Io);
        assert_that!(ShardError::Timeout { shard: 1 }.abort_cause()).is_equal_to(AbortCause::Timeout);
        assert_that!(ShardError::Aborted { txn_id, cause: AbortCause::Requested }.abort_cause())
            .is_equal_to(AbortCause::Requested);
    }
}
