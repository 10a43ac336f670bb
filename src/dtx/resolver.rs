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

use tracing::{debug, instrument};

use super::types::{AbortCause, ShardError, ShardRequest, ShardResponse};
use crate::clock::Epoch;
use crate::config::DtxConfig;
use crate::ilog::Value;
use crate::placement::ShardId;
use crate::protos::{DtxStatus, TxnId};
use crate::transport::{send_with_resend, Transport};

/// Resolves prepared entries of unknown outcome by asking their leaders.
///
/// It never guesses: a leader that is unreachable or undecided leaves the entry uncertain.
pub struct UncertaintyResolver<'a> {
    transport: &'a dyn Transport,
    config: &'a DtxConfig,
}

impl<'a> UncertaintyResolver<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a DtxConfig) -> Self {
        Self { transport, config }
    }

    async fn leader_status(&self, txn_id: TxnId, leader: ShardId) -> Result<Option<DtxStatus>, ShardError> {
        let request = ShardRequest::Status { txn_id };
        match send_with_resend(self.transport, leader, request, self.config).await {
            Ok(ShardResponse::Status(status)) => Ok(status),
            Ok(_) => Err(ShardError::UnexpectedResponse { request: "status" }),
            Err(err) => {
                debug!("leader {} of txn {} not reachable: {}", leader, txn_id, err);
                Err(ShardError::Uncertain { txn_id })
            },
        }
    }

    async fn apply(&self, txn_id: TxnId, participant: ShardId, request: ShardRequest) -> Result<(), ShardError> {
        match send_with_resend(self.transport, participant, request, self.config).await {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!("shard {} fails to apply outcome of txn {}: {}", participant, txn_id, err);
                Err(ShardError::Uncertain { txn_id })
            },
        }
    }

    /// Applies leader's outcome of transaction on given participant.
    #[instrument(skip_all, fields(txn.id = %txn_id, leader = leader, shard = participant))]
    pub async fn resolve(&self, txn_id: TxnId, leader: ShardId, participant: ShardId) -> Result<(), ShardError> {
        match self.leader_status(txn_id, leader).await? {
            Some(status) if status.is_decided() => {
                self.apply(txn_id, participant, ShardRequest::Commit { txn_id }).await
            },
            Some(DtxStatus::Aborted) => {
                let request = ShardRequest::Abort { txn_id, cause: AbortCause::Unknown };
                self.apply(txn_id, participant, request).await
            },
            _ => Err(ShardError::Uncertain { txn_id }),
        }
    }

    /// Resolves participant entry left prepared past prepare timeout.
    ///
    /// Leader without an entry has either never prepared the transaction or already forgotten it
    /// after all participants acked its outcome, so the entry is aborted.
    #[instrument(skip_all, fields(txn.id = %txn_id, leader = leader, shard = participant))]
    pub async fn resolve_stale(&self, txn_id: TxnId, leader: ShardId, participant: ShardId) -> Result<(), ShardError> {
        match self.leader_status(txn_id, leader).await? {
            None => {
                let request = ShardRequest::Abort { txn_id, cause: AbortCause::Timeout };
                self.apply(txn_id, participant, request).await
            },
            Some(_) => self.resolve(txn_id, leader, participant).await,
        }
    }

    /// Reads key on shard, resolving prepared versions beneath it on the way.
    pub async fn fetch(
        &self,
        shard: ShardId,
        key: &[u8],
        epoch: Epoch,
        reader: TxnId,
        membership: u64,
        record_read: bool,
    ) -> Result<Option<Value>, ShardError> {
        for _ in 0..=self.config.max_resolutions {
            let request = ShardRequest::Fetch { key: key.to_vec(), epoch, reader, membership, record_read };
            match send_with_resend(self.transport, shard, request, self.config).await {
                Ok(ShardResponse::Value(value)) => return Ok(value),
                Ok(_) => return Err(ShardError::UnexpectedResponse { request: "fetch" }),
                Err(ShardError::InProgress { txn_id, leader }) => self.resolve(txn_id, leader, shard).await?,
                Err(err) => return Err(err),
            }
        }
        Err(ShardError::Uncertain { txn_id: reader })
    }

    /// Lists visible keys on shard. Each attempt starts over so retries never double count.
    pub async fn enumerate(
        &self,
        shard: ShardId,
        epoch: Epoch,
        reader: TxnId,
        membership: u64,
    ) -> Result<Vec<Vec<u8>>, ShardError> {
        for _ in 0..=self.config.max_resolutions {
            let request = ShardRequest::Enumerate { epoch, reader, membership };
            match send_with_resend(self.transport, shard, request, self.config).await {
                Ok(ShardResponse::Keys(keys)) => return Ok(keys),
                Ok(_) => return Err(ShardError::UnexpectedResponse { request: "enumerate" }),
                Err(ShardError::InProgress { txn_id, leader }) => self.resolve(txn_id, leader, shard).await?,
                Err(err) => return Err(err),
            }
        }
        Err(ShardError::Uncertain { txn_id: reader })
    }
}
