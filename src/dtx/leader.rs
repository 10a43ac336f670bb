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

use std::sync::Arc;

use futures::future;
use tracing::{debug, instrument, trace, warn};

use super::shard::Shard;
use super::types::{AbortCause, CommitRequest, ShardError, ShardRequest};
use crate::config::{CommitPolicy, DtxConfig};
use crate::fault::FaultInjection;
use crate::placement::{ShardBitmap, ShardId};
use crate::protos::TxnId;
use crate::transport::{send_with_resend, Transport};

/// Coordinator of transactions led by one shard.
pub struct Leader<'a> {
    shard: &'a Arc<Shard>,
    transport: &'a dyn Transport,
    config: &'a DtxConfig,
    faults: &'a FaultInjection,
}

impl<'a> Leader<'a> {
    pub fn new(
        shard: &'a Arc<Shard>,
        transport: &'a dyn Transport,
        config: &'a DtxConfig,
        faults: &'a FaultInjection,
    ) -> Self {
        Self { shard, transport, config, faults }
    }

    pub fn id(&self) -> ShardId {
        self.shard.id()
    }

    /// Prepares transaction on all participants and decides its outcome.
    ///
    /// A resent request of a decided transaction replies recorded outcome.
    #[instrument(skip_all, fields(txn.id = %request.txn_id, leader = self.id()))]
    pub async fn coordinate(&self, request: CommitRequest) -> Result<(), ShardError> {
        let txn_id = request.txn_id;
        if let Some(status) = self.shard.outcome(txn_id)? {
            if status.is_decided() {
                debug!("txn {} already decided as {:?}", txn_id, status);
                return Ok(());
            }
        }
        if let Err(cause) = self.prepare_all(&request).await {
            debug!("txn {} aborts: {}", txn_id, cause);
            self.abort_all(txn_id, &request.participants, cause).await?;
            return Err(ShardError::Aborted { txn_id, cause });
        }
        if request.read_only && !request.tracked {
            return Ok(());
        }
        if let Err(err) = self.shard.mark_committable(txn_id).await {
            warn!("txn {} fails to become committable: {}", txn_id, err);
            self.abort_all(txn_id, &request.participants, err.abort_cause()).await?;
            return Err(err);
        }
        if self.faults.keeps_prepared() {
            return Ok(());
        }
        if request.read_only || self.faults.sync_only() || self.config.commit_policy == CommitPolicy::Sync {
            self.commit_all(txn_id, &request.participants).await;
        }
        Ok(())
    }

    async fn prepare_all(&self, request: &CommitRequest) -> Result<(), AbortCause> {
        let leader = self.id();
        let prepares = request.ops.iter().map(|ops| {
            let prepare = request.prepare_request(leader, ops);
            async move {
                let result = match ops.shard == leader {
                    true => self.shard.prepare(&prepare).await,
                    false => {
                        send_with_resend(self.transport, ops.shard, ShardRequest::Prepare(prepare), self.config)
                            .await
                            .map(|_| ())
                    },
                };
                result.map_err(|err| {
                    debug!("shard {} fails to prepare: {}", ops.shard, err);
                    err.abort_cause()
                })
            }
        });
        let Ok(results) = tokio::time::timeout(request.fan_in_timeout, future::join_all(prepares)).await else {
            debug!("prepares not acked in {:?}", request.fan_in_timeout);
            return Err(AbortCause::Timeout);
        };
        match results.into_iter().filter_map(Result::err).reduce(AbortCause::max) {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    /// Commits decided transaction on all member participants, returns whether all participants
    /// acked.
    ///
    /// Leader entry stays committable unless all participants, excluded ones included, acked. It
    /// is retried by later passes and by resync on reintegration, and is never garbage collected
    /// before that.
    pub async fn commit_all(&self, txn_id: TxnId, participants: &ShardBitmap) -> bool {
        let leader = self.id();
        let membership = self.shard.membership();
        let excluded = participants.iter().filter(|shard| !membership.is_up(*shard)).count();
        let commits = participants.iter().filter(|shard| *shard != leader && membership.is_up(*shard)).map(|shard| {
            let request = ShardRequest::Commit { txn_id };
            async move {
                match send_with_resend(self.transport, shard, request, self.config).await {
                    Ok(_) => true,
                    Err(err) => {
                        debug!("shard {} fails to commit txn {}: {}", shard, txn_id, err);
                        false
                    },
                }
            }
        });
        let acked = future::join_all(commits).await.into_iter().all(|acked| acked);
        if !acked {
            return false;
        }
        if excluded != 0 {
            trace!("txn {} waits for {} excluded participants to commit", txn_id, excluded);
            return false;
        }
        match self.shard.commit(txn_id).await {
            Ok(_) => {
                trace!("txn {} committed on all participants", txn_id);
                true
            },
            Err(err) => {
                warn!("leader fails to commit txn {}: {}", txn_id, err);
                false
            },
        }
    }

    /// Decides to commit a transaction all participants prepared.
    pub async fn decide_commit(&self, txn_id: TxnId, participants: &ShardBitmap) -> Result<bool, ShardError> {
        self.shard.mark_committable(txn_id).await?;
        Ok(self.commit_all(txn_id, participants).await)
    }

    /// Aborts transaction on leader first and then on other participants.
    ///
    /// Fails only if leader already decided to commit.
    pub async fn abort_all(
        &self,
        txn_id: TxnId,
        participants: &ShardBitmap,
        cause: AbortCause,
    ) -> Result<(), ShardError> {
        let leader = self.id();
        match self.shard.abort(txn_id, cause).await {
            Ok(_) => {},
            Err(err @ ShardError::Committed { .. }) => return Err(err),
            Err(err) => warn!("leader fails to abort txn {}: {}", txn_id, err),
        }
        let membership = self.shard.membership();
        let aborts = participants.iter().filter(|shard| *shard != leader && membership.is_up(*shard)).map(|shard| {
            let request = ShardRequest::Abort { txn_id, cause };
            async move {
                if let Err(err) = send_with_resend(self.transport, shard, request, self.config).await {
                    debug!("shard {} fails to abort txn {}: {}", shard, txn_id, err);
                }
            }
        });
        future::join_all(aborts).await;
        Ok(())
    }

    /// Aborts transaction on behalf of client whose commit outcome was ambiguous.
    #[instrument(skip_all, fields(txn.id = %txn_id, leader = self.id()))]
    pub async fn cancel(&self, txn_id: TxnId) -> Result<(), ShardError> {
        match self.shard.entry(txn_id) {
            Some(entry) => self.abort_all(txn_id, &entry.participants, AbortCause::Requested).await,
            None => self.shard.abort(txn_id, AbortCause::Requested).await,
        }
    }
}
