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

use tracing::{debug, info, instrument, warn};

use super::entry::DtxEntry;
use super::leader::Leader;
use super::resolver::UncertaintyResolver;
use super::shard::Shard;
use super::types::{AbortCause, ShardError, ShardRequest, ShardResponse};
use crate::config::DtxConfig;
use crate::fault::FaultInjection;
use crate::placement::{Membership, ShardId};
use crate::protos::{DtxStatus, TxnId};
use crate::transport::{send_with_resend, Transport};

/// Outcomes resync settled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub committed: Vec<TxnId>,
    pub aborted: Vec<TxnId>,
    /// Transactions decided to commit but not yet acked by all participants.
    pub pending: Vec<TxnId>,
    /// Transactions whose outcome can not be determined from reachable participants.
    pub lost: Vec<TxnId>,
}

impl ResyncReport {
    pub fn merge(&mut self, other: ResyncReport) {
        self.committed.extend(other.committed);
        self.aborted.extend(other.aborted);
        self.pending.extend(other.pending);
        self.lost.extend(other.lost);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Commit,
    Abort,
    Lost,
}

/// Reconciles unresolved entries this shard leads after leadership change or reopen.
///
/// Participants excluded from membership are skipped, they resync on reintegration.
pub struct ResyncEngine<'a> {
    shard: &'a Arc<Shard>,
    transport: &'a dyn Transport,
    config: &'a DtxConfig,
    faults: &'a FaultInjection,
}

impl<'a> ResyncEngine<'a> {
    pub fn new(
        shard: &'a Arc<Shard>,
        transport: &'a dyn Transport,
        config: &'a DtxConfig,
        faults: &'a FaultInjection,
    ) -> Self {
        Self { shard, transport, config, faults }
    }

    #[instrument(skip_all, fields(shard = self.shard.id()))]
    pub async fn run(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        let membership = self.shard.membership();
        let leader = Leader::new(self.shard, self.transport, self.config, self.faults);
        for entry in self.shard.unresolved() {
            if membership.leader_of(&entry.participants) != Some(self.shard.id()) {
                continue;
            }
            let txn_id = entry.txn_id;
            match self.verdict(&entry, &membership).await {
                Verdict::Commit => match leader.decide_commit(txn_id, &entry.participants).await {
                    Ok(true) => report.committed.push(txn_id),
                    Ok(false) => report.pending.push(txn_id),
                    Err(err) => warn!("resync fails to commit txn {}: {}", txn_id, err),
                },
                Verdict::Abort => match leader.abort_all(txn_id, &entry.participants, AbortCause::Resync).await {
                    Ok(_) => report.aborted.push(txn_id),
                    Err(err) => warn!("resync fails to abort txn {}: {}", txn_id, err),
                },
                Verdict::Lost => report.lost.push(txn_id),
            }
        }
        if report != ResyncReport::default() {
            info!(
                "resync committed {} aborted {} pending {} lost {}",
                report.committed.len(),
                report.aborted.len(),
                report.pending.len(),
                report.lost.len()
            );
        }
        report
    }

    /// Applies outcomes decided by other leaders while this shard was excluded.
    ///
    /// Entries whose leader knows no outcome are left to timeout driven resolution.
    #[instrument(skip_all, fields(shard = self.shard.id()))]
    pub async fn catch_up(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        let membership = self.shard.membership();
        let resolver = UncertaintyResolver::new(self.transport, self.config);
        let id = self.shard.id();
        for entry in self.shard.unresolved() {
            let Some(leader) = membership.leader_of(&entry.participants) else {
                continue;
            };
            if leader == id {
                continue;
            }
            let txn_id = entry.txn_id;
            if let Err(err) = resolver.resolve(txn_id, leader, id).await {
                debug!("shard {} can not catch up txn {} from leader {}: {}", id, txn_id, leader, err);
                continue;
            }
            match self.shard.status(txn_id) {
                Some(DtxStatus::Committed) => report.committed.push(txn_id),
                Some(DtxStatus::Aborted) => report.aborted.push(txn_id),
                _ => {},
            }
        }
        report
    }

    async fn status(&self, txn_id: TxnId, shard: ShardId) -> Result<Option<DtxStatus>, ShardError> {
        match send_with_resend(self.transport, shard, ShardRequest::Status { txn_id }, self.config).await? {
            ShardResponse::Status(status) => Ok(status),
            _ => Err(ShardError::UnexpectedResponse { request: "status" }),
        }
    }

    /// Decided anywhere commits. Missing or aborted anywhere aborts. Prepared everywhere reachable
    /// commits.
    async fn verdict(&self, entry: &DtxEntry, membership: &Membership) -> Verdict {
        let txn_id = entry.txn_id;
        let mut aborted = entry.status == DtxStatus::Aborted;
        let mut unreachable = false;
        if entry.status.is_decided() {
            return Verdict::Commit;
        }
        for shard in entry.participants.iter() {
            if shard == self.shard.id() || !membership.is_up(shard) {
                continue;
            }
            match self.status(txn_id, shard).await {
                Ok(Some(status)) if status.is_decided() => return Verdict::Commit,
                Ok(Some(DtxStatus::Aborted)) | Ok(None) => aborted = true,
                Ok(Some(_)) => {},
                Err(err) => {
                    debug!("resync can not reach shard {} for txn {}: {}", shard, txn_id, err);
                    unreachable = true;
                },
            }
        }
        match (aborted, unreachable) {
            (true, _) => Verdict::Abort,
            (false, true) => Verdict::Lost,
            (false, false) => Verdict::Commit,
        }
    }
}
