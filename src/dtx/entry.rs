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

use std::time::{Duration, Instant, SystemTime};

use super::types::{AbortCause, PrepareRequest, ShardError};
use crate::clock::Epoch;
use crate::placement::{ShardBitmap, ShardId};
use crate::protos::{DtxRecord, DtxStatus, TxnId};

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Record of one transaction on one shard.
#[derive(Clone, Debug)]
pub struct DtxEntry {
    pub txn_id: TxnId,
    pub epoch: Epoch,
    pub participants: ShardBitmap,
    pub status: DtxStatus,
    pub leader: ShardId,
    pub read_only: bool,
    /// Keys staged on this shard.
    pub keys: Vec<Vec<u8>>,
    pub created_ms: u64,
    created: Instant,
    resolved: Option<Instant>,
    pub abort_cause: Option<AbortCause>,
}

impl DtxEntry {
    pub fn prepared(request: &PrepareRequest) -> Self {
        Self {
            txn_id: request.txn_id,
            epoch: request.epoch,
            participants: request.participants.clone(),
            status: DtxStatus::Prepared,
            leader: request.leader,
            read_only: request.read_only,
            keys: request.writes.iter().map(|write| write.key.clone()).collect(),
            created_ms: unix_millis(),
            created: Instant::now(),
            resolved: None,
            abort_cause: None,
        }
    }

    /// Marker of a transaction aborted before it prepared here, so late prepares get rejected.
    pub fn aborted(txn_id: TxnId, leader: ShardId, cause: AbortCause) -> Self {
        let now = Instant::now();
        Self {
            txn_id,
            epoch: Epoch::ZERO,
            participants: ShardBitmap::new(),
            status: DtxStatus::Aborted,
            leader,
            read_only: false,
            keys: Vec::new(),
            created_ms: unix_millis(),
            created: now,
            resolved: Some(now),
            abort_cause: Some(cause),
        }
    }

    pub fn from_record(record: DtxRecord) -> Self {
        let status = record.status();
        let now = Instant::now();
        Self {
            txn_id: record.id(),
            epoch: Epoch::new(record.epoch),
            participants: ShardBitmap::from_words(record.participants),
            status,
            leader: record.leader,
            read_only: record.read_only,
            keys: record.keys,
            created_ms: record.created_ms,
            created: now,
            resolved: status.is_terminal().then_some(now),
            abort_cause: (status == DtxStatus::Aborted).then_some(AbortCause::Unknown),
        }
    }

    pub fn to_record(&self) -> DtxRecord {
        let mut record = DtxRecord {
            txn_id: Some(self.txn_id),
            epoch: self.epoch.get(),
            participants: self.participants.words().to_vec(),
            leader: self.leader,
            created_ms: self.created_ms,
            read_only: self.read_only,
            keys: self.keys.clone(),
            ..Default::default()
        };
        record.set_status(self.status);
        record
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time since entry became committed or aborted.
    pub fn resolved_for(&self) -> Option<Duration> {
        self.resolved.map(|resolved| resolved.elapsed())
    }

    /// Advances status monotonically.
    ///
    /// Returns whether status changed. Requests to move backward are ignored, while requests to
    /// flip an outcome fail.
    pub fn advance(&mut self, status: DtxStatus) -> Result<bool, ShardError> {
        if self.status == status {
            return Ok(false);
        }
        if self.status.can_advance_to(status) {
            self.status = status;
            if status.is_terminal() {
                self.resolved = Some(Instant::now());
            }
            return Ok(true);
        }
        match (self.status, status) {
            (DtxStatus::Aborted, _) => Err(ShardError::Aborted {
                txn_id: self.txn_id,
                cause: self.abort_cause.unwrap_or(AbortCause::Unknown),
            }),
            (_, DtxStatus::Aborted) => Err(ShardError::Committed { txn_id: self.txn_id }),
            _ => Ok(false),
        }
    }

    pub fn abort(&mut self, cause: AbortCause) -> Result<bool, ShardError> {
        let changed = self.advance(DtxStatus::Aborted)?;
        if changed {
            self.abort_cause = Some(cause);
        }
        Ok(changed)
    }

    pub fn is_led_by(&self, shard: ShardId) -> bool {
        self.leader == shard
    }
}
