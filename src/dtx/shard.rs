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
use std::time::Duration;

use arc_swap::ArcSwap;
use derive_where::derive_where;
use ignore_result::Ignore;
use tracing::{debug, instrument, trace, warn};

use super::conflict::ConflictDetector;
use super::entry::DtxEntry;
use super::table::DtxTable;
use super::types::{AbortCause, PrepareRequest, ShardError};
use crate::clock::Epoch;
use crate::fault::{FaultInjection, Phase};
use crate::ilog::{IncarnationLog, Lookup, Value};
use crate::journal::DtxJournal;
use crate::placement::{Membership, ShardId};
use crate::protos::{DtxRecord, DtxStatus, TxnId};

/// Pending versions a single read settles before giving up.
const MAX_SETTLES: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::NoUninit)]
#[repr(u8)]
pub enum ShardState {
    #[default]
    Up,
    Down,
}

/// Participant side of the protocol on one shard.
///
/// Entries are staged and advanced under the table lock, then persisted after the lock is
/// released. Only prepare fails on persistence failure. Later statuses are rederived by resync
/// should they get lost.
#[derive_where(Debug)]
pub struct Shard {
    id: ShardId,
    #[derive_where(skip(Debug))]
    ilog: Arc<dyn IncarnationLog>,
    journal: Arc<dyn DtxJournal>,
    table: spin::Mutex<DtxTable>,
    state: atomic::Atomic<ShardState>,
    #[derive_where(skip(Debug))]
    membership: Arc<ArcSwap<Membership>>,
    #[derive_where(skip(Debug))]
    faults: Arc<FaultInjection>,
}

impl Shard {
    pub fn new(
        id: ShardId,
        ilog: Arc<dyn IncarnationLog>,
        journal: Arc<dyn DtxJournal>,
        table: DtxTable,
        membership: Arc<ArcSwap<Membership>>,
        faults: Arc<FaultInjection>,
    ) -> Self {
        Self {
            id,
            ilog,
            journal,
            table: spin::Mutex::new(table),
            state: atomic::Atomic::new(ShardState::Up),
            membership,
            faults,
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn ilog(&self) -> &Arc<dyn IncarnationLog> {
        &self.ilog
    }

    pub fn journal(&self) -> &Arc<dyn DtxJournal> {
        &self.journal
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.membership.load_full()
    }

    pub fn state(&self) -> ShardState {
        self.state.load(atomic::Ordering::Relaxed)
    }

    pub fn is_up(&self) -> bool {
        self.state() == ShardState::Up
    }

    pub fn set_state(&self, state: ShardState) {
        debug!("shard {} is now {:?}", self.id, state);
        self.state.store(state, atomic::Ordering::Relaxed);
    }

    pub fn status(&self, txn_id: TxnId) -> Option<DtxStatus> {
        self.table.lock().status(&txn_id)
    }

    pub fn entry(&self, txn_id: TxnId) -> Option<DtxEntry> {
        self.table.lock().get(&txn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Outcome recorded for a transaction, aborted outcome is reported as error.
    pub fn outcome(&self, txn_id: TxnId) -> Result<Option<DtxStatus>, ShardError> {
        let table = self.table.lock();
        let Some(entry) = table.get(&txn_id) else {
            return Ok(None);
        };
        match entry.status {
            DtxStatus::Aborted => {
                Err(ShardError::Aborted { txn_id, cause: entry.abort_cause.unwrap_or(AbortCause::Unknown) })
            },
            status => Ok(Some(status)),
        }
    }

    fn select(&self, filter: impl Fn(&DtxEntry) -> bool) -> Vec<DtxEntry> {
        self.table.lock().iter().filter(|entry| filter(entry)).cloned().collect()
    }

    /// Entries this shard leads which wait for participants to commit.
    pub fn committable(&self) -> Vec<DtxEntry> {
        self.select(|entry| entry.is_led_by(self.id) && entry.status == DtxStatus::Committable)
    }

    /// Entries prepared for longer than given timeout.
    pub fn stale_prepared(&self, timeout: Duration) -> Vec<DtxEntry> {
        self.select(|entry| entry.status == DtxStatus::Prepared && entry.age() >= timeout)
    }

    /// Entries whose outcome is not applied on this shard yet.
    pub fn unresolved(&self) -> Vec<DtxEntry> {
        self.select(|entry| !entry.status.is_terminal())
    }

    fn check_membership(&self, version: u64) -> Result<(), ShardError> {
        ConflictDetector::check_membership(version, self.membership.load().version)
    }

    async fn persist(&self, record: DtxRecord) -> Result<(), ShardError> {
        self.journal.append(&record).await.map_err(|err| ShardError::io(self.id, err.to_string()))
    }

    async fn persist_or_warn(&self, record: DtxRecord) {
        let txn_id = record.id();
        if let Err(err) = self.persist(record).await {
            warn!("shard {} fails to persist entry of txn {}: {}", self.id, txn_id, err);
        }
    }

    /// Validates and stages operations of a transaction on this shard.
    ///
    /// Prepare is idempotent: a resent prepare of a live transaction succeeds without restaging,
    /// while a prepare of an aborted transaction fails.
    #[instrument(skip_all, fields(shard = self.id, txn.id = %request.txn_id))]
    pub async fn prepare(&self, request: &PrepareRequest) -> Result<(), ShardError> {
        let txn_id = request.txn_id;
        if self.faults.io_fault(self.id, Phase::Prepare, txn_id) {
            return Err(ShardError::io(self.id, "injected prepare failure"));
        }
        self.check_membership(request.membership)?;
        let record = {
            let mut table = self.table.lock();
            if let Some(entry) = table.get(&txn_id) {
                return match entry.status {
                    DtxStatus::Aborted => {
                        Err(ShardError::Aborted { txn_id, cause: entry.abort_cause.unwrap_or(AbortCause::Unknown) })
                    },
                    _ if entry.epoch != request.epoch => {
                        Err(ShardError::Conflict { txn_id, key: Vec::new(), epoch: entry.epoch })
                    },
                    _ => Ok(()),
                };
            }
            // Locally decided writes of others are applied first so they are judged as committed.
            for write in request.writes.iter() {
                for version in self.ilog.pending(&write.key) {
                    if version.txn_id != txn_id {
                        self.settle_in(&table, version.txn_id).ignore();
                    }
                }
            }
            ConflictDetector::new(self.ilog.as_ref(), &self.faults).check_writes(
                txn_id,
                request.epoch,
                &request.writes,
            )?;
            if self.faults.records_reads() {
                for key in request.reads.iter() {
                    self.ilog.record_read(key, request.epoch, txn_id);
                }
            }
            if request.writes.is_empty() && !request.tracked {
                trace!("untracked read only prepare");
                return Ok(());
            }
            for write in request.writes.iter() {
                self.ilog.put(&write.key, request.epoch, write.value.clone(), txn_id);
            }
            table.insert(DtxEntry::prepared(request)).to_record()
        };
        self.persist(record).await
    }

    async fn advance(&self, txn_id: TxnId, status: DtxStatus) -> Result<bool, ShardError> {
        let record = {
            let mut table = self.table.lock();
            let Some(entry) = table.get_mut(&txn_id) else {
                return Ok(false);
            };
            if !entry.advance(status)? {
                return Ok(false);
            }
            if status == DtxStatus::Committed {
                self.ilog.commit(txn_id, &entry.keys);
            }
            entry.to_record()
        };
        self.persist_or_warn(record).await;
        Ok(true)
    }

    /// Records leader decision to commit.
    pub async fn mark_committable(&self, txn_id: TxnId) -> Result<(), ShardError> {
        if self.status(txn_id).is_none() {
            return Err(ShardError::Uncertain { txn_id });
        }
        self.advance(txn_id, DtxStatus::Committable).await?;
        Ok(())
    }

    /// Makes staged versions of a transaction visible. Commit of an unknown transaction succeeds
    /// as its entry is either garbage collected after commit or never staged anything here.
    pub async fn commit(&self, txn_id: TxnId) -> Result<(), ShardError> {
        if self.faults.io_fault(self.id, Phase::Commit, txn_id) {
            return Err(ShardError::io(self.id, "injected commit failure"));
        }
        if self.advance(txn_id, DtxStatus::Committed).await? {
            trace!("shard {} committed txn {}", self.id, txn_id);
        }
        Ok(())
    }

    /// Drops staged versions of a transaction, leaving a marker if it never prepared here.
    pub async fn abort(&self, txn_id: TxnId, cause: AbortCause) -> Result<(), ShardError> {
        if self.faults.io_fault(self.id, Phase::Abort, txn_id) {
            return Err(ShardError::io(self.id, "injected abort failure"));
        }
        let record = {
            let mut table = self.table.lock();
            match table.get_mut(&txn_id) {
                Some(entry) => {
                    if !entry.abort(cause)? {
                        return Ok(());
                    }
                    self.ilog.abort(txn_id, &entry.keys);
                    entry.to_record()
                },
                None => table.insert(DtxEntry::aborted(txn_id, self.id, cause)).to_record(),
            }
        };
        trace!("shard {} aborted txn {}: {}", self.id, txn_id, cause);
        self.persist_or_warn(record).await;
        Ok(())
    }

    /// Applies locally known outcome of transaction owning a pending version, or tells reader
    /// whom to ask.
    fn settle(&self, txn_id: TxnId) -> Result<(), ShardError> {
        let table = self.table.lock();
        self.settle_in(&table, txn_id)
    }

    fn settle_in(&self, table: &DtxTable, txn_id: TxnId) -> Result<(), ShardError> {
        match table.get(&txn_id) {
            Some(entry) if entry.status.is_decided() => {
                self.ilog.commit(txn_id, &entry.keys);
                Ok(())
            },
            Some(entry) if entry.status == DtxStatus::Aborted => {
                self.ilog.abort(txn_id, &entry.keys);
                Ok(())
            },
            Some(entry) => Err(ShardError::InProgress { txn_id, leader: entry.leader }),
            None => Err(ShardError::Uncertain { txn_id }),
        }
    }

    fn read(&self, key: &[u8], epoch: Epoch, reader: TxnId) -> Result<Option<Value>, ShardError> {
        for _ in 0..MAX_SETTLES {
            match self.ilog.get(key, epoch) {
                Lookup::Missing => return Ok(None),
                Lookup::Visible { value, .. } => return Ok(value),
                Lookup::Pending { txn_id, value, .. } if txn_id == reader => return Ok(value),
                Lookup::Pending { txn_id, .. } => self.settle(txn_id)?,
            }
        }
        Err(ShardError::Uncertain { txn_id: reader })
    }

    /// Reads key at given epoch.
    pub fn fetch(
        &self,
        key: &[u8],
        epoch: Epoch,
        reader: TxnId,
        membership: u64,
        record_read: bool,
    ) -> Result<Option<Value>, ShardError> {
        if self.faults.io_fault(self.id, Phase::Fetch, reader) {
            return Err(ShardError::io(self.id, "injected fetch failure"));
        }
        self.check_membership(membership)?;
        let value = self.read(key, epoch, reader)?;
        if record_read && self.faults.records_reads() {
            self.ilog.record_read(key, epoch, reader);
        }
        Ok(value)
    }

    /// Lists keys with visible values at given epoch.
    pub fn enumerate(&self, epoch: Epoch, reader: TxnId, membership: u64) -> Result<Vec<Vec<u8>>, ShardError> {
        if self.faults.io_fault(self.id, Phase::Fetch, reader) {
            return Err(ShardError::io(self.id, "injected enumerate failure"));
        }
        self.check_membership(membership)?;
        let mut keys = Vec::new();
        for (key, lookup) in self.ilog.scan(epoch) {
            let value = match lookup {
                Lookup::Missing => continue,
                Lookup::Visible { value, .. } => value,
                Lookup::Pending { txn_id, value, .. } if txn_id == reader => value,
                Lookup::Pending { .. } => self.read(&key, epoch, reader)?,
            };
            if value.is_some() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Forgets entries resolved for longer than given retention.
    pub async fn collect_garbage(&self, retention: Duration) -> usize {
        let expired = {
            let mut table = self.table.lock();
            let expired = table.expired(retention);
            for txn_id in expired.iter() {
                table.remove(txn_id);
            }
            expired
        };
        for txn_id in expired.iter() {
            self.persist_or_warn(DtxRecord::tombstone(*txn_id)).await;
        }
        if !expired.is_empty() {
            debug!("shard {} forgot {} resolved entries", self.id, expired.len());
        }
        expired.len()
    }
}

#[cfg(test)]
pub mod tests {
    use assertor::*;

    use super::*;
    use crate::dtx::types::Write;
    use crate::ilog::MemoryIncarnationLog;
    use crate::journal::MemoryJournal;

    pub fn txn(sequence: u64) -> TxnId {
        TxnId::new(uuid::Uuid::nil(), sequence)
    }

    struct Fixture {
        shard: Shard,
        journal: MemoryJournal,
        faults: Arc<FaultInjection>,
        membership: Arc<ArcSwap<Membership>>,
    }

    fn fixture() -> Fixture {
        let journal = MemoryJournal::new();
        let faults = Arc::new(FaultInjection::new());
        let membership = Arc::new(ArcSwap::from_pointee(Membership::default()));
        let shard = Shard::new(
            1,
            Arc::new(MemoryIncarnationLog::new()),
            Arc::new(journal.clone()),
            DtxTable::new(),
            membership.clone(),
            faults.clone(),
        );
        Fixture { shard, journal, faults, membership }
    }

    fn prepare_request(txn_id: TxnId, epoch: u64, key: &[u8], value: &'static [u8]) -> PrepareRequest {
        PrepareRequest {
            txn_id,
            epoch: Epoch::new(epoch),
            leader: 0,
            participants: [0, 1].into_iter().collect(),
            membership: 0,
            reads: vec![],
            writes: vec![Write { key: key.to_vec(), value: Some(Value::from_static(value)) }],
            tracked: true,
            read_only: false,
        }
    }

    fn fetch(shard: &Shard, key: &[u8], epoch: u64) -> Result<Option<Value>, ShardError> {
        shard.fetch(key, Epoch::new(epoch), TxnId::NIL, 0, false)
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_then_commit() {
        let Fixture { shard, journal, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        assert_that!(shard.status(txn(1))).is_equal_to(Some(DtxStatus::Prepared));
        assert_that!(journal.len()).is_equal_to(1);

        // then: prepared versions are invisible and point to leader
        assert_that!(fetch(&shard, b"k1", 20).unwrap_err())
            .is_equal_to(ShardError::InProgress { txn_id: txn(1), leader: 0 });
        assert_that!(shard.fetch(b"k1", Epoch::new(20), txn(1), 0, false).unwrap())
            .is_equal_to(Some(Value::from_static(b"v1")));

        shard.commit(txn(1)).await.unwrap();
        assert_that!(shard.status(txn(1))).is_equal_to(Some(DtxStatus::Committed));
        assert_that!(fetch(&shard, b"k1", 20).unwrap()).is_equal_to(Some(Value::from_static(b"v1")));
        assert_that!(fetch(&shard, b"k1", 9).unwrap()).is_equal_to(None);

        // then: resent commit is no-op
        shard.commit(txn(1)).await.unwrap();
        assert_that!(journal.len()).is_equal_to(2);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_idempotent() {
        let Fixture { shard, journal, .. } = fixture();
        let request = prepare_request(txn(1), 10, b"k1", b"v1");
        shard.prepare(&request).await.unwrap();
        shard.prepare(&request).await.unwrap();
        assert_that!(journal.len()).is_equal_to(1);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_after_abort() {
        let Fixture { shard, .. } = fixture();
        shard.abort(txn(1), AbortCause::Requested).await.unwrap();
        let err = shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap_err();
        assert_that!(err).is_equal_to(ShardError::Aborted { txn_id: txn(1), cause: AbortCause::Requested });
        assert_that!(fetch(&shard, b"k1", 20).unwrap()).is_equal_to(None);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_conflicts() {
        let Fixture { shard, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        let err = shard.prepare(&prepare_request(txn(2), 20, b"k1", b"v2")).await.unwrap_err();
        assert_that!(err)
            .is_equal_to(ShardError::Conflict { txn_id: txn(2), key: b"k1".to_vec(), epoch: Epoch::new(20) });
        assert_that!(shard.status(txn(2))).is_equal_to(None);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_records_reads() {
        let Fixture { shard, .. } = fixture();
        let mut request = prepare_request(txn(1), 50, b"k1", b"v1");
        request.reads = vec![b"k2".to_vec()];
        shard.prepare(&request).await.unwrap();

        let err = shard.prepare(&prepare_request(txn(2), 40, b"k2", b"v2")).await.unwrap_err();
        assert_that!(err)
            .is_equal_to(ShardError::Conflict { txn_id: txn(2), key: b"k2".to_vec(), epoch: Epoch::new(50) });
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_stale_membership() {
        let Fixture { shard, membership, .. } = fixture();
        membership.store(Arc::new(membership.load().exclude(3)));
        let err = shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap_err();
        assert_that!(err).is_equal_to(ShardError::StaleMembership { version: 0, current: 1 });
        assert_that!(fetch(&shard, b"k1", 20).unwrap_err())
            .is_equal_to(ShardError::StaleMembership { version: 0, current: 1 });
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn prepare_io_fault() {
        let Fixture { shard, journal, faults, .. } = fixture();
        faults.inject_io(1, Phase::Prepare, Some(txn(1)));
        let err = shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap_err();
        assert_that!(err).is_equal_to(ShardError::io(1, "injected prepare failure"));
        assert_that!(shard.is_empty()).is_true();

        // given: journal unavailable
        journal.set_unavailable(true);
        let err = shard.prepare(&prepare_request(txn(2), 10, b"k2", b"v2")).await.unwrap_err();
        assert_that!(matches!(err, ShardError::Io { shard: 1, .. })).is_true();
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn abort_drops_staged() {
        let Fixture { shard, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        shard.abort(txn(1), AbortCause::Io).await.unwrap();
        assert_that!(fetch(&shard, b"k1", 20).unwrap()).is_equal_to(None);
        assert_that!(shard.outcome(txn(1)).unwrap_err())
            .is_equal_to(ShardError::Aborted { txn_id: txn(1), cause: AbortCause::Io });

        // then: aborted never commits
        let err = shard.commit(txn(1)).await.unwrap_err();
        assert_that!(err).is_equal_to(ShardError::Aborted { txn_id: txn(1), cause: AbortCause::Io });
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn committable_settled_by_reader() {
        let Fixture { shard, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        shard.mark_committable(txn(1)).await.unwrap();

        // then: reader applies decided outcome without waiting for commit
        assert_that!(fetch(&shard, b"k1", 20).unwrap()).is_equal_to(Some(Value::from_static(b"v1")));
        assert_that!(shard.status(txn(1))).is_equal_to(Some(DtxStatus::Committable));
        assert_that!(shard.committable().len()).is_equal_to(0);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn untracked_read_only_prepare() {
        let Fixture { shard, journal, .. } = fixture();
        let mut request = prepare_request(txn(1), 10, b"k1", b"v1");
        request.writes.clear();
        request.reads = vec![b"k1".to_vec()];
        request.tracked = false;
        request.read_only = true;
        shard.prepare(&request).await.unwrap();
        assert_that!(shard.status(txn(1))).is_equal_to(None);
        assert_that!(journal.is_empty()).is_true();
        assert_that!(shard.ilog().read_timestamp(b"k1").epoch).is_equal_to(Epoch::new(10));
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn enumerate_visible_keys() {
        let Fixture { shard, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        shard.commit(txn(1)).await.unwrap();
        shard.prepare(&prepare_request(txn(2), 11, b"k2", b"v2")).await.unwrap();
        shard.abort(txn(2), AbortCause::Requested).await.unwrap();
        let mut punch = prepare_request(txn(3), 12, b"k3", b"v3");
        punch.writes[0].value = None;
        shard.prepare(&punch).await.unwrap();
        shard.commit(txn(3)).await.unwrap();

        assert_that!(shard.enumerate(Epoch::new(20), TxnId::NIL, 0).unwrap()).is_equal_to(vec![b"k1".to_vec()]);
        assert_that!(shard.enumerate(Epoch::new(5), TxnId::NIL, 0).unwrap()).is_empty();
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn garbage_collection() {
        let Fixture { shard, journal, .. } = fixture();
        shard.prepare(&prepare_request(txn(1), 10, b"k1", b"v1")).await.unwrap();
        shard.prepare(&prepare_request(txn(2), 10, b"k2", b"v2")).await.unwrap();
        shard.commit(txn(1)).await.unwrap();

        assert_that!(shard.collect_garbage(Duration::ZERO).await).is_equal_to(1);
        assert_that!(shard.status(txn(1))).is_equal_to(None);
        assert_that!(shard.status(txn(2))).is_equal_to(Some(DtxStatus::Prepared));

        // then: forgotten entry stays forgotten after replay
        let records = journal.replay().await.unwrap();
        assert_that!(records.iter().map(|record| record.id()).collect::<Vec<_>>()).is_equal_to(vec![txn(2)]);
        assert_that!(fetch(&shard, b"k1", 20).unwrap()).is_equal_to(Some(Value::from_static(b"v1")));
    }
}
