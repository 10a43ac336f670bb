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

use tracing::trace;

use super::types::{ShardError, Write};
use crate::clock::Epoch;
use crate::fault::FaultInjection;
use crate::ilog::IncarnationLog;
use crate::protos::TxnId;

/// Validates writes of a preparing transaction against reads and versions of other transactions.
///
/// A write at epoch `E` conflicts if:
/// * another transaction read the key at `E` or above, as the write would change what it read;
/// * a committed version of the key exists above `E`, or at `E` from another transaction;
/// * another unresolved transaction staged a version of the key.
pub struct ConflictDetector<'a> {
    ilog: &'a dyn IncarnationLog,
    faults: &'a FaultInjection,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(ilog: &'a dyn IncarnationLog, faults: &'a FaultInjection) -> Self {
        Self { ilog, faults }
    }

    pub fn check_membership(version: u64, current: u64) -> Result<(), ShardError> {
        if version < current {
            return Err(ShardError::StaleMembership { version, current });
        }
        Ok(())
    }

    pub fn check_writes(&self, txn_id: TxnId, epoch: Epoch, writes: &[Write]) -> Result<(), ShardError> {
        if self.faults.should_restart() {
            let key = writes.first().map(|write| write.key.clone()).unwrap_or_default();
            return Err(ShardError::Conflict { txn_id, key, epoch });
        }
        writes.iter().try_for_each(|write| self.check_write(txn_id, epoch, &write.key))
    }

    fn check_write(&self, txn_id: TxnId, epoch: Epoch, key: &[u8]) -> Result<(), ShardError> {
        let conflict = |conflicting: Epoch| {
            trace!("txn {} write@{} to key {:?} conflicts with epoch {}", txn_id, epoch, key, conflicting);
            Err(ShardError::Conflict { txn_id, key: key.to_owned(), epoch: conflicting })
        };
        let read = self.ilog.read_timestamp(key);
        if read.fences(txn_id, epoch) && !read.epoch.is_zero() {
            return conflict(read.epoch);
        }
        if let Some(version) = self.ilog.highest(key) {
            if version.epoch > epoch || (version.epoch == epoch && version.txn_id != txn_id) {
                return conflict(version.epoch);
            }
        }
        if let Some(version) = self.ilog.pending(key).into_iter().find(|version| version.txn_id != txn_id) {
            return conflict(version.epoch.max(epoch));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::ilog::{MemoryIncarnationLog, Value};

    fn txn(sequence: u64) -> TxnId {
        TxnId::new(uuid::Uuid::nil(), sequence)
    }

    fn write(key: &[u8]) -> Vec<Write> {
        vec![Write { key: key.to_vec(), value: Some(Value::from_static(b"v")) }]
    }

    fn conflict_epoch(result: Result<(), ShardError>) -> Option<Epoch> {
        match result {
            Err(ShardError::Conflict { epoch, .. }) => Some(epoch),
            _ => None,
        }
    }

    #[test]
    fn write_beneath_read() {
        let ilog = MemoryIncarnationLog::new();
        let faults = FaultInjection::new();
        let detector = ConflictDetector::new(&ilog, &faults);

        // given: txn1 reads k1 at 50
        ilog.record_read(b"k1", Epoch::new(50), txn(1));

        // then: writes at or beneath 50 from others conflict
        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(40), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(50)));
        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(50), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(50)));
        assert_that!(detector.check_writes(txn(2), Epoch::new(51), &write(b"k1")).is_ok()).is_true();
        assert_that!(detector.check_writes(txn(2), Epoch::new(40), &write(b"k2")).is_ok()).is_true();

        // then: txn1 writes what it read
        assert_that!(detector.check_writes(txn(1), Epoch::new(50), &write(b"k1")).is_ok()).is_true();
    }

    #[test]
    fn write_beneath_committed_write() {
        let ilog = MemoryIncarnationLog::new();
        let faults = FaultInjection::new();
        let detector = ConflictDetector::new(&ilog, &faults);

        // given: txn1 committed k1 at 50
        ilog.put(b"k1", Epoch::new(50), Some(Value::from_static(b"v1")), txn(1));
        ilog.commit(txn(1), &[b"k1".to_vec()]);

        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(40), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(50)));
        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(50), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(50)));
        assert_that!(detector.check_writes(txn(2), Epoch::new(60), &write(b"k1")).is_ok()).is_true();
    }

    #[test]
    fn write_over_unresolved_write() {
        let ilog = MemoryIncarnationLog::new();
        let faults = FaultInjection::new();
        let detector = ConflictDetector::new(&ilog, &faults);

        // given: txn1 staged k1 at 50
        ilog.put(b"k1", Epoch::new(50), Some(Value::from_static(b"v1")), txn(1));

        // then: others conflict regardless of epoch
        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(60), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(60)));
        assert_that!(conflict_epoch(detector.check_writes(txn(2), Epoch::new(40), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(50)));
        // then: txn1 itself passes
        assert_that!(detector.check_writes(txn(1), Epoch::new(50), &write(b"k1")).is_ok()).is_true();

        // given: txn1 aborted
        ilog.abort(txn(1), &[b"k1".to_vec()]);
        assert_that!(detector.check_writes(txn(2), Epoch::new(40), &write(b"k1")).is_ok()).is_true();
    }

    #[test]
    fn forced_restart() {
        let ilog = MemoryIncarnationLog::new();
        let faults = FaultInjection::new();
        faults.set_force_restart(true);
        let detector = ConflictDetector::new(&ilog, &faults);
        assert_that!(conflict_epoch(detector.check_writes(txn(1), Epoch::new(10), &write(b"k1"))))
            .is_equal_to(Some(Epoch::new(10)));
    }

    #[test]
    fn stale_membership() {
        assert_that!(ConflictDetector::check_membership(3, 3).is_ok()).is_true();
        assert_that!(ConflictDetector::check_membership(4, 3).is_ok()).is_true();
        assert_that!(ConflictDetector::check_membership(2, 3).unwrap_err())
            .is_equal_to(ShardError::StaleMembership { version: 2, current: 3 });
    }
}
