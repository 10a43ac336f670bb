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

//! Fault injection switches consulted by shards, leaders and transport.
//!
//! Every container carries its own [FaultInjection], so concurrently running containers never
//! observe each other's faults.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::placement::ShardId;
use crate::protos::TxnId;

/// Sub-operation a fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Commit,
    Abort,
    Fetch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IoFault {
    shard: ShardId,
    phase: Phase,
    txn_id: Option<TxnId>,
}

#[derive(Clone, Debug, Default)]
struct FaultPlan {
    force_restart: bool,
    io_faults: Vec<IoFault>,
    no_read_timestamps: bool,
    sync_only: bool,
    keep_prepared: bool,
    prepare_delays: Vec<(ShardId, Duration)>,
}

#[derive(Debug, Default)]
pub struct FaultInjection {
    plan: ArcSwap<FaultPlan>,
    lost_requests: AtomicUsize,
    lost_replies: AtomicUsize,
}

impl FaultInjection {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, f: impl Fn(&mut FaultPlan)) {
        self.plan.rcu(|plan| {
            let mut plan = FaultPlan::clone(plan);
            f(&mut plan);
            plan
        });
    }

    /// Resets all switches.
    pub fn clear(&self) {
        self.plan.store(Default::default());
        self.lost_requests.store(0, Ordering::Relaxed);
        self.lost_replies.store(0, Ordering::Relaxed);
    }

    /// Fails every prepare with conflict.
    pub fn set_force_restart(&self, on: bool) {
        self.modify(|plan| plan.force_restart = on);
    }

    /// Fails given phase on given shard with io error, for one transaction or all if none.
    pub fn inject_io(&self, shard: ShardId, phase: Phase, txn_id: Option<TxnId>) {
        self.modify(|plan| plan.io_faults.push(IoFault { shard, phase, txn_id }));
    }

    pub fn clear_io(&self) {
        self.modify(|plan| plan.io_faults.clear());
    }

    /// Drops next `n` commit requests before they reach leader.
    pub fn lose_commit_requests(&self, n: usize) {
        self.lost_requests.store(n, Ordering::Relaxed);
    }

    /// Drops replies of next `n` commit requests after leader handled them.
    pub fn lose_commit_replies(&self, n: usize) {
        self.lost_replies.store(n, Ordering::Relaxed);
    }

    pub fn set_no_read_timestamps(&self, on: bool) {
        self.modify(|plan| plan.no_read_timestamps = on);
    }

    /// Commits synchronously regardless of configured policy.
    pub fn set_sync_only(&self, on: bool) {
        self.modify(|plan| plan.sync_only = on);
    }

    /// Leaves participant entries prepared after leader decides to commit.
    pub fn set_keep_prepared(&self, on: bool) {
        self.modify(|plan| plan.keep_prepared = on);
    }

    /// Holds prepares sent to given shard for given duration before delivering them.
    pub fn delay_prepares(&self, shard: ShardId, delay: Duration) {
        self.modify(|plan| plan.prepare_delays.push((shard, delay)));
    }

    pub fn should_restart(&self) -> bool {
        self.plan.load().force_restart
    }

    pub fn io_fault(&self, shard: ShardId, phase: Phase, txn_id: TxnId) -> bool {
        self.plan.load().io_faults.iter().any(|fault| {
            fault.shard == shard && fault.phase == phase && fault.txn_id.map(|id| id == txn_id).unwrap_or(true)
        })
    }

    pub fn records_reads(&self) -> bool {
        !self.plan.load().no_read_timestamps
    }

    pub fn sync_only(&self) -> bool {
        self.plan.load().sync_only
    }

    pub fn keeps_prepared(&self) -> bool {
        self.plan.load().keep_prepared
    }

    pub fn prepare_delay(&self, shard: ShardId) -> Option<Duration> {
        self.plan.load().prepare_delays.iter().find(|(id, _)| *id == shard).map(|(_, delay)| *delay)
    }

    pub(crate) fn take_lost_request(&self) -> bool {
        Self::take(&self.lost_requests)
    }

    pub(crate) fn take_lost_reply(&self) -> bool {
        Self::take(&self.lost_replies)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn io_faults() {
        let faults = FaultInjection::new();
        let txn1 = TxnId::new(uuid::Uuid::new_v4(), 1);
        let txn2 = TxnId::new(uuid::Uuid::new_v4(), 2);

        faults.inject_io(1, Phase::Prepare, Some(txn1));
        assert_that!(faults.io_fault(1, Phase::Prepare, txn1)).is_equal_to(true);
        assert_that!(faults.io_fault(1, Phase::Prepare, txn2)).is_equal_to(false);
        assert_that!(faults.io_fault(1, Phase::Commit, txn1)).is_equal_to(false);
        assert_that!(faults.io_fault(0, Phase::Prepare, txn1)).is_equal_to(false);

        faults.inject_io(2, Phase::Commit, None);
        assert_that!(faults.io_fault(2, Phase::Commit, txn2)).is_equal_to(true);

        faults.clear_io();
        assert_that!(faults.io_fault(1, Phase::Prepare, txn1)).is_equal_to(false);
    }

    #[test]
    fn lost_messages() {
        let faults = FaultInjection::new();
        assert_that!(faults.take_lost_request()).is_equal_to(false);
        faults.lose_commit_requests(2);
        assert_that!(faults.take_lost_request()).is_equal_to(true);
        assert_that!(faults.take_lost_request()).is_equal_to(true);
        assert_that!(faults.take_lost_request()).is_equal_to(false);

        faults.lose_commit_replies(1);
        assert_that!(faults.take_lost_reply()).is_equal_to(true);
        assert_that!(faults.take_lost_reply()).is_equal_to(false);
    }

    #[test]
    fn switches() {
        let faults = FaultInjection::new();
        assert_that!(faults.records_reads()).is_equal_to(true);
        faults.set_force_restart(true);
        faults.set_no_read_timestamps(true);
        faults.set_sync_only(true);
        faults.set_keep_prepared(true);
        assert_that!(faults.should_restart()).is_equal_to(true);
        assert_that!(faults.records_reads()).is_equal_to(false);
        assert_that!(faults.sync_only()).is_equal_to(true);
        assert_that!(faults.keeps_prepared()).is_equal_to(true);

        faults.clear();
        assert_that!(faults.should_restart()).is_equal_to(false);
        assert_that!(faults.keeps_prepared()).is_equal_to(false);
    }

    #[test]
    fn prepare_delays() {
        let faults = FaultInjection::new();
        faults.delay_prepares(2, Duration::from_secs(1));
        assert_that!(faults.prepare_delay(2)).is_equal_to(Some(Duration::from_secs(1)));
        assert_that!(faults.prepare_delay(1)).is_equal_to(None);

        faults.clear();
        assert_that!(faults.prepare_delay(2)).is_equal_to(None);
    }
}
