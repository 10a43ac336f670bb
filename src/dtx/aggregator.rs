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

use std::ops::AddAssign;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace};

use super::leader::Leader;
use super::resolver::UncertaintyResolver;
use super::shard::Shard;
use super::types::AbortCause;
use crate::config::DtxConfig;
use crate::fault::FaultInjection;
use crate::transport::Transport;

/// Aborts its task on drop.
#[derive(Debug)]
pub struct TaskHandle {
    task: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.task.abort()
    }
}

/// Work done by one aggregation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub committed: usize,
    pub aborted: usize,
    pub resolved: usize,
    pub forgotten: usize,
}

impl AddAssign for Aggregation {
    fn add_assign(&mut self, other: Aggregation) {
        self.committed += other.committed;
        self.aborted += other.aborted;
        self.resolved += other.resolved;
        self.forgotten += other.forgotten;
    }
}

/// Background pass of one shard which commits committable entries in batches, aborts entries
/// left prepared for too long and forgets resolved entries.
pub struct Aggregator {
    shard: Arc<Shard>,
    transport: Arc<dyn Transport>,
    config: DtxConfig,
    faults: Arc<FaultInjection>,
}

impl Aggregator {
    pub fn new(
        shard: Arc<Shard>,
        transport: Arc<dyn Transport>,
        config: DtxConfig,
        faults: Arc<FaultInjection>,
    ) -> Self {
        Self { shard, transport, config, faults }
    }

    pub fn start(self) -> TaskHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.aggregation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        });
        TaskHandle::new(task)
    }

    fn leader(&self) -> Leader<'_> {
        Leader::new(&self.shard, self.transport.as_ref(), &self.config, &self.faults)
    }

    #[instrument(skip_all, fields(shard = self.shard.id()))]
    pub async fn run_once(&self) -> Aggregation {
        let mut aggregation = Aggregation::default();
        if !self.shard.is_up() {
            return aggregation;
        }
        if !self.faults.keeps_prepared() {
            aggregation.committed = self.commit_batch().await;
            aggregation.resolved = self.resolve_stale_participants().await;
        }
        aggregation.aborted = self.abort_stale().await;
        aggregation.forgotten = self.shard.collect_garbage(self.config.retention).await;
        if aggregation != Aggregation::default() {
            debug!("aggregation: {:?}", aggregation);
        }
        aggregation
    }

    async fn commit_batch(&self) -> usize {
        let committable = self.shard.committable();
        let all = committable.len() > self.config.commit_count_threshold;
        let leader = self.leader();
        let mut committed = 0;
        for entry in committable.into_iter() {
            if !all && entry.age() < self.config.commit_age_threshold {
                continue;
            }
            if leader.commit_all(entry.txn_id, &entry.participants).await {
                committed += 1;
            }
        }
        committed
    }

    async fn abort_stale(&self) -> usize {
        let leader = self.leader();
        let mut aborted = 0;
        for entry in self.shard.stale_prepared(self.config.prepare_timeout) {
            if !entry.is_led_by(self.shard.id()) {
                continue;
            }
            trace!("abort txn {} prepared for {:?}", entry.txn_id, entry.age());
            if leader.abort_all(entry.txn_id, &entry.participants, AbortCause::Timeout).await.is_ok() {
                aborted += 1;
            }
        }
        aborted
    }

    async fn resolve_stale_participants(&self) -> usize {
        let resolver = UncertaintyResolver::new(self.transport.as_ref(), &self.config);
        let mut resolved = 0;
        for entry in self.shard.stale_prepared(self.config.prepare_timeout) {
            if entry.is_led_by(self.shard.id()) {
                continue;
            }
            if resolver.resolve_stale(entry.txn_id, entry.leader, self.shard.id()).await.is_ok() {
                resolved += 1;
            }
        }
        resolved
    }
}
