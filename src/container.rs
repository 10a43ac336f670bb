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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arc_swap::ArcSwap;
use derive_where::derive_where;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DtxConfig;
use crate::dtx::{Aggregation, Aggregator, DtxTable, ResyncEngine, ResyncReport, Shard, ShardState, TaskHandle};
use crate::fault::FaultInjection;
use crate::ilog::{IncarnationLog, MemoryIncarnationLog, Value};
use crate::journal::{DtxJournal, MemoryJournal};
use crate::placement::{Membership, Placement, ShardId};
use crate::protos::TxnId;
use crate::transport::{LocalTransport, Transport};
use crate::txn::{Result, Txn, TxnError, TxnFlags};

/// Durable state of one shard which survives container reopen.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct ShardStorage {
    #[derive_where(skip(Debug))]
    pub ilog: Arc<dyn IncarnationLog>,
    pub journal: Arc<dyn DtxJournal>,
}

impl ShardStorage {
    pub fn new(ilog: Arc<dyn IncarnationLog>, journal: Arc<dyn DtxJournal>) -> Self {
        Self { ilog, journal }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryIncarnationLog::new()), Arc::new(MemoryJournal::new()))
    }
}

struct ContainerInner {
    coordinator: uuid::Uuid,
    config: DtxConfig,
    clock: Clock,
    placement: Placement,
    membership: Arc<ArcSwap<Membership>>,
    faults: Arc<FaultInjection>,
    storages: Vec<ShardStorage>,
    shards: Vec<Arc<Shard>>,
    transport: Arc<dyn Transport>,
    sequence: AtomicU64,
    _aggregators: Vec<TaskHandle>,
}

/// Handle to a set of shards sharing one epoch clock and membership.
///
/// Background aggregators of all shards stop once the last clone is dropped.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("coordinator", &self.inner.coordinator)
            .field("shards", &self.inner.shards.len())
            .field("membership", &self.membership())
            .finish()
    }
}

impl Container {
    /// Creates container on fresh in memory storages.
    pub async fn create(config: DtxConfig) -> Result<Self> {
        let storages = (0..config.shards).map(|_| ShardStorage::memory()).collect();
        Self::open(config, storages, Arc::new(FaultInjection::new())).await
    }

    /// Opens container on existing storages, rebuilding entries from journals and resyncing
    /// transactions left unresolved.
    pub async fn open(config: DtxConfig, storages: Vec<ShardStorage>, faults: Arc<FaultInjection>) -> Result<Self> {
        if config.shards == 0 || config.fault_domain_width == 0 {
            let (shards, width) = (config.shards, config.fault_domain_width);
            return Err(anyhow!("invalid shard layout: {shards} shards, fault domain width {width}").into());
        }
        if storages.len() != config.shards as usize {
            return Err(anyhow!("expect {} shard storages, got {}", config.shards, storages.len()).into());
        }
        let membership = Arc::new(ArcSwap::from_pointee(Membership::default()));
        let mut shards = Vec::with_capacity(storages.len());
        for (id, storage) in storages.iter().enumerate() {
            let records = storage.journal.replay().await.with_context(|| format!("replay journal of shard {id}"))?;
            debug!("shard {} replayed {} entries", id, records.len());
            shards.push(Arc::new(Shard::new(
                id as ShardId,
                storage.ilog.clone(),
                storage.journal.clone(),
                DtxTable::from_records(records),
                membership.clone(),
                faults.clone(),
            )));
        }
        let transport: Arc<dyn Transport> =
            Arc::new(LocalTransport::new(shards.clone(), config.clone(), faults.clone()));
        let aggregators = shards
            .iter()
            .map(|shard| Aggregator::new(shard.clone(), transport.clone(), config.clone(), faults.clone()).start())
            .collect();
        let container = Self {
            inner: Arc::new(ContainerInner {
                coordinator: uuid::Uuid::new_v4(),
                placement: Placement::new(config.shards, config.fault_domain_width),
                config,
                clock: Clock::new(),
                membership,
                faults,
                storages,
                shards,
                transport,
                sequence: AtomicU64::new(0),
                _aggregators: aggregators,
            }),
        };
        match container.resync().await {
            Ok(report) => info!("container {} opened, resync: {:?}", container.inner.coordinator, report),
            Err(err) => warn!("container {} opened with unresolved transactions: {}", container.inner.coordinator, err),
        }
        Ok(container)
    }

    pub fn storages(&self) -> Vec<ShardStorage> {
        self.inner.storages.clone()
    }

    pub fn coordinator(&self) -> uuid::Uuid {
        self.inner.coordinator
    }

    pub fn next_txn_id(&self) -> TxnId {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        TxnId::new(self.inner.coordinator, sequence)
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn config(&self) -> &DtxConfig {
        &self.inner.config
    }

    pub fn faults(&self) -> &Arc<FaultInjection> {
        &self.inner.faults
    }

    pub fn placement(&self) -> &Placement {
        &self.inner.placement
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.inner.membership.load_full()
    }

    pub fn shard(&self, id: ShardId) -> Option<&Arc<Shard>> {
        self.inner.shards.get(id as usize)
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.inner.shards
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// Writes key in a transaction of its own.
    pub async fn put(&self, key: &[u8], value: Value) -> Result<()> {
        let mut txn = Txn::open(self, TxnFlags::default());
        txn.put(key, value)?;
        txn.commit().await
    }

    /// Reads latest value of key.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let mut txn = Txn::open(self, TxnFlags::default().with_read_only(true));
        let value = txn.get(key).await?;
        txn.close();
        Ok(value)
    }

    /// Punches key in a transaction of its own.
    pub async fn punch(&self, key: &[u8]) -> Result<()> {
        let mut txn = Txn::open(self, TxnFlags::default());
        txn.punch(key)?;
        txn.commit().await
    }

    fn resync_engine<'a>(&'a self, shard: &'a Arc<Shard>) -> ResyncEngine<'a> {
        ResyncEngine::new(shard, self.transport(), &self.inner.config, &self.inner.faults)
    }

    async fn resync_shards(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        for shard in self.inner.shards.iter().filter(|shard| shard.is_up()) {
            report.merge(self.resync_engine(shard).run().await);
        }
        report
    }

    fn check_lost(report: ResyncReport) -> Result<ResyncReport> {
        if !report.lost.is_empty() {
            return Err(TxnError::DataLoss { txn_ids: report.lost });
        }
        Ok(report)
    }

    /// Resyncs unresolved transactions led by up shards.
    pub async fn resync(&self) -> Result<ResyncReport> {
        Self::check_lost(self.resync_shards().await)
    }

    fn update_membership(&self, f: impl Fn(&Membership) -> Membership) -> Arc<Membership> {
        self.inner.membership.rcu(|membership| f(membership));
        let membership = self.membership();
        info!("membership changed to {:?}", membership);
        membership
    }

    /// Excludes shard from membership, moving leadership of its transactions to surviving
    /// participants.
    pub async fn exclude_shard(&self, id: ShardId) -> Result<ResyncReport> {
        let shard = self.shard(id).ok_or_else(|| anyhow!("shard {id} not found"))?;
        shard.set_state(ShardState::Down);
        self.update_membership(|membership| membership.exclude(id));
        self.resync().await
    }

    /// Brings excluded shard back and resyncs transactions it missed, both those it leads now and
    /// those other shards decided while it was excluded.
    pub async fn reintegrate_shard(&self, id: ShardId) -> Result<ResyncReport> {
        let shard = self.shard(id).ok_or_else(|| anyhow!("shard {id} not found"))?;
        shard.set_state(ShardState::Up);
        self.update_membership(|membership| membership.reintegrate(id));
        let mut report = self.resync_shards().await;
        report.merge(self.resync_engine(shard).catch_up().await);
        Self::check_lost(report)
    }

    /// Makes shard unreachable, or reachable again, without changing membership.
    pub fn set_shard_up(&self, id: ShardId, up: bool) -> Result<()> {
        let shard = self.shard(id).ok_or_else(|| anyhow!("shard {id} not found"))?;
        shard.set_state(if up { ShardState::Up } else { ShardState::Down });
        Ok(())
    }

    /// Runs one aggregation pass on every shard.
    pub async fn aggregate(&self) -> Aggregation {
        let mut total = Aggregation::default();
        for shard in self.inner.shards.iter() {
            let aggregator = Aggregator::new(
                shard.clone(),
                self.inner.transport.clone(),
                self.inner.config.clone(),
                self.inner.faults.clone(),
            );
            total += aggregator.run_once().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;

    use super::*;
    use crate::clock::Epoch;
    use crate::dtx::{PrepareRequest, Write};
    use crate::journal::FileJournal;
    use crate::protos::DtxStatus;
    use crate::txn::TxnErrorKind;

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn put_get_punch() {
        let container = Container::create(DtxConfig::default()).await.unwrap();
        assert_that!(container.get(b"k1").await.unwrap()).is_equal_to(None);
        container.put(b"k1", Value::from_static(b"v1")).await.unwrap();
        assert_that!(container.get(b"k1").await.unwrap()).is_equal_to(Some(Value::from_static(b"v1")));
        container.put(b"k1", Value::from_static(b"v2")).await.unwrap();
        assert_that!(container.get(b"k1").await.unwrap()).is_equal_to(Some(Value::from_static(b"v2")));
        container.punch(b"k1").await.unwrap();
        assert_that!(container.get(b"k1").await.unwrap()).is_equal_to(None);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn open_with_mismatched_storages() {
        let storages = vec![ShardStorage::memory()];
        let err = Container::open(DtxConfig::default(), storages, Default::default()).await.unwrap_err();
        assert_that!(err.kind()).is_equal_to(TxnErrorKind::Internal);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn txn_ids_unique() {
        let container = Container::create(DtxConfig::default()).await.unwrap();
        let id1 = container.next_txn_id();
        let id2 = container.next_txn_id();
        assert_that!(id1).is_not_equal_to(id2);
        assert_that!(id1.coordinator()).is_equal_to(container.coordinator());

        let other = Container::create(DtxConfig::default()).await.unwrap();
        assert_that!(other.next_txn_id()).is_not_equal_to(id1);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn reopen_resyncs_decided() {
        let container = Container::create(DtxConfig::default()).await.unwrap();
        container.faults().set_keep_prepared(true);
        let mut txn = Txn::open(&container, TxnFlags::default());
        let keys: Vec<_> = (0..container.placement().shards()).map(|shard| key_on(&container, shard)).collect();
        for key in keys.iter() {
            txn.put(key, Value::from_static(b"v")).unwrap();
        }
        let txn_id = txn.id();
        txn.commit().await.unwrap();
        txn.close();
        assert_that!(container.shard(1).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Prepared));

        let storages = container.storages();
        drop(container);

        let container = Container::open(DtxConfig::default(), storages, Default::default()).await.unwrap();
        for shard in container.shards() {
            assert_that!(shard.status(txn_id)).is_equal_to(Some(DtxStatus::Committed));
        }
        for key in keys.iter() {
            assert_that!(container.get(key).await.unwrap()).is_equal_to(Some(Value::from_static(b"v")));
        }
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn reopen_from_files() {
        let dir = std::env::temp_dir().join(format!("seamdtx-{}", uuid::Uuid::new_v4()));
        let config = DtxConfig::default().with_shards(2);
        let mut storages = Vec::new();
        for shard in 0..2 {
            let journal = FileJournal::open(dir.join(format!("shard-{shard}.journal"))).await.unwrap();
            storages.push(ShardStorage::new(Arc::new(MemoryIncarnationLog::new()), Arc::new(journal)));
        }
        let container = Container::open(config.clone(), storages.clone(), Default::default()).await.unwrap();
        container.put(b"k1", Value::from_static(b"v1")).await.unwrap();
        drop(container);

        let mut reopened = Vec::new();
        for (shard, storage) in storages.into_iter().enumerate() {
            let journal = FileJournal::open(dir.join(format!("shard-{shard}.journal"))).await.unwrap();
            reopened.push(ShardStorage::new(storage.ilog, Arc::new(journal)));
        }
        let container = Container::open(config, reopened, Default::default()).await.unwrap();
        let entries: usize = container.shards().iter().map(|shard| shard.len()).sum();
        assert_that!(entries).is_equal_to(1);
        assert_that!(container.get(b"k1").await.unwrap()).is_equal_to(Some(Value::from_static(b"v1")));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn exclude_and_reintegrate() {
        let container = Container::create(DtxConfig::default()).await.unwrap();
        container.faults().set_keep_prepared(true);
        let mut txn = Txn::open(&container, TxnFlags::default());
        let (k0, k1) = (key_on(&container, 0), key_on(&container, 1));
        txn.put(&k0, Value::from_static(b"v0")).unwrap();
        txn.put(&k1, Value::from_static(b"v1")).unwrap();
        let txn_id = txn.id();
        txn.commit().await.unwrap();
        container.faults().set_keep_prepared(false);

        // when: leader shard 0 goes away
        let report = container.exclude_shard(0).await.unwrap();
        assert_that!(report.pending).is_equal_to(vec![txn_id]);
        assert_that!(container.membership().version).is_equal_to(1);
        assert_that!(container.shard(1).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Committable));
        assert_that!(container.get(&k1).await.unwrap()).is_equal_to(Some(Value::from_static(b"v1")));

        // when: shard 0 comes back
        let report = container.reintegrate_shard(0).await.unwrap();
        assert_that!(report.committed).is_equal_to(vec![txn_id]);
        assert_that!(container.membership().version).is_equal_to(2);
        assert_that!(container.shard(0).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Committed));
        assert_that!(container.shard(1).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Committed));
        assert_that!(container.get(&k0).await.unwrap()).is_equal_to(Some(Value::from_static(b"v0")));
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn excluded_participant_commits_after_reintegration() {
        let config = DtxConfig::default()
            .with_retention(Duration::ZERO)
            .with_prepare_timeout(Duration::ZERO)
            .with_commit_thresholds(Duration::ZERO, 0);
        let container = Container::create(config).await.unwrap();
        container.faults().set_keep_prepared(true);
        let mut txn = Txn::open(&container, TxnFlags::default());
        let (k0, k2) = (key_on(&container, 0), key_on(&container, 2));
        txn.put(&k0, Value::from_static(b"v0")).unwrap();
        txn.put(&k2, Value::from_static(b"v2")).unwrap();
        let txn_id = txn.id();
        txn.commit().await.unwrap();
        container.faults().set_keep_prepared(false);

        // when: participant shard 2 goes away
        let report = container.exclude_shard(2).await.unwrap();
        assert_that!(report.pending).is_equal_to(vec![txn_id]);
        let aggregation = container.aggregate().await;
        assert_that!(aggregation.forgotten).is_equal_to(0);
        assert_that!(container.shard(0).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Committable));
        assert_that!(container.shard(2).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Prepared));

        // when: shard 2 comes back
        let report = container.reintegrate_shard(2).await.unwrap();
        assert_that!(report.committed).is_equal_to(vec![txn_id]);
        assert_that!(container.shard(2).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Committed));
        container.aggregate().await;
        assert_that!(container.shard(0).unwrap().status(txn_id)).is_equal_to(None);

        assert_that!(container.get(&k0).await.unwrap()).is_equal_to(Some(Value::from_static(b"v0")));
        assert_that!(container.get(&k2).await.unwrap()).is_equal_to(Some(Value::from_static(b"v2")));
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn resync_surfaces_data_loss() {
        let config = DtxConfig::default().with_resends(0, Duration::ZERO);
        let container = Container::create(config).await.unwrap();
        let txn_id = container.next_txn_id();
        let request = PrepareRequest {
            txn_id,
            epoch: container.clock().now(),
            leader: 0,
            participants: [0, 1].into_iter().collect(),
            membership: 0,
            reads: vec![],
            writes: vec![Write { key: b"k".to_vec(), value: Some(Value::from_static(b"v")) }],
            tracked: true,
            read_only: false,
        };
        container.shard(0).unwrap().prepare(&request).await.unwrap();
        container.shard(1).unwrap().prepare(&request).await.unwrap();

        container.set_shard_up(1, false).unwrap();
        let err = container.resync().await.unwrap_err();
        assert_that!(err.kind()).is_equal_to(TxnErrorKind::DataLoss);
        assert_that!(container.shard(0).unwrap().status(txn_id)).is_equal_to(Some(DtxStatus::Prepared));

        container.set_shard_up(1, true).unwrap();
        let report = container.resync().await.unwrap();
        assert_that!(report.committed).is_equal_to(vec![txn_id]);
        assert_that!(container.shard(0).unwrap().fetch(b"k", Epoch::MAX, TxnId::NIL, 0, false).unwrap())
            .is_equal_to(Some(Value::from_static(b"v")));
    }

    pub fn key_on(container: &Container, shard: ShardId) -> Vec<u8> {
        (0..)
            .map(|i| format!("key-{i}").into_bytes())
            .find(|key| container.placement().locate(key) == shard)
            .unwrap_or_default()
    }
}
