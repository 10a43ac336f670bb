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

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::clock::Epoch;
use crate::container::Container;
use crate::dtx::{AbortCause, CommitRequest, ShardError, ShardOps, ShardRequest, UncertaintyResolver, Write};
use crate::ilog::Value;
use crate::placement::{ShardBitmap, ShardId};
use crate::protos::TxnId;
use crate::transport::send_with_resend;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxnFlags {
    /// Rejects every write.
    pub read_only: bool,
    /// Buffers caller's values without copying.
    pub zero_copy: bool,
}

impl TxnFlags {
    pub fn with_read_only(self, read_only: bool) -> Self {
        Self { read_only, ..self }
    }

    pub fn with_zero_copy(self, zero_copy: bool) -> Self {
        Self { zero_copy, ..self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Open,
    /// Commit was sent but its outcome is unknown to the handle.
    Committing,
    Committed,
    Aborted,
    /// Commit lost to a concurrent transaction, restart to continue.
    Conflict,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("txn {txn_id} conflicts at epoch {epoch}: {source}")]
    Conflict { txn_id: TxnId, epoch: Epoch, source: ShardError },
    #[error("txn {txn_id} outcome uncertain")]
    Uncertain { txn_id: TxnId },
    #[error("txn {txn_id} can not {operation} in state {state:?}")]
    PermissionDenied { txn_id: TxnId, operation: &'static str, state: TxnState },
    #[error("txn {txn_id} already done")]
    AlreadyDone { txn_id: TxnId },
    #[error("key {key:?} already exists")]
    AlreadyExists { key: Vec<u8> },
    #[error("key {key:?} not found")]
    NotFound { key: Vec<u8> },
    #[error("txn {txn_id} aborted by io failure: {source}")]
    Io { txn_id: TxnId, source: ShardError },
    #[error("outcome of txns {txn_ids:?} lost")]
    DataLoss { txn_ids: Vec<TxnId> },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Class of [TxnError] for callers to decide how to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnErrorKind {
    Conflict,
    Uncertain,
    PermissionDenied,
    AlreadyDone,
    AlreadyExists,
    NotFound,
    Io,
    DataLoss,
    Internal,
}

impl TxnError {
    pub fn kind(&self) -> TxnErrorKind {
        match self {
            TxnError::Conflict { .. } => TxnErrorKind::Conflict,
            TxnError::Uncertain { .. } => TxnErrorKind::Uncertain,
            TxnError::PermissionDenied { .. } => TxnErrorKind::PermissionDenied,
            TxnError::AlreadyDone { .. } => TxnErrorKind::AlreadyDone,
            TxnError::AlreadyExists { .. } => TxnErrorKind::AlreadyExists,
            TxnError::NotFound { .. } => TxnErrorKind::NotFound,
            TxnError::Io { .. } => TxnErrorKind::Io,
            TxnError::DataLoss { .. } => TxnErrorKind::DataLoss,
            TxnError::Internal(_) => TxnErrorKind::Internal,
        }
    }
}

pub type Result<T, E = TxnError> = std::result::Result<T, E>;

/// Client side handle of a transaction.
///
/// Writes are buffered until commit, reads go to shards at the handle's epoch. A restart keeps
/// the handle but runs a new attempt with fresh transaction id and greater epoch.
pub struct Txn {
    container: Container,
    id: TxnId,
    epoch: Epoch,
    flags: TxnFlags,
    snapshot: bool,
    state: TxnState,
    /// Membership version pinned at first io.
    membership: Option<u64>,
    participants: ShardBitmap,
    reads: BTreeMap<ShardId, BTreeSet<Vec<u8>>>,
    writes: BTreeMap<Vec<u8>, Option<Value>>,
    timeout: Duration,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("participants", &self.participants)
            .finish()
    }
}

impl Txn {
    pub fn open(container: &Container, flags: TxnFlags) -> Self {
        let epoch = container.clock().now();
        Self::open_at(container, flags, epoch, false)
    }

    /// Opens read only handle reading at given epoch.
    pub fn open_snapshot(container: &Container, epoch: Epoch) -> Self {
        Self::open_at(container, TxnFlags::default().with_read_only(true), epoch, true)
    }

    fn open_at(container: &Container, flags: TxnFlags, epoch: Epoch, snapshot: bool) -> Self {
        let id = container.next_txn_id();
        trace!("open txn {} at epoch {} with {:?}", id, epoch, flags);
        Self {
            container: container.clone(),
            id,
            epoch,
            flags,
            snapshot,
            state: TxnState::Open,
            membership: None,
            participants: ShardBitmap::new(),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            timeout: container.config().fan_in_timeout,
        }
    }

    /// Time leader waits for participants to prepare.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn participants(&self) -> &ShardBitmap {
        &self.participants
    }

    fn check_state(&self, operation: &'static str) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(TxnError::PermissionDenied { txn_id: self.id, operation, state: self.state });
        }
        Ok(())
    }

    fn check_writable(&self, operation: &'static str) -> Result<()> {
        self.check_state(operation)?;
        if self.flags.read_only {
            return Err(TxnError::PermissionDenied { txn_id: self.id, operation, state: self.state });
        }
        Ok(())
    }

    fn pin_membership(&mut self) -> u64 {
        let current = self.container.membership().version;
        *self.membership.get_or_insert(current)
    }

    fn conflict(&mut self, epoch: Epoch, source: ShardError) -> TxnError {
        self.state = TxnState::Conflict;
        TxnError::Conflict { txn_id: self.id, epoch, source }
    }

    /// Maps failure of a read to handle error.
    fn read_error(&mut self, err: ShardError) -> TxnError {
        match err {
            ShardError::StaleMembership { .. } => self.conflict(self.epoch, err),
            ShardError::Conflict { epoch, .. } => self.conflict(epoch, err),
            ShardError::Uncertain { .. }
            | ShardError::InProgress { .. }
            | ShardError::Timeout { .. }
            | ShardError::Unreachable { .. } => TxnError::Uncertain { txn_id: self.id },
            ShardError::Io { .. } => TxnError::Io { txn_id: self.id, source: err },
            ShardError::Aborted { .. } | ShardError::Committed { .. } | ShardError::UnexpectedResponse { .. } => {
                TxnError::Internal(anyhow::Error::new(err))
            },
        }
    }

    async fn fetch(&mut self, key: &[u8]) -> Result<Option<Value>> {
        let shard = self.container.placement().locate(key);
        let membership = self.pin_membership();
        let record_read = !self.snapshot;
        let container = self.container.clone();
        let resolver = UncertaintyResolver::new(container.transport(), container.config());
        let result = resolver.fetch(shard, key, self.epoch, self.id, membership, record_read).await;
        let value = result.map_err(|err| self.read_error(err))?;
        if record_read {
            self.participants.insert(shard);
            self.reads.entry(shard).or_default().insert(key.to_vec());
        }
        Ok(value)
    }

    /// Reads key at handle's epoch, seeing handle's own writes.
    #[instrument(skip_all, fields(txn.id = %self.id))]
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.check_state("read")?;
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        self.fetch(key).await
    }

    /// Tells whether key has a value in handle's view.
    pub async fn exists(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Lists keys with values in handle's view across all shards.
    pub async fn list_keys(&mut self) -> Result<Vec<Vec<u8>>> {
        self.check_state("read")?;
        let membership = self.pin_membership();
        let container = self.container.clone();
        let resolver = UncertaintyResolver::new(container.transport(), container.config());
        let mut keys = BTreeSet::new();
        for shard in container.placement().all().iter() {
            match resolver.enumerate(shard, self.epoch, self.id, membership).await {
                Ok(shard_keys) => keys.extend(shard_keys),
                Err(err) => return Err(self.read_error(err)),
            }
        }
        for (key, value) in self.writes.iter() {
            match value {
                Some(_) => keys.insert(key.clone()),
                None => keys.remove(key),
            };
        }
        Ok(keys.into_iter().collect())
    }

    fn write(&mut self, key: &[u8], value: Option<Value>) {
        let shard = self.container.placement().locate(key);
        let value = match self.flags.zero_copy {
            true => value,
            false => value.map(|value| Value::copy_from_slice(&value)),
        };
        self.participants.insert(shard);
        self.writes.insert(key.to_vec(), value);
    }

    pub fn put(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.check_writable("write")?;
        self.write(key, Some(value));
        Ok(())
    }

    pub fn punch(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable("punch")?;
        self.write(key, None);
        Ok(())
    }

    /// Writes key only if it has no value.
    pub async fn insert(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.check_writable("insert")?;
        if self.exists(key).await? {
            return Err(TxnError::AlreadyExists { key: key.to_vec() });
        }
        self.write(key, Some(value));
        Ok(())
    }

    /// Writes key only if it has a value.
    pub async fn update(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.check_writable("update")?;
        if !self.exists(key).await? {
            return Err(TxnError::NotFound { key: key.to_vec() });
        }
        self.write(key, Some(value));
        Ok(())
    }

    /// Punches key only if it has a value.
    pub async fn punch_existing(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable("punch")?;
        if !self.exists(key).await? {
            return Err(TxnError::NotFound { key: key.to_vec() });
        }
        self.write(key, None);
        Ok(())
    }

    fn commit_request(&mut self) -> CommitRequest {
        let membership = self.pin_membership();
        let placement = *self.container.placement();
        let mut ops: BTreeMap<ShardId, ShardOps> =
            self.participants.iter().map(|shard| (shard, ShardOps { shard, ..Default::default() })).collect();
        for (shard, keys) in self.reads.iter() {
            if let Some(ops) = ops.get_mut(shard) {
                ops.reads = keys.iter().cloned().collect();
            }
        }
        for (key, value) in self.writes.iter() {
            let shard = placement.locate(key);
            ops.entry(shard)
                .or_insert_with(|| ShardOps { shard, ..Default::default() })
                .writes
                .push(Write { key: key.clone(), value: value.clone() });
        }
        let read_only = self.writes.is_empty();
        CommitRequest {
            txn_id: self.id,
            epoch: self.epoch,
            membership,
            participants: self.participants.clone(),
            ops: ops.into_values().collect(),
            read_only,
            tracked: !read_only || placement.spans_fault_domains(&self.participants),
            fan_in_timeout: self.timeout,
        }
    }

    /// Maps failure of a commit to handle error and state.
    fn commit_error(&mut self, err: ShardError) -> TxnError {
        match err {
            ShardError::Aborted { cause, .. } => match cause {
                AbortCause::Conflict { epoch } => {
                    self.container.clock().update(epoch);
                    self.conflict(epoch, err)
                },
                AbortCause::StaleMembership | AbortCause::Timeout | AbortCause::Resync | AbortCause::Unknown => {
                    self.conflict(self.epoch, err)
                },
                AbortCause::Io => {
                    self.state = TxnState::Aborted;
                    TxnError::Io { txn_id: self.id, source: err }
                },
                AbortCause::Requested => {
                    self.state = TxnState::Aborted;
                    TxnError::PermissionDenied { txn_id: self.id, operation: "commit", state: self.state }
                },
            },
            ShardError::StaleMembership { .. } => self.conflict(self.epoch, err),
            ShardError::Conflict { epoch, .. } => self.conflict(epoch, err),
            ShardError::Io { .. } => {
                self.state = TxnState::Aborted;
                TxnError::Io { txn_id: self.id, source: err }
            },
            ShardError::Committed { .. } => {
                self.state = TxnState::Committed;
                TxnError::AlreadyDone { txn_id: self.id }
            },
            ShardError::Uncertain { .. }
            | ShardError::InProgress { .. }
            | ShardError::Timeout { .. }
            | ShardError::Unreachable { .. } => TxnError::Uncertain { txn_id: self.id },
            ShardError::UnexpectedResponse { .. } => TxnError::Internal(anyhow::Error::new(err)),
        }
    }

    /// Commits transaction atomically across all shards it touched.
    ///
    /// Uncertain outcome leaves handle committing, in which state commit could be retried or
    /// abort could be requested.
    #[instrument(skip_all, fields(txn.id = %self.id))]
    pub async fn commit(&mut self) -> Result<()> {
        match self.state {
            TxnState::Committed => return Err(TxnError::AlreadyDone { txn_id: self.id }),
            TxnState::Aborted | TxnState::Conflict => {
                return Err(TxnError::PermissionDenied { txn_id: self.id, operation: "commit", state: self.state })
            },
            TxnState::Open | TxnState::Committing => {},
        }
        if self.participants.is_empty() || self.snapshot {
            self.state = TxnState::Committed;
            return Ok(());
        }
        let request = self.commit_request();
        let Some(leader) = self.container.membership().leader_of(&self.participants) else {
            debug!("no member left among participants {:?}", self.participants);
            return Err(TxnError::Uncertain { txn_id: self.id });
        };
        self.state = TxnState::Committing;
        let container = self.container.clone();
        let request = ShardRequest::Coordinate(request);
        let result = send_with_resend(container.transport(), leader, request, container.config()).await;
        match result {
            Ok(_) => {
                self.state = TxnState::Committed;
                Ok(())
            },
            Err(err) => {
                debug!("txn {} fails to commit: {}", self.id, err);
                Err(self.commit_error(err))
            },
        }
    }

    /// Aborts transaction, discarding buffered writes.
    #[instrument(skip_all, fields(txn.id = %self.id))]
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            TxnState::Aborted => return Err(TxnError::AlreadyDone { txn_id: self.id }),
            TxnState::Committed => {
                return Err(TxnError::PermissionDenied { txn_id: self.id, operation: "abort", state: self.state })
            },
            TxnState::Open | TxnState::Conflict => {},
            TxnState::Committing => self.cancel().await?,
        }
        self.state = TxnState::Aborted;
        self.writes.clear();
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        let Some(leader) = self.container.membership().leader_of(&self.participants) else {
            return Err(TxnError::Uncertain { txn_id: self.id });
        };
        let container = self.container.clone();
        let request = ShardRequest::Cancel { txn_id: self.id };
        match send_with_resend(container.transport(), leader, request, container.config()).await {
            Ok(_) => Ok(()),
            Err(ShardError::Committed { .. }) => {
                self.state = TxnState::Committed;
                Err(TxnError::PermissionDenied { txn_id: self.id, operation: "abort", state: self.state })
            },
            Err(err) => {
                debug!("txn {} fails to cancel: {}", self.id, err);
                Err(TxnError::Uncertain { txn_id: self.id })
            },
        }
    }

    /// Restarts transaction after conflict with fresh id and greater epoch.
    #[instrument(skip_all, fields(txn.id = %self.id))]
    pub fn restart(&mut self) -> Result<()> {
        if self.state != TxnState::Conflict {
            return Err(TxnError::PermissionDenied { txn_id: self.id, operation: "restart", state: self.state });
        }
        let epoch = self.container.clock().now().max(self.epoch.next());
        let id = self.container.next_txn_id();
        debug!("restart txn {} as {} from epoch {} to {}", self.id, id, self.epoch, epoch);
        self.id = id;
        self.epoch = epoch;
        self.state = TxnState::Open;
        self.membership = None;
        self.participants = ShardBitmap::new();
        self.reads.clear();
        self.writes.clear();
        Ok(())
    }

    /// Closes handle. Entries of an ambiguous commit are left to resync or timeout abort.
    pub fn close(self) {
        if self.state == TxnState::Committing {
            debug!("close txn {} with uncertain outcome", self.id);
        }
    }
}

impl Container {
    /// Opens a transaction handle on this container.
    pub fn begin(&self, flags: TxnFlags) -> Txn {
        Txn::open(self, flags)
    }
}
