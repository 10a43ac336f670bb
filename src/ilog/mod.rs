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

//! Incarnation log: per key multi-version storage consulted by transactions.

mod memory;

use std::cmp::Ordering::*;

pub use self::memory::MemoryIncarnationLog;
use crate::clock::Epoch;
use crate::protos::TxnId;

pub type Value = bytes::Bytes;

/// Highest epoch a key was read at and the transaction reading it.
///
/// Reader is nil if the key was read by different transactions at that epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadStamp {
    pub epoch: Epoch,
    pub reader: TxnId,
}

impl ReadStamp {
    pub fn new(reader: TxnId, epoch: Epoch) -> Self {
        Self { epoch, reader }
    }

    /// Tells whether a write from `writer` at `epoch` would land at or beneath this read.
    pub fn fences(&self, writer: TxnId, epoch: Epoch) -> bool {
        match epoch.cmp(&self.epoch) {
            Greater => false,
            Less => true,
            Equal => self.reader.is_nil() || self.reader != writer,
        }
    }

    pub fn update(&mut self, reader: TxnId, epoch: Epoch) {
        match epoch.cmp(&self.epoch) {
            Less => {},
            Equal if reader != self.reader => self.reader = TxnId::NIL,
            Equal => {},
            Greater => {
                self.reader = reader;
                self.epoch = epoch;
            },
        }
    }
}

/// Version of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub epoch: Epoch,
    pub txn_id: TxnId,
}

/// Result of reading a key at some epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// No version at or beneath the read epoch.
    Missing,
    /// Committed version, `None` value for punched key.
    Visible { epoch: Epoch, value: Option<Value> },
    /// Newest version at or beneath the read epoch is staged by an unresolved transaction.
    Pending { epoch: Epoch, txn_id: TxnId, value: Option<Value> },
}

impl Lookup {
    /// Tells whether a committed, non punched value exists.
    pub fn exists(&self) -> bool {
        matches!(self, Lookup::Visible { value: Some(_), .. })
    }
}

/// Boundary to per key multi-version store.
///
/// A version put at epoch `E` becomes visible to reads at epoch `E` or above once its owning
/// transaction commits, and vanishes if it aborts.
pub trait IncarnationLog: Send + Sync + 'static {
    /// Stages a version owned by given transaction, `None` value punches the key.
    fn put(&self, key: &[u8], epoch: Epoch, value: Option<Value>, txn_id: TxnId);

    fn get(&self, key: &[u8], epoch: Epoch) -> Lookup;

    /// Highest committed version of key.
    fn highest(&self, key: &[u8]) -> Option<Version>;

    /// Staged versions of unresolved transactions.
    fn pending(&self, key: &[u8]) -> Vec<Version>;

    fn read_timestamp(&self, key: &[u8]) -> ReadStamp;

    fn record_read(&self, key: &[u8], epoch: Epoch, reader: TxnId);

    /// Makes versions staged by given transaction visible.
    fn commit(&self, txn_id: TxnId, keys: &[Vec<u8>]);

    /// Drops versions staged by given transaction.
    fn abort(&self, txn_id: TxnId, keys: &[Vec<u8>]);

    /// Reads all keys at given epoch, skipping keys without versions beneath it.
    fn scan(&self, epoch: Epoch) -> Vec<(Vec<u8>, Lookup)>;
}
