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

use std::collections::BTreeMap;

use super::{IncarnationLog, Lookup, ReadStamp, Value, Version};
use crate::clock::Epoch;
use crate::protos::TxnId;

#[derive(Clone, Debug)]
struct Incarnation {
    epoch: Epoch,
    txn_id: TxnId,
    value: Option<Value>,
    committed: bool,
}

impl Incarnation {
    fn lookup(&self) -> Lookup {
        if self.committed {
            Lookup::Visible { epoch: self.epoch, value: self.value.clone() }
        } else {
            Lookup::Pending { epoch: self.epoch, txn_id: self.txn_id, value: self.value.clone() }
        }
    }
}

#[derive(Debug, Default)]
struct History {
    /// Sorted by epoch.
    incarnations: Vec<Incarnation>,
    read: ReadStamp,
}

impl History {
    fn get(&self, epoch: Epoch) -> Lookup {
        match self.incarnations.iter().rev().find(|incarnation| incarnation.epoch <= epoch) {
            None => Lookup::Missing,
            Some(incarnation) => incarnation.lookup(),
        }
    }

    fn put(&mut self, epoch: Epoch, value: Option<Value>, txn_id: TxnId) {
        if let Some(incarnation) =
            self.incarnations.iter_mut().find(|incarnation| incarnation.epoch == epoch && incarnation.txn_id == txn_id)
        {
            incarnation.value = value;
            return;
        }
        let i = self.incarnations.partition_point(|incarnation| incarnation.epoch <= epoch);
        self.incarnations.insert(i, Incarnation { epoch, txn_id, value, committed: false });
    }
}

/// Incarnation log living in memory.
#[derive(Debug, Default)]
pub struct MemoryIncarnationLog {
    keys: spin::Mutex<BTreeMap<Vec<u8>, History>>,
}

impl MemoryIncarnationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IncarnationLog for MemoryIncarnationLog {
    fn put(&self, key: &[u8], epoch: Epoch, value: Option<Value>, txn_id: TxnId) {
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(history) => history.put(epoch, value, txn_id),
            None => {
                let mut history = History::default();
                history.put(epoch, value, txn_id);
                keys.insert(key.to_owned(), history);
            },
        }
    }

    fn get(&self, key: &[u8], epoch: Epoch) -> Lookup {
        let keys = self.keys.lock();
        keys.get(key).map(|history| history.get(epoch)).unwrap_or(Lookup::Missing)
    }

    fn highest(&self, key: &[u8]) -> Option<Version> {
        let keys = self.keys.lock();
        let history = keys.get(key)?;
        history
            .incarnations
            .iter()
            .rev()
            .find(|incarnation| incarnation.committed)
            .map(|incarnation| Version { epoch: incarnation.epoch, txn_id: incarnation.txn_id })
    }

    fn pending(&self, key: &[u8]) -> Vec<Version> {
        let keys = self.keys.lock();
        let Some(history) = keys.get(key) else {
            return Vec::new();
        };
        history
            .incarnations
            .iter()
            .filter(|incarnation| !incarnation.committed)
            .map(|incarnation| Version { epoch: incarnation.epoch, txn_id: incarnation.txn_id })
            .collect()
    }

    fn read_timestamp(&self, key: &[u8]) -> ReadStamp {
        let keys = self.keys.lock();
        keys.get(key).map(|history| history.read).unwrap_or_default()
    }

    fn record_read(&self, key: &[u8], epoch: Epoch, reader: TxnId) {
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(history) => history.read.update(reader, epoch),
            None => {
                let history = History { incarnations: Vec::new(), read: ReadStamp::new(reader, epoch) };
                keys.insert(key.to_owned(), history);
            },
        }
    }

    fn commit(&self, txn_id: TxnId, keys: &[Vec<u8>]) {
        let mut histories = self.keys.lock();
        for key in keys {
            let Some(history) = histories.get_mut(key.as_slice()) else {
                continue;
            };
            history
                .incarnations
                .iter_mut()
                .filter(|incarnation| incarnation.txn_id == txn_id)
                .for_each(|incarnation| incarnation.committed = true);
        }
    }

    fn abort(&self, txn_id: TxnId, keys: &[Vec<u8>]) {
        let mut histories = self.keys.lock();
        for key in keys {
            let Some(history) = histories.get_mut(key.as_slice()) else {
                continue;
            };
            history.incarnations.retain(|incarnation| incarnation.committed || incarnation.txn_id != txn_id);
        }
    }

    fn scan(&self, epoch: Epoch) -> Vec<(Vec<u8>, Lookup)> {
        let keys = self.keys.lock();
        keys.iter()
            .map(|(key, history)| (key, history.get(epoch)))
            .filter(|(_, lookup)| *lookup != Lookup::Missing)
            .map(|(key, lookup)| (key.clone(), lookup))
            .collect()
    }
}
