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

use std::time::Duration;

use hashbrown::hash_map::{Entry, HashMap};

use super::entry::DtxEntry;
use crate::protos::{DtxRecord, DtxStatus, TxnId};

/// Arena of DTX entries on one shard indexed by transaction id.
///
/// Slots of removed entries are reused so long running shards do not churn allocations.
#[derive(Debug, Default)]
pub struct DtxTable {
    slots: Vec<Option<DtxEntry>>,
    free: Vec<usize>,
    index: HashMap<TxnId, usize>,
}

impl DtxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DtxRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.insert(DtxEntry::from_record(record));
        }
        table
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, txn_id: &TxnId) -> Option<&DtxEntry> {
        let slot = *self.index.get(txn_id)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, txn_id: &TxnId) -> Option<&mut DtxEntry> {
        let slot = *self.index.get(txn_id)?;
        self.slots[slot].as_mut()
    }

    pub fn status(&self, txn_id: &TxnId) -> Option<DtxStatus> {
        self.get(txn_id).map(|entry| entry.status)
    }

    /// Inserts entry if absent, returns entry stored.
    pub fn insert(&mut self, entry: DtxEntry) -> &mut DtxEntry {
        let slot = match self.index.entry(entry.txn_id) {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(vacant) => {
                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.slots[slot] = Some(entry);
                        slot
                    },
                    None => {
                        self.slots.push(Some(entry));
                        self.slots.len() - 1
                    },
                };
                *vacant.insert(slot)
            },
        };
        match &mut self.slots[slot] {
            Some(entry) => entry,
            None => unreachable!("indexed slot {slot} is vacant"),
        }
    }

    pub fn remove(&mut self, txn_id: &TxnId) -> Option<DtxEntry> {
        let slot = self.index.remove(txn_id)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DtxEntry> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Entries resolved for at least given duration.
    pub fn expired(&self, retention: Duration) -> Vec<TxnId> {
        self.iter()
            .filter(|entry| entry.resolved_for().map(|resolved| resolved >= retention).unwrap_or(false))
            .map(|entry| entry.txn_id)
            .collect()
    }
}
