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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{decode_frames, encode_frame, fold_records, DtxJournal, JournalError, Result};
use crate::protos::DtxRecord;

#[derive(Debug, Default)]
struct MemoryJournalContent {
    frames: spin::Mutex<Vec<Vec<u8>>>,
    unavailable: AtomicBool,
}

/// Journal living in memory.
///
/// Clones share content, so a clone outlives the shard opened on it like a disk does.
#[derive(Clone, Debug, Default)]
pub struct MemoryJournal {
    content: Arc<MemoryJournalContent>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails all following appends until reverted.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.content.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of appended records.
    pub fn len(&self) -> usize {
        self.content.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DtxJournal for MemoryJournal {
    async fn append(&self, record: &DtxRecord) -> Result<()> {
        if self.content.unavailable.load(Ordering::Relaxed) {
            return Err(JournalError::Unavailable { message: "memory journal switched off".to_string() });
        }
        let frame = encode_frame(record);
        self.content.frames.lock().push(frame);
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<DtxRecord>> {
        let frames = self.content.frames.lock().concat();
        let (records, _) = decode_frames(&frames)?;
        Ok(fold_records(records))
    }
}
