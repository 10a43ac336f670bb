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

//! Durable journal of DTX entries and its implementations.

mod file;
mod memory;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use hashbrown::HashMap;
use prost::Message;
use thiserror::Error;
use tracing::warn;

pub use self::file::FileJournal;
pub use self::memory::MemoryJournal;
use crate::protos::{DtxRecord, TxnId};

const FRAME_MAGIC: u16 = 0xd7c0;
const FRAME_HEADER_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted { offset: usize, message: String },
    #[error("journal unavailable: {message}")]
    Unavailable { message: String },
}

impl JournalError {
    pub fn corrupted(offset: usize, message: impl Into<String>) -> Self {
        Self::Corrupted { offset, message: message.into() }
    }
}

pub type Result<T, E = JournalError> = std::result::Result<T, E>;

/// Append only journal persisting DTX entry records of one shard.
#[async_trait]
pub trait DtxJournal: std::fmt::Debug + Send + Sync + 'static {
    /// Appends record durably.
    async fn append(&self, record: &DtxRecord) -> Result<()>;

    /// Replays journal to latest record of every entry not yet forgotten.
    async fn replay(&self) -> Result<Vec<DtxRecord>>;
}

fn encode_frame(record: &DtxRecord) -> Vec<u8> {
    let payload = record.encode_to_vec();
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u16(FRAME_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf
}

/// Decodes frames, tolerating a torn tail left by an interrupted append.
///
/// Returns decoded records and length of intact frames.
fn decode_frames(mut buf: &[u8]) -> Result<(Vec<DtxRecord>, usize)> {
    let total = buf.len();
    let mut records = Vec::new();
    let mut intact = 0;
    while buf.has_remaining() {
        let offset = total - buf.remaining();
        if buf.remaining() < FRAME_HEADER_SIZE {
            warn!("journal ends with torn frame header at offset {}", offset);
            break;
        }
        let magic = buf.get_u16();
        if magic != FRAME_MAGIC {
            return Err(JournalError::corrupted(offset, format!("unexpected frame magic {magic:#x}")));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            warn!("journal ends with torn frame of {} bytes at offset {}", len, offset);
            break;
        }
        let record = DtxRecord::decode(&buf[..len]).map_err(|err| JournalError::corrupted(offset, err.to_string()))?;
        buf.advance(len);
        records.push(record);
        intact = total - buf.remaining();
    }
    Ok((records, intact))
}

/// Folds records to latest one of every entry, dropping forgotten entries.
fn fold_records(records: impl IntoIterator<Item = DtxRecord>) -> Vec<DtxRecord> {
    let mut latest: HashMap<TxnId, (usize, DtxRecord)> = HashMap::new();
    for (i, record) in records.into_iter().enumerate() {
        latest.insert(record.id(), (i, record));
    }
    let mut records: Vec<_> = latest.into_values().filter(|(_, record)| !record.forgotten).collect();
    records.sort_by_key(|(i, _)| *i);
    records.into_iter().map(|(_, record)| record).collect()
}

#[cfg(test)]
pub mod tests {
    use assertor::*;

    use super::*;
    use crate::protos::DtxStatus;

    pub fn record(sequence: u64, status: DtxStatus) -> DtxRecord {
        let mut record = DtxRecord {
            txn_id: Some(TxnId::new(uuid::Uuid::nil(), sequence)),
            epoch: 100 + sequence,
            participants: vec![0b11],
            keys: vec![format!("k{sequence}").into_bytes()],
            ..Default::default()
        };
        record.set_status(status);
        record
    }

    /// Exercises journal contract against given journal.
    pub async fn check_journal(journal: &dyn DtxJournal) {
        assert_that!(journal.replay().await.unwrap()).is_empty();

        journal.append(&record(1, DtxStatus::Prepared)).await.unwrap();
        journal.append(&record(2, DtxStatus::Prepared)).await.unwrap();
        journal.append(&record(1, DtxStatus::Committable)).await.unwrap();
        journal.append(&record(3, DtxStatus::Prepared)).await.unwrap();
        journal.append(&record(2, DtxStatus::Aborted)).await.unwrap();
        journal.append(&DtxRecord::tombstone(TxnId::new(uuid::Uuid::nil(), 3))).await.unwrap();

        let records = journal.replay().await.unwrap();
        assert_that!(records).has_length(2);
        assert_that!(records[0]).is_equal_to(record(1, DtxStatus::Committable));
        assert_that!(records[1]).is_equal_to(record(2, DtxStatus::Aborted));
    }

    #[test]
    fn frames_round_trip() {
        let mut buf = encode_frame(&record(1, DtxStatus::Prepared));
        buf.extend(encode_frame(&record(2, DtxStatus::Committed)));
        let (records, intact) = decode_frames(&buf).unwrap();
        assert_that!(records).is_equal_to(vec![record(1, DtxStatus::Prepared), record(2, DtxStatus::Committed)]);
        assert_that!(intact).is_equal_to(buf.len());
    }

    #[test]
    fn frames_torn_tail() {
        let mut buf = encode_frame(&record(1, DtxStatus::Prepared));
        let second = encode_frame(&record(2, DtxStatus::Committed));
        let first_len = buf.len();
        buf.extend_from_slice(&second[..second.len() - 1]);
        let (records, intact) = decode_frames(&buf).unwrap();
        assert_that!(records).is_equal_to(vec![record(1, DtxStatus::Prepared)]);
        assert_that!(intact).is_equal_to(first_len);

        let (records, intact) = decode_frames(&buf[..first_len + 3]).unwrap();
        assert_that!(records).has_length(1);
        assert_that!(intact).is_equal_to(first_len);
    }

    #[test]
    fn frames_corrupted() {
        let mut buf = encode_frame(&record(1, DtxStatus::Prepared));
        buf[0] = 0;
        let err = decode_frames(&buf).unwrap_err();
        assert_that!(matches!(err, JournalError::Corrupted { offset: 0, .. })).is_true();
    }

    #[test]
    fn fold_keeps_latest() {
        let records = fold_records(vec![
            record(1, DtxStatus::Prepared),
            record(2, DtxStatus::Prepared),
            record(1, DtxStatus::Committed),
            DtxRecord::tombstone(TxnId::new(uuid::Uuid::nil(), 2)),
        ]);
        assert_that!(records).is_equal_to(vec![record(1, DtxStatus::Committed)]);
    }
}
