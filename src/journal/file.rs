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

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{decode_frames, encode_frame, fold_records, DtxJournal, Result};
use crate::protos::DtxRecord;

/// Journal appending length framed records to a local file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Opens journal at given path, cutting off torn tail of last interrupted append.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = Self::read(&path).await?;
        let (_, intact) = decode_frames(&content)?;
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        if intact < content.len() {
            debug!("truncating journal {} from {} to {} bytes", path.display(), content.len(), intact);
            file.set_len(intact as u64).await?;
        }
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl DtxJournal for FileJournal {
    async fn append(&self, record: &DtxRecord) -> Result<()> {
        let frame = encode_frame(record);
        let mut file = self.file.lock().await;
        file.write_all(&frame).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<DtxRecord>> {
        let _guard = self.file.lock().await;
        let content = Self::read(&self.path).await?;
        let (records, _) = decode_frames(&content)?;
        Ok(fold_records(records))
    }
}
