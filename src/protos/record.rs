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

use super::{DtxRecord, TxnId};

impl DtxRecord {
    pub fn tombstone(txn_id: TxnId) -> Self {
        Self { txn_id: Some(txn_id), forgotten: true, ..Default::default() }
    }

    pub fn id(&self) -> TxnId {
        self.txn_id.unwrap_or(TxnId::NIL)
    }
}
