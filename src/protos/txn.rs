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

use std::fmt::{self, Display, Formatter};

use super::{DtxStatus, TxnId};

impl TxnId {
    pub const NIL: TxnId = TxnId { msb: 0, lsb: 0, sequence: 0 };

    pub fn new(coordinator: uuid::Uuid, sequence: u64) -> Self {
        let (msb, lsb) = coordinator.as_u64_pair();
        Self { msb, lsb, sequence }
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn coordinator(&self) -> uuid::Uuid {
        uuid::Uuid::from_u64_pair(self.msb, self.lsb)
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.coordinator(), self.sequence)
    }
}

impl DtxStatus {
    /// Committed or aborted, no further advance possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, DtxStatus::Committed | DtxStatus::Aborted)
    }

    /// Commit decision has been made.
    pub fn is_decided(self) -> bool {
        matches!(self, DtxStatus::Committable | DtxStatus::Committed)
    }

    /// Tells whether status may advance to given one.
    ///
    /// Statuses only move forward: prepared to committable to committed, or prepared to aborted.
    pub fn can_advance_to(self, next: DtxStatus) -> bool {
        match (self, next) {
            (DtxStatus::Prepared, _) => next != DtxStatus::Prepared,
            (DtxStatus::Committable, DtxStatus::Committed) => true,
            _ => false,
        }
    }
}
