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

use std::sync::Arc;
use std::time::SystemTime;

use static_assertions::{assert_impl_all, assert_not_impl_any};

/// Logical timestamp ordering every operation within a container.
///
/// Versions written at epoch `E` become visible to reads at epochs greater than or equal to `E`
/// once their transactions commit.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);
    pub const MAX: Epoch = Epoch(u64::MAX);

    pub const fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Epoch {
    fn from(epoch: u64) -> Self {
        Self(epoch)
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Epoch source shared by clients and shards of a container.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<SystemTimeClock>,
}

impl Clock {
    pub fn new() -> Self {
        Self { inner: Arc::new(SystemTimeClock::new()) }
    }

    /// Issues an epoch strictly greater than every epoch issued or adopted before.
    pub fn now(&self) -> Epoch {
        self.inner.now()
    }

    /// Adopts a fresher epoch observed from elsewhere.
    pub fn update(&self, epoch: Epoch) {
        self.inner.update(epoch)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn system_time_now() -> Epoch {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    Epoch(nanos)
}

struct SystemTimeClock {
    mutex: spin::Mutex<Epoch>,
}

assert_impl_all!(SystemTimeClock: Send, Sync);
assert_not_impl_any!(SystemTimeClock: Clone, Copy);

impl SystemTimeClock {
    fn new() -> Self {
        Self { mutex: spin::Mutex::new(system_time_now()) }
    }

    fn now(&self) -> Epoch {
        let mut now = system_time_now();
        let mut cache = self.mutex.lock();
        if now <= *cache {
            *cache = cache.next();
            now = *cache;
        } else {
            *cache = now;
        }
        now
    }

    fn update(&self, epoch: Epoch) {
        let mut cache = self.mutex.lock();
        if epoch > *cache {
            *cache = epoch;
        }
    }
}
