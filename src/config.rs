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

/// How leader finishes a transaction after all participants prepared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Commit every participant before replying.
    Sync,
    /// Mark committable, reply and leave commit to the aggregator.
    #[default]
    Batched,
}

/// Knobs of a container.
#[derive(Clone, Debug)]
pub struct DtxConfig {
    pub shards: u32,
    /// Number of consecutive shards sharing one fault domain.
    pub fault_domain_width: u32,
    pub commit_policy: CommitPolicy,
    /// Committable entries older than this are committed by the aggregator.
    pub commit_age_threshold: Duration,
    /// All committable entries are committed once there are more than this many.
    pub commit_count_threshold: usize,
    pub aggregation_interval: Duration,
    /// Leader entries prepared longer than this are aborted.
    pub prepare_timeout: Duration,
    /// Resolved entries are kept this long for late resolvers.
    pub retention: Duration,
    /// Default time a leader waits for prepare acks.
    pub fan_in_timeout: Duration,
    /// Resends of a timed out request before giving up.
    pub max_resends: usize,
    pub resend_backoff: Duration,
    /// Resolutions a single read attempts before returning uncertain.
    pub max_resolutions: usize,
}

impl Default for DtxConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            fault_domain_width: 2,
            commit_policy: CommitPolicy::default(),
            commit_age_threshold: Duration::from_secs(1),
            commit_count_threshold: 512,
            aggregation_interval: Duration::from_millis(200),
            prepare_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(60),
            fan_in_timeout: Duration::from_secs(5),
            max_resends: 3,
            resend_backoff: Duration::from_millis(10),
            max_resolutions: 8,
        }
    }
}

impl DtxConfig {
    pub fn with_shards(self, shards: u32) -> Self {
        Self { shards, ..self }
    }

    pub fn with_fault_domain_width(self, fault_domain_width: u32) -> Self {
        Self { fault_domain_width, ..self }
    }

    pub fn with_commit_policy(self, commit_policy: CommitPolicy) -> Self {
        Self { commit_policy, ..self }
    }

    pub fn with_commit_thresholds(self, age: Duration, count: usize) -> Self {
        Self { commit_age_threshold: age, commit_count_threshold: count, ..self }
    }

    pub fn with_aggregation_interval(self, aggregation_interval: Duration) -> Self {
        Self { aggregation_interval, ..self }
    }

    pub fn with_prepare_timeout(self, prepare_timeout: Duration) -> Self {
        Self { prepare_timeout, ..self }
    }

    pub fn with_retention(self, retention: Duration) -> Self {
        Self { retention, ..self }
    }

    pub fn with_fan_in_timeout(self, fan_in_timeout: Duration) -> Self {
        Self { fan_in_timeout, ..self }
    }

    pub fn with_resends(self, max_resends: usize, resend_backoff: Duration) -> Self {
        Self { max_resends, resend_backoff, ..self }
    }
}
