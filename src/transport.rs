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

//! Delivery of sub-operations to shards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::DtxConfig;
use crate::dtx::{Leader, Shard, ShardError, ShardRequest, ShardResponse};
use crate::fault::FaultInjection;
use crate::placement::ShardId;

/// At least once delivery of requests to shards.
///
/// Timeouts surface as [ShardError::Timeout] and are never retried underneath, see
/// [send_with_resend] for retrying with the same transaction id.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, shard: ShardId, request: ShardRequest) -> Result<ShardResponse, ShardError>;
}

/// Transport delivering requests to shards in the same process.
pub struct LocalTransport {
    shards: Vec<Arc<Shard>>,
    config: DtxConfig,
    faults: Arc<FaultInjection>,
}

impl LocalTransport {
    pub fn new(shards: Vec<Arc<Shard>>, config: DtxConfig, faults: Arc<FaultInjection>) -> Self {
        Self { shards, config, faults }
    }

    pub fn shard(&self, id: ShardId) -> Option<&Arc<Shard>> {
        self.shards.get(id as usize)
    }

    async fn handle(&self, shard: &Arc<Shard>, request: ShardRequest) -> Result<ShardResponse, ShardError> {
        let leader = || Leader::new(shard, self, &self.config, &self.faults);
        match request {
            ShardRequest::Coordinate(request) => leader().coordinate(request).await.map(|_| ShardResponse::Done),
            ShardRequest::Cancel { txn_id } => leader().cancel(txn_id).await.map(|_| ShardResponse::Done),
            ShardRequest::Prepare(request) => shard.prepare(&request).await.map(|_| ShardResponse::Done),
            ShardRequest::Commit { txn_id } => shard.commit(txn_id).await.map(|_| ShardResponse::Done),
            ShardRequest::Abort { txn_id, cause } => shard.abort(txn_id, cause).await.map(|_| ShardResponse::Done),
            ShardRequest::Status { txn_id } => Ok(ShardResponse::Status(shard.status(txn_id))),
            ShardRequest::Fetch { key, epoch, reader, membership, record_read } => {
                shard.fetch(&key, epoch, reader, membership, record_read).map(ShardResponse::Value)
            },
            ShardRequest::Enumerate { epoch, reader, membership } => {
                shard.enumerate(epoch, reader, membership).map(ShardResponse::Keys)
            },
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, id: ShardId, request: ShardRequest) -> Result<ShardResponse, ShardError> {
        let shard = match self.shard(id) {
            Some(shard) if shard.is_up() => shard,
            _ => return Err(ShardError::Unreachable { shard: id }),
        };
        let coordinate = matches!(request, ShardRequest::Coordinate(_));
        if coordinate && self.faults.take_lost_request() {
            debug!("drop {} request to shard {}", request.kind(), id);
            return Err(ShardError::Timeout { shard: id });
        }
        if let (ShardRequest::Prepare(_), Some(delay)) = (&request, self.faults.prepare_delay(id)) {
            debug!("hold prepare to shard {} for {:?}", id, delay);
            tokio::time::sleep(delay).await;
        }
        let response = self.handle(shard, request).await;
        if coordinate && self.faults.take_lost_reply() {
            debug!("drop reply from shard {}: {:?}", id, response);
            return Err(ShardError::Timeout { shard: id });
        }
        response
    }
}

/// Sends request and resends it on timeout with backoff.
pub async fn send_with_resend(
    transport: &dyn Transport,
    shard: ShardId,
    request: ShardRequest,
    config: &DtxConfig,
) -> Result<ShardResponse, ShardError> {
    let mut resends = 0;
    loop {
        match transport.send(shard, request.clone()).await {
            Err(ShardError::Timeout { .. }) if resends < config.max_resends => {
                resends += 1;
                let backoff = backoff(config.resend_backoff, resends);
                trace!("resend {} request to shard {} after {:?}", request.kind(), shard, backoff);
                tokio::time::sleep(backoff).await;
            },
            result => return result,
        }
    }
}

fn backoff(base: Duration, resends: usize) -> Duration {
    let millis = base.as_millis() as u64;
    let jitter = match millis {
        0 => 0,
        _ => rand::random::<u64>() % millis,
    };
    base.saturating_mul(resends as u32) + Duration::from_millis(jitter)
}
