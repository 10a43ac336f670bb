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

//! Shard table, key placement and membership view.

use std::fmt::{self, Debug, Formatter};

use smallvec::SmallVec;

pub type ShardId = u32;

const WORD_BITS: u32 = u64::BITS;

/// Set of shards as a bitmap over indexes of the fixed shard table.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ShardBitmap {
    words: SmallVec<[u64; 2]>,
}

impl ShardBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words(words: impl IntoIterator<Item = u64>) -> Self {
        let mut bitmap = Self { words: words.into_iter().collect() };
        bitmap.trim();
        bitmap
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    /// Adds shard, returns whether it was absent.
    pub fn insert(&mut self, shard: ShardId) -> bool {
        let (word, bit) = ((shard / WORD_BITS) as usize, shard % WORD_BITS);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let absent = self.words[word] & mask == 0;
        self.words[word] |= mask;
        absent
    }

    pub fn remove(&mut self, shard: ShardId) -> bool {
        let (word, bit) = ((shard / WORD_BITS) as usize, shard % WORD_BITS);
        let Some(bits) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1u64 << bit;
        let present = *bits & mask != 0;
        *bits &= !mask;
        self.trim();
        present
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        let (word, bit) = ((shard / WORD_BITS) as usize, shard % WORD_BITS);
        self.words.get(word).map(|bits| bits & (1u64 << bit) != 0).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|bits| bits.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn first(&self) -> Option<ShardId> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, bits)| {
            let base = i as u32 * WORD_BITS;
            let mut bits = *bits;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                Some(base + bit)
            })
        })
    }
}

impl FromIterator<ShardId> for ShardBitmap {
    fn from_iter<T: IntoIterator<Item = ShardId>>(iter: T) -> Self {
        let mut bitmap = Self::new();
        iter.into_iter().for_each(|shard| {
            bitmap.insert(shard);
        });
        bitmap
    }
}

impl Debug for ShardBitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Fixed shard table: maps keys to shards and shards to fault domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    shards: u32,
    domain_width: u32,
}

impl Placement {
    pub fn new(shards: u32, domain_width: u32) -> Self {
        Self { shards: shards.max(1), domain_width: domain_width.max(1) }
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    pub fn all(&self) -> ShardBitmap {
        (0..self.shards).collect()
    }

    /// Locates shard of given key with FNV-1a so placement is stable across processes.
    pub fn locate(&self, key: &[u8]) -> ShardId {
        let mut hash = 0xcbf29ce484222325u64;
        for byte in key {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.shards as u64) as ShardId
    }

    pub fn fault_domain(&self, shard: ShardId) -> u32 {
        shard / self.domain_width
    }

    pub fn spans_fault_domains(&self, shards: &ShardBitmap) -> bool {
        let mut domains = shards.iter().map(|shard| self.fault_domain(shard));
        match domains.next() {
            None => false,
            Some(first) => domains.any(|domain| domain != first),
        }
    }
}

/// Versioned view of which shards are excluded from the container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Membership {
    pub version: u64,
    pub down: ShardBitmap,
}

impl Membership {
    pub fn is_up(&self, shard: ShardId) -> bool {
        !self.down.contains(shard)
    }

    /// Leader of a transaction is its lowest participant that is still a member.
    pub fn leader_of(&self, participants: &ShardBitmap) -> Option<ShardId> {
        participants.iter().find(|shard| self.is_up(*shard))
    }

    pub fn exclude(&self, shard: ShardId) -> Self {
        let mut down = self.down.clone();
        down.insert(shard);
        Self { version: self.version + 1, down }
    }

    pub fn reintegrate(&self, shard: ShardId) -> Self {
        let mut down = self.down.clone();
        down.remove(shard);
        Self { version: self.version + 1, down }
    }
}
