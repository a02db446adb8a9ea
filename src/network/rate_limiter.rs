// Lodestone
// Copyright (C) 2019-2022  Parity Technologies (UK) Ltd.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Per-peer, per-topic admission control for inbound requests.
//!
//! Each topic (in practice: each request-response protocol) owns one leaky bucket per peer.
//! A bucket holds at most `capacity` tokens and refills at a constant `rate` of tokens per
//! second. Serving a request costs a number of tokens proportional to the work requested;
//! when a peer's bucket can't cover the cost, the request is refused with a rate-limited
//! error and the peer is expected to back off.
//!
//! Time is passed in explicitly by the caller rather than read from the system clock, so
//! that the exact refill behavior can be exercised in tests.

use std::time::Instant;

use hashbrown::HashMap;

use super::PeerId;
use crate::util::SipHasherBuild;

/// Collection of leaky buckets, one per `(topic, peer)` pair.
pub struct RateLimiter {
    topics: HashMap<&'static str, Topic, fnv::FnvBuildHasher>,
    /// Seed for the hasher of each topic's peer map.
    randomness_seed: [u8; 16],
}

struct Topic {
    /// Tokens refilled per second.
    rate: u64,
    /// Maximum tokens a bucket can hold.
    capacity: u64,
    /// One bucket per peer that has recently been served.
    ///
    /// Keys are chosen by remotes, hence the keyed hasher.
    peers: HashMap<PeerId, Bucket, SipHasherBuild>,
}

struct Bucket {
    remaining: u64,
    last_refill: Instant,
}

impl Bucket {
    /// Credits the bucket with the tokens accumulated since the last refill.
    fn refill(&mut self, rate: u64, capacity: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let tokens = u64::try_from(u128::from(rate) * elapsed.as_millis() / 1000)
            .unwrap_or(u64::max_value());
        if tokens > 0 {
            self.remaining = self.remaining.saturating_add(tokens).min(capacity);
            self.last_refill = now;
        }
    }
}

/// Error returned by [`RateLimiter::validate`] when a peer's bucket can't cover the cost of
/// its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "peer exceeded its rate allowance")]
pub struct RateLimited;

impl RateLimiter {
    /// Builds a new, empty collection of buckets.
    ///
    /// The seed is used for the hashing of the maps keyed by peer identity.
    pub fn new(randomness_seed: [u8; 16]) -> Self {
        RateLimiter {
            topics: HashMap::with_capacity_and_hasher(4, Default::default()),
            randomness_seed,
        }
    }

    /// Registers a topic with the given refill rate and bucket capacity.
    ///
    /// Has no effect if the topic is already registered.
    pub fn register_topic(&mut self, topic: &'static str, rate: u64, capacity: u64) {
        let seed = self.randomness_seed;
        self.topics.entry(topic).or_insert_with(|| Topic {
            rate,
            capacity,
            peers: HashMap::with_capacity_and_hasher(32, SipHasherBuild::new(seed)),
        });
    }

    /// Returns how many tokens the peer's bucket holds right now.
    ///
    /// # Panic
    ///
    /// Panics if the topic hasn't been registered.
    ///
    pub fn remaining(&mut self, topic: &str, peer: &PeerId, now: Instant) -> u64 {
        let topic = self.topics.get_mut(topic).unwrap();
        match topic.peers.get_mut(peer) {
            Some(bucket) => {
                bucket.refill(topic.rate, topic.capacity, now);
                bucket.remaining
            }
            None => topic.capacity,
        }
    }

    /// Checks whether the peer's bucket covers `cost` tokens, without consuming anything.
    ///
    /// # Panic
    ///
    /// Panics if the topic hasn't been registered.
    ///
    pub fn validate(
        &mut self,
        topic: &str,
        peer: &PeerId,
        cost: u64,
        now: Instant,
    ) -> Result<(), RateLimited> {
        if self.remaining(topic, peer, now) < cost {
            return Err(RateLimited);
        }
        Ok(())
    }

    /// Consumes `cost` tokens from the peer's bucket, saturating at zero.
    ///
    /// # Panic
    ///
    /// Panics if the topic hasn't been registered.
    ///
    pub fn add(&mut self, topic: &str, peer: &PeerId, cost: u64, now: Instant) {
        let topic = self.topics.get_mut(topic).unwrap();
        let capacity = topic.capacity;
        let rate = topic.rate;
        let bucket = topic.peers.entry(*peer).or_insert(Bucket {
            remaining: capacity,
            last_refill: now,
        });
        bucket.refill(rate, capacity, now);
        bucket.remaining = bucket.remaining.saturating_sub(cost);
    }

    /// Drops the buckets of peers that have been idle long enough for their bucket to have
    /// refilled entirely. Their state is indistinguishable from a fresh bucket, so nothing
    /// is lost by forgetting them.
    pub fn prune(&mut self, now: Instant) {
        for topic in self.topics.values_mut() {
            let rate = topic.rate;
            let capacity = topic.capacity;
            topic.peers.retain(|_, bucket| {
                bucket.refill(rate, capacity, now);
                bucket.remaining < capacity
            });
        }
    }
}
