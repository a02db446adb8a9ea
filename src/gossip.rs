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

//! Admission of blocks pushed over the gossip overlay.
//!
//! Unlike the blocks obtained through the synchronization queue, gossiped blocks arrive
//! unsolicited, concurrently, and mostly redundantly: every peer relays every block. The
//! admission pipeline classifies each of them as:
//!
//! - [`Classification::Accept`]: relay it further and hand it to the chain-processing
//!   layer.
//! - [`Classification::Reject`]: provably invalid; don't relay, penalize the sender.
//! - [`Classification::Ignore`]: uninteresting (duplicate, too old, too early, or not
//!   decidable right now); don't relay, don't penalize.
//!
//! A block whose parent isn't known locally can't be judged yet: it is parked in a bounded
//! pending queue and re-classified when its parent gets processed, via
//! [`BlockAdmission::drain_pending`].
//!
//! Classification is serialized through a single lock, so that the caches it consults and
//! updates can't change between the lookup and the verdict, however many gossip streams
//! deliver concurrently.

use std::sync::Arc;

use core::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::block::{epoch_start_slot, SignedBeaconBlock, SECONDS_PER_SLOT};
use crate::chain::{BlockStore, ChainVerifier, ForkChoice, VerifyFailure};
use crate::informant::HashDisplay;
use crate::network::protocol;
use crate::util::SipHasherBuild;

/// Tolerated clock difference between the local node and the proposer of a block.
pub const MAX_CLOCK_DISPARITY: Duration = Duration::from_millis(500);

/// Bound on each of the seen/bad/pending caches.
const CACHE_SIZE: usize = 1024;

/// Verdict on one gossiped block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Valid as far as the node can tell; relay and process.
    Accept,
    /// Provably invalid; don't relay, penalize the sender.
    Reject,
    /// Uninteresting or undecidable right now; drop silently.
    Ignore,
}

/// Configuration for a [`BlockAdmission`].
pub struct Config<TStore, TFc, TVerif> {
    /// Blocks database.
    pub store: Arc<TStore>,

    /// Fork-choice view.
    pub fork_choice: Arc<TFc>,

    /// Full block validation, invoked as the last step of admission.
    pub verifier: Arc<TVerif>,

    /// Unix time of the genesis slot, in milliseconds.
    pub genesis_time_millis: u64,

    /// `true` while the node is still performing its initial synchronization. Gossip is
    /// ignored during that phase; the queue is a much cheaper way to get the same blocks.
    pub syncing: Arc<dyn Fn() -> bool + Send + Sync>,

    /// Seed for the hashing of the caches, whose keys are attacker-controlled.
    pub randomness_seed: [u8; 16],
}

/// Classifier of gossiped blocks. See the module documentation.
pub struct BlockAdmission<TStore, TFc, TVerif> {
    store: Arc<TStore>,
    fork_choice: Arc<TFc>,
    verifier: Arc<TVerif>,
    genesis_time_millis: u64,
    syncing: Arc<dyn Fn() -> bool + Send + Sync>,

    /// `(slot, proposer_index)` pairs already observed. A second block for the same pair is
    /// a duplicate (or an equivocation, which is for the slashing machinery to prove, not
    /// for gossip to relay).
    seen_blocks: Mutex<LruCache<(u64, u64), (), SipHasherBuild>>,

    /// Roots of blocks known to be invalid, so that their descendants are rejected without
    /// re-running verification.
    bad_blocks: Mutex<LruCache<[u8; 32], (), SipHasherBuild>>,

    /// Blocks whose parent isn't known yet, keyed by their root.
    pending_blocks: Mutex<LruCache<[u8; 32], SignedBeaconBlock, SipHasherBuild>>,

    /// Serializes classification, making cache updates atomic with the verdict.
    validate_lock: Mutex<()>,
}

impl<TStore, TFc, TVerif> BlockAdmission<TStore, TFc, TVerif>
where
    TStore: BlockStore,
    TFc: ForkChoice,
    TVerif: ChainVerifier,
{
    /// Builds a new classifier.
    pub fn new(config: Config<TStore, TFc, TVerif>) -> Self {
        let hasher = |seed: [u8; 16]| SipHasherBuild::new(seed);
        BlockAdmission {
            store: config.store,
            fork_choice: config.fork_choice,
            verifier: config.verifier,
            genesis_time_millis: config.genesis_time_millis,
            syncing: config.syncing,
            seen_blocks: Mutex::new(LruCache::with_hasher(
                CACHE_SIZE,
                hasher(config.randomness_seed),
            )),
            bad_blocks: Mutex::new(LruCache::with_hasher(
                CACHE_SIZE,
                hasher(config.randomness_seed),
            )),
            pending_blocks: Mutex::new(LruCache::with_hasher(
                CACHE_SIZE,
                hasher(config.randomness_seed),
            )),
            validate_lock: Mutex::new(()),
        }
    }

    /// Classifies one inbound gossip message.
    ///
    /// `own_message` is `true` when the message is the local node's own publication coming
    /// back; those are accepted without inspection. `now_millis` is the local Unix time in
    /// milliseconds.
    pub fn classify(
        &self,
        payload: &[u8],
        own_message: bool,
        now_millis: u64,
    ) -> Classification {
        if own_message {
            return Classification::Accept;
        }

        if (self.syncing)() {
            return Classification::Ignore;
        }

        let block = match protocol::decode_signed_block(payload) {
            Ok(block) if !block.message.body.is_empty() => block,
            _ => return Classification::Reject,
        };

        let _guard = self.validate_lock.lock();
        self.classify_block(&block, now_millis)
    }

    /// Re-classifies the pending blocks whose parent is the block that was just
    /// successfully processed. Returns them along with their new verdict; accepted ones
    /// are for the caller to process, which may in turn unlock further pending blocks.
    pub fn drain_pending(
        &self,
        processed_root: &[u8; 32],
        now_millis: u64,
    ) -> Vec<(SignedBeaconBlock, Classification)> {
        let dependents = {
            let mut pending = self.pending_blocks.lock();
            let roots = pending
                .iter()
                .filter(|(_, block)| block.parent_root() == *processed_root)
                .map(|(root, _)| *root)
                .collect::<Vec<_>>();
            roots
                .into_iter()
                .filter_map(|root| pending.pop(&root))
                .collect::<Vec<_>>()
        };

        let _guard = self.validate_lock.lock();
        dependents
            .into_iter()
            .map(|block| {
                let verdict = self.classify_block(&block, now_millis);
                (block, verdict)
            })
            .collect()
    }

    /// Steps of the pipeline that operate on a decoded block. The caller holds the
    /// validation lock.
    fn classify_block(&self, block: &SignedBeaconBlock, now_millis: u64) -> Classification {
        let slot = block.slot();
        let proposer_index = block.message.proposer_index;
        let block_root = block.block_root();

        if self
            .seen_blocks
            .lock()
            .contains(&(slot, proposer_index))
        {
            return Classification::Ignore;
        }

        if self.store.has_block(&block_root) {
            return Classification::Ignore;
        }

        if self.bad_blocks.lock().contains(&block.parent_root()) {
            // Guilt by ancestry: a descendant of an invalid block is invalid.
            self.bad_blocks.lock().put(block_root, ());
            return Classification::Reject;
        }

        // A block from a slot whose wall-clock time hasn't come yet (modulo clock
        // disparity), or from a slot at or below finalization, is dropped without
        // prejudice.
        let block_time_millis = self
            .genesis_time_millis
            .saturating_add(slot.saturating_mul(SECONDS_PER_SLOT * 1000));
        let disparity = u64::try_from(MAX_CLOCK_DISPARITY.as_millis()).unwrap();
        if block_time_millis > now_millis.saturating_add(disparity) {
            return Classification::Ignore;
        }
        let finalized_slot = epoch_start_slot(self.fork_choice.finalized_checkpoint().epoch);
        if slot <= finalized_slot {
            return Classification::Ignore;
        }

        if !self.store.has_block(&block.parent_root()) {
            tracing::debug!(
                block_root = %HashDisplay(&block_root),
                parent_root = %HashDisplay(&block.parent_root()),
                "gossip-block-parked"
            );
            self.pending_blocks.lock().put(block_root, block.clone());
            return Classification::Ignore;
        }

        match self.verify(block, &block_root) {
            Ok(()) => {
                self.seen_blocks.lock().put((slot, proposer_index), ());
                Classification::Accept
            }
            Err(VerifyFailure::Interrupted) => {
                // Not the block's fault; leave its reputation untouched.
                Classification::Ignore
            }
            Err(VerifyFailure::Invalid(reason)) => {
                tracing::debug!(
                    block_root = %HashDisplay(&block_root),
                    %reason,
                    "gossip-block-invalid"
                );
                self.bad_blocks.lock().put(block_root, ());
                Classification::Reject
            }
        }
    }

    /// Full validation: ancestry, signature, and proposer recomputation.
    fn verify(
        &self,
        block: &SignedBeaconBlock,
        block_root: &[u8; 32],
    ) -> Result<(), VerifyFailure> {
        self.verifier.verify_descendant(block, block_root)?;
        self.verifier.verify_signature(block)?;
        let expected = self.verifier.expected_proposer(block.slot())?;
        if expected != block.message.proposer_index {
            return Err(VerifyFailure::Invalid(format!(
                "proposer index {} isn't the expected {}",
                block.message.proposer_index, expected
            )));
        }
        Ok(())
    }
}
