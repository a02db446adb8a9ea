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

//! Interfaces towards the rest of the node.
//!
//! The synchronization code doesn't verify blocks, doesn't pick the canonical fork, and
//! doesn't persist anything. All of this is the job of the embedder, which provides
//! implementations of the traits below:
//!
//! - [`BlockStore`] is the block database, consumed as a black-box key-value store.
//! - [`ForkChoice`] is a read-only view of the fork-choice accounting.
//! - [`BlockReceiver`] is the chain-processing layer that downloaded blocks are delivered to.
//! - [`ChainVerifier`] performs the full validation of a single block, and is only invoked by
//!   the gossip admission pipeline.
//! - [`PeerRegistry`] tracks which peers are connected, what chain they advertise, and how
//!   badly they have behaved so far.
//!
//! All implementations are expected to be thread-safe; the synchronization code calls them
//! from multiple tasks concurrently and never holds a lock of its own across such a call.

use std::time::Instant;

use crate::{block::SignedBeaconBlock, network::PeerId};

/// An epoch boundary the fork-choice view declares irreversible, plus the root of the block
/// that seals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub epoch: u64,
    pub root: [u8; 32],
}

/// Slot interval passed to [`BlockStore::blocks_in_range`]. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFilter {
    pub start_slot: u64,
    pub end_slot: u64,
}

/// Access to the blocks database.
pub trait BlockStore {
    /// Returns `true` if a block with the given root is in the store.
    fn has_block(&self, block_root: &[u8; 32]) -> bool;

    /// Returns the block with the given root, or `None` if absent.
    fn block(&self, block_root: &[u8; 32]) -> Result<Option<SignedBeaconBlock>, StoreError>;

    /// Returns every block whose slot lies within the filter, together with its root, in no
    /// guaranteed order. Forked blocks at the same slot are all returned.
    fn blocks_in_range(
        &self,
        filter: &BlockFilter,
    ) -> Result<Vec<(SignedBeaconBlock, [u8; 32])>, StoreError>;

    /// Returns the genesis block, or `None` if the store hasn't been initialized yet.
    fn genesis_block(&self) -> Result<Option<SignedBeaconBlock>, StoreError>;

    /// Inserts a block into the store.
    fn save_block(&self, block: SignedBeaconBlock) -> Result<(), StoreError>;

    /// Records which root is the genesis block's.
    fn save_genesis_block_root(&self, block_root: [u8; 32]) -> Result<(), StoreError>;
}

/// Error potentially returned by [`BlockStore`] operations.
#[derive(Debug, derive_more::Display)]
pub enum StoreError {
    /// Error while accessing the underlying database.
    #[display(fmt = "Error accessing the database: {}", _0)]
    Access(String),
    /// The database contains an entry that doesn't decode to a valid block.
    #[display(fmt = "Corrupted database entry: {}", _0)]
    Corrupted(String),
}

/// Read-only view of the fork-choice accounting.
pub trait ForkChoice {
    /// Returns `true` if the block with the given root is on the chain selected by fork
    /// choice.
    fn is_canonical(&self, block_root: &[u8; 32]) -> bool;

    /// Returns the latest finalized checkpoint.
    fn finalized_checkpoint(&self) -> Checkpoint;

    /// Returns the slot of the current head block.
    fn head_slot(&self) -> u64;

    /// Returns the root of the current head block.
    fn head_root(&self) -> [u8; 32];

    /// Returns the current wall-clock slot.
    fn current_slot(&self) -> u64;
}

/// Chain-processing layer that validated downloads are delivered to.
pub trait BlockReceiver {
    /// Hands over a single block for processing.
    fn receive_block(&self, block: SignedBeaconBlock, block_root: [u8; 32]);

    /// Hands over a batch of blocks, in increasing slot order, for processing.
    fn receive_block_batch(&self, blocks: Vec<(SignedBeaconBlock, [u8; 32])>);
}

/// Full validation of a single block, delegated by the gossip admission pipeline.
pub trait ChainVerifier {
    /// Checks that the block descends from the finalized checkpoint through known blocks.
    fn verify_descendant(
        &self,
        block: &SignedBeaconBlock,
        block_root: &[u8; 32],
    ) -> Result<(), VerifyFailure>;

    /// Checks the proposer signature of the block.
    fn verify_signature(&self, block: &SignedBeaconBlock) -> Result<(), VerifyFailure>;

    /// Recomputes the index of the validator expected to propose at the given slot.
    fn expected_proposer(&self, slot: u64) -> Result<u64, VerifyFailure>;
}

/// Outcome of a failed [`ChainVerifier`] operation.
///
/// The distinction matters to the caller: a block that failed verification is recorded as bad
/// and never looked at again, while a verification that was merely interrupted leaves the
/// block's reputation untouched.
#[derive(Debug, derive_more::Display)]
pub enum VerifyFailure {
    /// The block is invalid.
    #[display(fmt = "Invalid block: {}", _0)]
    Invalid(String),
    /// Verification was interrupted before reaching a verdict, for example because the node
    /// is shutting down. Not the block's fault.
    Interrupted,
}

/// What a peer last advertised about its own chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChainState {
    /// Latest epoch the peer reports as finalized.
    pub finalized_epoch: u64,
    /// Root of the block sealing [`PeerChainState::finalized_epoch`].
    pub finalized_root: [u8; 32],
    /// Slot of the peer's head block.
    pub head_slot: u64,
    /// Root of the peer's head block.
    pub head_root: [u8; 32],
    /// Identifier of the fork the peer is following.
    pub fork_digest: [u8; 4],
}

/// View of the set of connected peers, their advertised chain state, and their health.
pub trait PeerRegistry {
    /// Returns the list of currently connected peers.
    fn connected(&self) -> Vec<PeerId>;

    /// Returns the chain state the peer advertised in its last status exchange, or `None` if
    /// the exchange hasn't happened yet.
    fn chain_state(&self, peer: &PeerId) -> Option<PeerChainState>;

    /// Returns `true` if the peer's score has sunk past the point where it should no longer
    /// be used.
    fn is_bad(&self, peer: &PeerId) -> bool;

    /// Forbids dialing the peer again before the given instant.
    fn set_next_valid_time(&self, peer: &PeerId, when: Instant);

    /// Returns up to `max_peers` peers whose advertised head is ahead of the given epoch,
    /// best head first.
    fn best_non_finalized(&self, max_peers: usize, epoch: u64) -> Vec<PeerId>;

    /// Records that the peer sent a response that violates the protocol.
    fn report_bad_response(&self, peer: &PeerId);

    /// Number of bad responses recorded against the peer so far.
    fn bad_response_count(&self, peer: &PeerId) -> u32;

    /// Credits the peer for successfully serving `count` blocks.
    fn report_blocks_provided(&self, peer: &PeerId, count: u64);
}

/// Number of bad responses past which [`PeerRegistry::is_bad`] is expected to hold.
///
/// The registry owns the actual scoring math; this constant is the threshold the
/// synchronization code assumes when deciding whether penalizing a peer once more is going to
/// disconnect it.
pub const MAX_BAD_RESPONSES: u32 = 5;
