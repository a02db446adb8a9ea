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

//! Beacon block data model.
//!
//! A block is an immutable, content-addressable record. The synchronization code only ever
//! reads four pieces of information out of it: the slot the block was proposed in, the index
//! of its proposer, the root of its parent, and its own root. Everything else, in particular
//! the consensus payload, is treated as an opaque sequence of bytes and handed untouched to
//! the chain-processing layer.
//!
//! # Block identity
//!
//! The identity of a block is its *root*: the SHA-256 digest of the canonical encoding of the
//! unsigned block. The signature is deliberately not part of the digest, so that the same
//! block signed twice (which the protocol forbids, but remotes can do anyway) keeps a single
//! identity.

use core::fmt;

use sha2::{Digest as _, Sha256};

use crate::informant::HashDisplay;

/// Number of slots in one epoch. Finalization decisions always happen on epoch boundaries.
pub const SLOTS_PER_EPOCH: u64 = 32;

/// Wall-clock duration of one slot, in seconds.
pub const SECONDS_PER_SLOT: u64 = 12;

/// Returns the epoch the given slot belongs to.
pub fn slot_to_epoch(slot: u64) -> u64 {
    slot / SLOTS_PER_EPOCH
}

/// Returns the first slot of the given epoch.
pub fn epoch_start_slot(epoch: u64) -> u64 {
    epoch * SLOTS_PER_EPOCH
}

/// Returns the smallest epoch boundary slot at or above `slot`.
pub fn next_epoch_boundary(slot: u64) -> u64 {
    if slot % SLOTS_PER_EPOCH == 0 {
        slot
    } else {
        (slot_to_epoch(slot) + 1) * SLOTS_PER_EPOCH
    }
}

/// Unsigned block content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconBlock {
    /// Slot the block was proposed in. Strictly superior to the slot of its parent.
    pub slot: u64,

    /// Index of the validator that proposed the block.
    pub proposer_index: u64,

    /// Root of the parent block.
    pub parent_root: [u8; 32],

    /// Root of the post-state of the block. Carried through but never interpreted.
    pub state_root: [u8; 32],

    /// Opaque consensus payload.
    pub body: Vec<u8>,
}

/// A block plus the signature of its proposer.
///
/// > **Note**: Assuming that this block comes from the network, nothing in this struct has
/// >           been verified and none of it can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBeaconBlock {
    /// The block itself.
    pub message: BeaconBlock,

    /// Signature of the proposer over the root of [`SignedBeaconBlock::message`]. Verifying
    /// it is the job of the chain-processing layer, not of this library.
    pub signature: [u8; 96],
}

impl BeaconBlock {
    /// Computes the root of the block.
    ///
    /// This is a somewhat expensive operation (`O(n)` in the size of the body). Callers that
    /// need the root more than once are expected to keep it around.
    pub fn root(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.slot.to_le_bytes());
        hasher.update(self.proposer_index.to_le_bytes());
        hasher.update(self.parent_root);
        hasher.update(self.state_root);
        hasher.update((u64::try_from(self.body.len()).unwrap()).to_le_bytes());
        hasher.update(&self.body);
        hasher.finalize().into()
    }
}

impl SignedBeaconBlock {
    /// Shortcut for the root of the inner block. See [`BeaconBlock::root`].
    pub fn block_root(&self) -> [u8; 32] {
        self.message.root()
    }

    /// Shortcut for the slot of the inner block.
    pub fn slot(&self) -> u64 {
        self.message.slot
    }

    /// Shortcut for the parent root of the inner block.
    pub fn parent_root(&self) -> [u8; 32] {
        self.message.parent_root
    }
}

impl fmt::Display for SignedBeaconBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "block(slot={}, root={})",
            self.message.slot,
            HashDisplay(&self.block_root())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{BeaconBlock, SignedBeaconBlock};

    fn dummy_block(slot: u64) -> SignedBeaconBlock {
        SignedBeaconBlock {
            message: BeaconBlock {
                slot,
                proposer_index: slot % 64,
                parent_root: [0; 32],
                state_root: [0; 32],
                body: vec![1, 2, 3],
            },
            signature: [0; 96],
        }
    }

    #[test]
    fn epoch_math() {
        assert_eq!(super::slot_to_epoch(0), 0);
        assert_eq!(super::slot_to_epoch(31), 0);
        assert_eq!(super::slot_to_epoch(32), 1);
        assert_eq!(super::epoch_start_slot(8), 256);
        assert_eq!(super::next_epoch_boundary(256), 256);
        assert_eq!(super::next_epoch_boundary(251), 256);
        assert_eq!(super::next_epoch_boundary(1), 32);
    }

    #[test]
    fn root_ignores_signature() {
        let mut block = dummy_block(5);
        let root_before = block.block_root();
        block.signature = [0xff; 96];
        assert_eq!(block.block_root(), root_before);
    }

    #[test]
    fn root_commits_to_every_field() {
        let reference = dummy_block(5);

        let mut changed = reference.clone();
        changed.message.slot = 6;
        assert_ne!(changed.block_root(), reference.block_root());

        let mut changed = reference.clone();
        changed.message.proposer_index += 1;
        assert_ne!(changed.block_root(), reference.block_root());

        let mut changed = reference.clone();
        changed.message.parent_root = [1; 32];
        assert_ne!(changed.block_root(), reference.block_root());

        let mut changed = reference.clone();
        changed.message.body.push(4);
        assert_ne!(changed.block_root(), reference.block_root());
    }
}
