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

//! Initial block synchronization.
//!
//! Syncing consists in downloading from remote peers the blocks between the local head and
//! the tip of the chain the network agrees upon, and delivering them to the chain-processing
//! layer *in slot order*. The difficulty is that downloads happen in parallel from peers of
//! varying speed and honesty, while delivery must remain sequential and the set of useful
//! peers keeps changing underneath.
//!
//! The work is split into three layers:
//!
//! - [`machines`] is a fixed-width window of per-range state machines, one per bucket of
//!   [`BLOCKS_PER_REQUEST`] slots. It is plain data: events go in, scheduling decisions come
//!   out, and nothing in it performs I/O or reads clocks, which makes the tricky re-ordering
//!   and recovery logic fully deterministic under test.
//!
//! - [`fetcher`] turns scheduling decisions into actual network requests: it picks a peer
//!   for each range, dials it, runs the blocks-by-range exchange, classifies the outcome,
//!   and pushes the result onto a response channel.
//!
//! - [`queue`] is the event loop that owns both: it applies fetch responses to the window,
//!   emits completed batches in strict slot order on its output channel, detects stale and
//!   skipped ranges, re-arranges the window when it stops making progress, and searches for
//!   an alternative branch when the chain it is following turns out to be a dead end.
//!
//! The [`round_robin`] module contains the driver that repeatedly builds queues until the
//! local head has caught up.

use core::time::Duration;

use crate::block::{SECONDS_PER_SLOT, SLOTS_PER_EPOCH};

pub mod fetcher;
pub mod machines;
pub mod queue;
pub mod round_robin;

#[cfg(test)]
mod testutil;

/// Whether a queue stops at the finalized slot the peer majority agrees upon, or keeps
/// following the chain up to the current wall-clock slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync up to the slot sealing the epoch that most peers report as finalized. Used for
    /// the bulk of initial sync, where everything fetched is known-irreversible.
    StopOnFinalized,
    /// Sync up to the highest slot any peer advertises. Used for the last stretch, once the
    /// finalized targets are exhausted.
    Unconstrained,
}

/// Number of slots covered by one state machine, hence by one blocks-by-range request.
pub const BLOCKS_PER_REQUEST: u64 = 64;

/// Number of state machines in the lookahead window. The effective outstanding request
/// budget is `LOOKAHEAD_STEPS * BLOCKS_PER_REQUEST` slots.
pub const LOOKAHEAD_STEPS: usize = 8;

/// Minimum number of peers able to serve a range before syncing from it is attempted.
pub const MIN_SYNC_PEERS: usize = 3;

/// Number of fruitless window re-arrangements within one epoch before the queue starts
/// looking for an alternative branch.
pub const MAX_RESET_ATTEMPTS: u32 = 4;

/// How long a machine may stay in the sent state before it is considered stale.
pub const STALE_EPOCH_TIMEOUT: Duration =
    Duration::from_secs(SLOTS_PER_EPOCH * SECONDS_PER_SLOT);

/// How long a machine stays skipped before it is given another chance.
pub const SKIPPED_MACHINE_TIMEOUT: Duration =
    Duration::from_secs(SLOTS_PER_EPOCH * SECONDS_PER_SLOT / 2);

/// How often the peer set is re-examined while waiting for enough peers.
pub const HANDSHAKE_POLL: Duration = Duration::from_secs(5);

/// How long a stopping queue waits for its event loop and in-flight fetches to wind down.
pub const CANCEL_GRACE: Duration = Duration::from_secs(3);
