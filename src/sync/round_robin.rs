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

//! Driver of the initial synchronization.
//!
//! The driver repeatedly builds a [`BlocksQueue`] and forwards every batch it emits to the
//! chain-processing layer, in rounds:
//!
//! 1. Wait until enough peers are connected and have exchanged their chain state.
//! 2. If the slot sealing the peer-majority finalized epoch is ahead of the local head,
//!    run a queue in [`SyncMode::StopOnFinalized`] towards it: everything downloaded in
//!    this round is known-irreversible.
//! 3. Otherwise, if the local head is still behind the current wall-clock slot, run a
//!    queue in [`SyncMode::Unconstrained`] towards the wall clock.
//! 4. Otherwise, the node is synced; the driver publishes that and returns.
//!
//! The anchor of each round is normally the local head plus one. The exception is an
//! *orphaned head*: when the head block's parent isn't in the store (the head sits on a
//! fork whose history the store is missing), starting above it would leave the gap in
//! place. In that case the round starts right above the last finalized slot instead, so
//! that the missing history is downloaded and the fork healed.
//!
//! Failures are contained: a round that ends without progress is simply followed by
//! another one after a short pause. The only way out of the loop is to reach the wall
//! clock.

use core::pin::Pin;
use std::sync::Arc;

use futures::prelude::*;
use futures_timer::Delay;

use super::fetcher::{best_finalized_epoch, best_head_slot, num_peers_serving};
use super::queue::{self, BlocksQueue};
use super::{SyncMode, BLOCKS_PER_REQUEST, HANDSHAKE_POLL, LOOKAHEAD_STEPS, MIN_SYNC_PEERS};
use crate::block::epoch_start_slot;
use crate::chain::{BlockReceiver, BlockStore, ForkChoice, PeerRegistry};
use crate::informant::HashDisplay;
use crate::network::StreamDialer;

/// Configuration for a [`RoundRobinSync`].
pub struct Config<TDialer, TReg, TStore, TFc, TRecv> {
    /// Closure that spawns background tasks.
    pub tasks_executor: Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>,

    /// Access to the transport layer.
    pub dialer: TDialer,

    /// View of the connected peers.
    pub peers: Arc<TReg>,

    /// Blocks database.
    pub store: Arc<TStore>,

    /// Fork-choice view.
    pub fork_choice: Arc<TFc>,

    /// Chain-processing layer that downloaded batches are delivered to.
    pub receiver: Arc<TRecv>,
}

/// Cheap snapshot of the synchronization progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// Slot of the local head at the last update.
    pub head_slot: u64,
    /// Slot the current round is syncing towards.
    pub target_slot: u64,
    /// `true` once the local head has reached the wall clock.
    pub synced: bool,
}

/// Driver of the initial synchronization. See the module documentation.
pub struct RoundRobinSync<TDialer, TReg, TStore, TFc, TRecv> {
    tasks_executor:
        Arc<parking_lot::Mutex<Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>>>,
    dialer: Arc<TDialer>,
    peers: Arc<TReg>,
    store: Arc<TStore>,
    fork_choice: Arc<TFc>,
    receiver: Arc<TRecv>,
    status: Arc<parking_lot::Mutex<SyncStatus>>,
}

impl<TDialer, TReg, TStore, TFc, TRecv> RoundRobinSync<TDialer, TReg, TStore, TFc, TRecv>
where
    TDialer: StreamDialer,
    TReg: PeerRegistry + Send + Sync + 'static,
    TStore: BlockStore + Send + Sync + 'static,
    TFc: ForkChoice + Send + Sync + 'static,
    TRecv: BlockReceiver + Send + Sync + 'static,
{
    /// Builds a new driver. Call [`RoundRobinSync::run`] to start it.
    pub fn new(config: Config<TDialer, TReg, TStore, TFc, TRecv>) -> Self {
        let head_slot = config.fork_choice.head_slot();
        RoundRobinSync {
            tasks_executor: Arc::new(parking_lot::Mutex::new(config.tasks_executor)),
            dialer: Arc::new(config.dialer),
            peers: config.peers,
            store: config.store,
            fork_choice: config.fork_choice,
            receiver: config.receiver,
            status: Arc::new(parking_lot::Mutex::new(SyncStatus {
                head_slot,
                target_slot: head_slot,
                synced: false,
            })),
        }
    }

    /// Returns a handle that observes the progress of the synchronization, usable from any
    /// task.
    pub fn status_handle(&self) -> Arc<parking_lot::Mutex<SyncStatus>> {
        self.status.clone()
    }

    /// Current progress snapshot.
    pub fn status(&self) -> SyncStatus {
        *self.status.lock()
    }

    /// Runs rounds of synchronization until the local head reaches the current wall-clock
    /// slot.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn run(mut self) {
        loop {
            let head_slot = self.fork_choice.head_slot();
            let current_slot = self.fork_choice.current_slot();

            if head_slot >= current_slot {
                let mut status = self.status.lock();
                status.head_slot = head_slot;
                status.target_slot = head_slot;
                status.synced = true;
                tracing::debug!(head_slot, "round-robin-synced");
                return;
            }

            self.wait_for_peers().await;

            let finalized_target = epoch_start_slot(best_finalized_epoch(&*self.peers));
            let (mode, target) = if finalized_target > head_slot {
                (SyncMode::StopOnFinalized, finalized_target)
            } else {
                (
                    SyncMode::Unconstrained,
                    core::cmp::min(best_head_slot(&*self.peers), current_slot)
                        .max(head_slot + 1),
                )
            };

            let start_slot = self.round_anchor(head_slot);

            {
                let mut status = self.status.lock();
                status.head_slot = head_slot;
                status.target_slot = target;
            }

            tracing::debug!(
                start_slot,
                target,
                ?mode,
                "round-robin-round-started"
            );

            let queue_executor: Box<
                dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send,
            > = {
                let tasks_executor = self.tasks_executor.clone();
                Box::new(move |future| (*tasks_executor.lock())(future))
            };

            let mut queue = BlocksQueue::new(queue::Config {
                tasks_executor: queue_executor,
                dialer: self.dialer.clone(),
                peers: self.peers.clone(),
                store: self.store.clone(),
                fork_choice: self.fork_choice.clone(),
                mode,
                start_slot,
                highest_expected_slot: target,
                lookahead_steps: LOOKAHEAD_STEPS,
                blocks_per_request: BLOCKS_PER_REQUEST,
                stale_epoch_timeout: super::STALE_EPOCH_TIMEOUT,
                skipped_machine_timeout: super::SKIPPED_MACHINE_TIMEOUT,
            });

            while let Some(batch) = queue.next_batch().await {
                let blocks = batch
                    .blocks
                    .into_iter()
                    .map(|block| {
                        let root = block.block_root();
                        (block, root)
                    })
                    .collect::<Vec<_>>();
                self.receiver.receive_block_batch(blocks);
                self.status.lock().head_slot = self.fork_choice.head_slot();
            }

            // A round that made no progress is retried after a pause rather than
            // immediately, typically because the peer set hasn't caught up yet.
            if self.fork_choice.head_slot() == head_slot {
                tracing::debug!(head_slot, "round-robin-no-progress");
                Delay::new(HANDSHAKE_POLL).await;
            }
        }
    }

    /// Waits until enough usable peers able to serve the next slot are connected.
    async fn wait_for_peers(&mut self) {
        loop {
            let next_slot = self.fork_choice.head_slot() + 1;
            if num_peers_serving(&*self.peers, next_slot) >= MIN_SYNC_PEERS {
                return;
            }
            tracing::debug!(next_slot, "round-robin-waiting-for-peers");
            Delay::new(HANDSHAKE_POLL).await;
        }
    }

    /// First slot the next round should download.
    ///
    /// Normally right above the local head; right above the last finalized slot when the
    /// head is an orphan whose parent the store is missing.
    fn round_anchor(&self, head_slot: u64) -> u64 {
        let head_root = self.fork_choice.head_root();
        let orphaned = match self.store.block(&head_root) {
            Ok(Some(block)) => {
                block.slot() != 0 && !self.store.has_block(&block.parent_root())
            }
            Ok(None) => false,
            Err(_) => false,
        };

        if orphaned {
            let finalized_slot =
                epoch_start_slot(self.fork_choice.finalized_checkpoint().epoch);
            tracing::warn!(
                head_root = %HashDisplay(&head_root),
                finalized_slot,
                "round-robin-orphaned-head"
            );
            finalized_slot + 1
        } else {
            head_slot + 1
        }
    }
}
