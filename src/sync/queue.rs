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

//! Lookahead queue of block downloads.
//!
//! A [`BlocksQueue`] owns a window of per-range state machines (see
//! [`crate::sync::machines`]) and a [`crate::sync::fetcher::BlocksFetcher`], and runs a
//! single event loop that connects them: scheduling decisions flow from the window to the
//! fetcher, responses flow back and are applied to the window, and completed batches leave
//! on the queue's output channel in strict slot order.
//!
//! The event loop is also in charge of the unhappy paths:
//!
//! - Responses that violate the protocol have already cost the peer reputation in the
//!   fetcher; the range is simply re-requested, most likely from somebody else.
//! - A peer that advertised slots it cannot serve causes the *previous* range to be
//!   re-requested, so that the boundary it straddles is covered again.
//! - When every range in the window has been skipped, the window is re-arranged anchored
//!   just above the local head, and the sync target is recomputed.
//! - When re-arrangements within one epoch stop producing progress
//!   ([`crate::sync::MAX_RESET_ATTEMPTS`] times), the queue walks the connected peers
//!   looking for an alternative branch forking off a known block, and seeds the window with
//!   the first diverging range it finds.
//!
//! Dropping the queue, or calling [`BlocksQueue::stop`], cancels the event loop and every
//! in-flight fetch.

use core::pin::Pin;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use futures::{
    channel::{mpsc, oneshot},
    prelude::*,
};
use futures_timer::Delay;
use hashbrown::HashMap;

use super::fetcher::{BlocksFetcher, FetchFailure, FetchOutcome, FetchResponse};
use super::machines::{MachineGrid, SkippedOutcome};
use super::{SyncMode, CANCEL_GRACE, HANDSHAKE_POLL, MAX_RESET_ATTEMPTS, MIN_SYNC_PEERS};
use crate::block::{epoch_start_slot, next_epoch_boundary, slot_to_epoch};
use crate::chain::{BlockStore, ForkChoice, PeerRegistry};
use crate::network::protocol::BlocksByRangeRequest;
use crate::network::StreamDialer;

pub use super::machines::BlockBatch;

/// How often the event loop performs housekeeping when no response arrives.
const TICK: Duration = Duration::from_millis(500);

/// Configuration for a [`BlocksQueue`].
pub struct Config<TDialer, TReg, TStore, TFc> {
    /// Closure that spawns background tasks.
    pub tasks_executor: Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>,

    /// Access to the transport layer.
    pub dialer: TDialer,

    /// View of the connected peers.
    pub peers: Arc<TReg>,

    /// Blocks database, used by the alternative-branch search to recognize known blocks.
    pub store: Arc<TStore>,

    /// Fork-choice view, used to follow the local head.
    pub fork_choice: Arc<TFc>,

    /// Whether to stop at the peer-majority finalized slot or to keep going.
    pub mode: SyncMode,

    /// First slot to download. Usually the local head slot plus one.
    pub start_slot: u64,

    /// Last slot worth downloading. The queue finishes once the whole window lies beyond
    /// it. Re-arrangements recompute it.
    pub highest_expected_slot: u64,

    /// Number of machines in the window.
    pub lookahead_steps: usize,

    /// Number of slots covered by each machine.
    pub blocks_per_request: u64,

    /// How long an emitted range may stay unprocessed before being re-requested.
    /// [`crate::sync::STALE_EPOCH_TIMEOUT`] unless there is a reason to deviate.
    pub stale_epoch_timeout: Duration,

    /// How long a skipped range waits before being given another chance.
    /// [`crate::sync::SKIPPED_MACHINE_TIMEOUT`] unless there is a reason to deviate.
    pub skipped_machine_timeout: Duration,
}

/// Error potentially returned by [`BlocksQueue::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StopError {
    /// The queue has already been stopped; it cannot be restarted.
    AlreadyStopped,
    /// The event loop didn't acknowledge the stop within the shutdown budget. In-flight
    /// fetches are abandoned; their results will be discarded on arrival.
    TookTooLong,
}

/// Handle to a running queue. See the module documentation.
pub struct BlocksQueue {
    results_rx: mpsc::Receiver<BlockBatch>,
    stop_tx: Option<oneshot::Sender<()>>,
    stopped_rx: Option<oneshot::Receiver<()>>,
}

impl BlocksQueue {
    /// Builds a new queue and spawns its event loop through the configured executor.
    pub fn new<TDialer, TReg, TStore, TFc>(mut config: Config<TDialer, TReg, TStore, TFc>) -> Self
    where
        TDialer: StreamDialer,
        TReg: PeerRegistry + Send + Sync + 'static,
        TStore: BlockStore + Send + Sync + 'static,
        TFc: ForkChoice + Send + Sync + 'static,
    {
        // In finalized mode the target is always an epoch boundary, whatever the caller
        // asked for.
        if matches!(config.mode, SyncMode::StopOnFinalized) {
            config.highest_expected_slot = next_epoch_boundary(config.highest_expected_slot);
        }

        let (results_tx, results_rx) = mpsc::channel(config.lookahead_steps);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        // The executor closure is shared between the fetcher (which spawns one task per
        // outbound request) and the queue itself (which spawns the event loop).
        let tasks_executor = Arc::new(parking_lot::Mutex::new(config.tasks_executor));
        let fetcher_executor: Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send> = {
            let tasks_executor = tasks_executor.clone();
            Box::new(move |future| (*tasks_executor.lock())(future))
        };

        let (fetcher, responses_rx) = BlocksFetcher::new(super::fetcher::Config {
            tasks_executor: fetcher_executor,
            dialer: config.dialer,
            peers: config.peers.clone(),
            mode: config.mode,
        });

        let mut event_loop = EventLoop {
            fetcher,
            responses_rx,
            results_tx,
            peers: config.peers,
            store: config.store,
            fork_choice: config.fork_choice,
            mode: config.mode,
            highest_expected_slot: config.highest_expected_slot,
            blocks_per_request: config.blocks_per_request,
            stale_epoch_timeout: config.stale_epoch_timeout,
            skipped_machine_timeout: config.skipped_machine_timeout,
            grid: MachineGrid::new(
                config.start_slot,
                config.lookahead_steps,
                config.blocks_per_request,
                Instant::now(),
            ),
            stale_epochs: HashMap::with_capacity_and_hasher(4, Default::default()),
            head_at_last_rearrange: None,
        };

        (*tasks_executor.lock())(Box::pin(async move {
            event_loop.run(stop_rx).await;
            event_loop.fetcher.stop();
            let _ = stopped_tx.send(());
        }));

        BlocksQueue {
            results_rx,
            stop_tx: Some(stop_tx),
            stopped_rx: Some(stopped_rx),
        }
    }

    /// Returns the next batch emitted by the queue, or `None` once the queue has finished
    /// or has been stopped.
    ///
    /// Batches are emitted in non-decreasing `start_slot` order.
    pub async fn next_batch(&mut self) -> Option<BlockBatch> {
        self.results_rx.next().await
    }

    /// Stops the queue: cancels the event loop and every in-flight fetch.
    ///
    /// A queue that has been stopped cannot be restarted; build a new one instead.
    pub async fn stop(&mut self) -> Result<(), StopError> {
        let stop_tx = self.stop_tx.take().ok_or(StopError::AlreadyStopped)?;
        let stopped_rx = self.stopped_rx.take().ok_or(StopError::AlreadyStopped)?;

        let _ = stop_tx.send(());

        let mut timeout = Delay::new(CANCEL_GRACE).fuse();
        let mut stopped = stopped_rx.fuse();
        futures::select! {
            _ = stopped => Ok(()),
            _ = timeout => Err(StopError::TookTooLong),
        }
    }
}

/// State owned by the queue's event loop task.
struct EventLoop<TDialer, TReg, TStore, TFc> {
    fetcher: BlocksFetcher<TDialer, TReg>,
    responses_rx: mpsc::UnboundedReceiver<FetchResponse>,
    results_tx: mpsc::Sender<BlockBatch>,
    peers: Arc<TReg>,
    store: Arc<TStore>,
    fork_choice: Arc<TFc>,
    mode: SyncMode,
    highest_expected_slot: u64,
    blocks_per_request: u64,
    stale_epoch_timeout: Duration,
    skipped_machine_timeout: Duration,
    grid: MachineGrid,
    /// Number of fruitless window re-arrangements, per epoch of the re-arrangement anchor.
    stale_epochs: HashMap<u64, u32, fnv::FnvBuildHasher>,
    /// Head slot observed at the previous re-arrangement. A re-arrangement seeing the same
    /// head again counts as fruitless.
    head_at_last_rearrange: Option<u64>,
}

impl<TDialer, TReg, TStore, TFc> EventLoop<TDialer, TReg, TStore, TFc>
where
    TDialer: StreamDialer,
    TReg: PeerRegistry + Send + Sync + 'static,
    TStore: BlockStore + Send + Sync + 'static,
    TFc: ForkChoice + Send + Sync + 'static,
{
    #[tracing::instrument(level = "trace", skip(self, stop_rx))]
    async fn run(&mut self, stop_rx: oneshot::Receiver<()>) {
        let mut stop_rx = stop_rx.fuse();

        loop {
            let now = Instant::now();

            // Slide the window past the ranges the chain-processing layer has caught up
            // with, and stop once everything left is beyond the target.
            self.grid.advance(self.fork_choice.head_slot(), now);
            if self.grid.lowest_start() > self.highest_expected_slot {
                tracing::debug!(
                    highest_expected_slot = self.highest_expected_slot,
                    "sync-queue-finished"
                );
                break;
            }

            // Hand fetchable ranges to the fetcher.
            for start_slot in self.grid.schedule(self.highest_expected_slot, now) {
                self.fetcher.schedule(start_slot, self.blocks_per_request);
            }
            for start_slot in self.grid.scheduled_needing_retry(HANDSHAKE_POLL, now) {
                self.grid.refresh(start_slot, now);
                self.fetcher.schedule(start_slot, self.blocks_per_request);
            }

            // Emit whatever is ready, in slot order.
            while let Some(batch) = self.grid.pop_ready(now) {
                tracing::debug!(
                    start_slot = batch.start_slot,
                    num_blocks = batch.blocks.len(),
                    peer = %batch.peer,
                    "sync-queue-batch"
                );
                if self.results_tx.send(batch).await.is_err() {
                    // The consumer is gone; nothing left to do.
                    return;
                }
            }

            // Recycle ranges that were delivered long ago but never processed, then deal
            // with an exhausted window.
            self.grid.check_stale(self.stale_epoch_timeout, now);
            match self.grid.process_skipped(self.skipped_machine_timeout, now) {
                SkippedOutcome::AllSkipped => {
                    if !self.fetcher.enough_peers() {
                        tracing::warn!("sync-queue-no-required-peers");
                    } else {
                        self.rearrange_window(now).await;
                    }
                }
                SkippedOutcome::Idle => {}
            }

            futures::select! {
                response = self.responses_rx.next() => {
                    // The sender lives in the fetcher, which we own: the channel can't
                    // close under us.
                    if let Some(response) = response {
                        self.apply_response(response, Instant::now());
                    }
                }
                _ = Delay::new(TICK).fuse() => {}
                _ = stop_rx => {
                    tracing::debug!("sync-queue-stopped");
                    break;
                }
            }
        }
    }

    /// Applies one fetch outcome to the window.
    fn apply_response(&mut self, response: FetchResponse, now: Instant) {
        let start_slot = response.start_slot;
        match response.outcome {
            FetchOutcome::Blocks { peer, blocks } => {
                if !self.grid.data_received(start_slot, peer, blocks, now) {
                    tracing::debug!(start_slot, %peer, "sync-queue-response-discarded");
                }
            }
            FetchOutcome::Failed { peer, failure } => {
                tracing::debug!(
                    start_slot,
                    peer = ?peer,
                    %failure,
                    "sync-queue-fetch-failed"
                );
                match failure {
                    // The machine stays scheduled; re-request right away, most likely
                    // through a different peer. Peers that keep sending garbage go over the
                    // bad-response threshold and drop out of the candidate set.
                    FetchFailure::InvalidData | FetchFailure::Transient => {
                        self.grid.refresh(start_slot, now);
                        self.fetcher.schedule(start_slot, self.blocks_per_request);
                    }
                    // The range straddles a boundary the peer set can't serve past: force a
                    // re-request of the previous range, which may now be answerable.
                    FetchFailure::SlotTooHigh => {
                        self.grid.reset_previous(start_slot, now);
                    }
                    // Retried on the next tick, once the peer set has changed.
                    FetchFailure::NoPeers => {}
                }
            }
        }
    }

    /// Re-anchors the window just above the local head, recomputes the sync target, and,
    /// when re-anchoring stopped producing progress, searches the peers for an alternative
    /// branch.
    async fn rearrange_window(&mut self, now: Instant) {
        let head_slot = self.fork_choice.head_slot();
        let new_start = head_slot + 1;
        let epoch = slot_to_epoch(new_start);

        if self.head_at_last_rearrange == Some(head_slot) {
            let attempts = self.stale_epochs.entry(epoch).or_insert(0);
            *attempts += 1;
            tracing::debug!(epoch, attempts = *attempts, "sync-queue-fruitless-rearrange");

            if *attempts >= MAX_RESET_ATTEMPTS {
                self.stale_epochs.clear();
                if self.backtrack(now).await {
                    return;
                }
            }
        }
        self.head_at_last_rearrange = Some(head_slot);

        self.grid.rearrange(new_start, now);
        self.recompute_target(new_start);
        tracing::debug!(
            new_start,
            highest_expected_slot = self.highest_expected_slot,
            "sync-queue-rearranged"
        );
    }

    /// Recomputes [`Config::highest_expected_slot`] after the window moved to `new_start`.
    fn recompute_target(&mut self, new_start: u64) {
        let window_slots =
            self.blocks_per_request * u64::try_from(self.grid_width()).unwrap();
        match self.mode {
            SyncMode::StopOnFinalized => {
                // Bounded both by the window (no point targeting further than it reaches)
                // and by what the peer majority has finalized: ranges beyond that would
                // only sit in the window as un-servable and stall its recycling.
                self.highest_expected_slot = core::cmp::min(
                    next_epoch_boundary(new_start + window_slots - 1),
                    epoch_start_slot(self.fetcher.best_finalized_epoch()),
                );
            }
            SyncMode::Unconstrained => {
                self.highest_expected_slot =
                    self.highest_expected_slot.saturating_add(self.blocks_per_request);
            }
        }
    }

    /// Searches the connected peers for a branch that forks off a locally-known block, and
    /// seeds the window with the first diverging range found.
    ///
    /// Returns `true` if the window has been seeded.
    async fn backtrack(&mut self, now: Instant) -> bool {
        let finalized_epoch = self.fork_choice.finalized_checkpoint().epoch;
        let request = BlocksByRangeRequest {
            start_slot: epoch_start_slot(finalized_epoch) + 1,
            step: 1,
            count: self.blocks_per_request,
        };

        tracing::debug!(
            start_slot = request.start_slot,
            "sync-queue-backtrack-search"
        );

        // Interrogate the peers whose advertised head is furthest beyond our finalized
        // epoch first; an alternative branch, if one exists, lives on them.
        let candidates = self
            .peers
            .best_non_finalized(MIN_SYNC_PEERS * 2, finalized_epoch);
        for peer in candidates {
            if self.peers.is_bad(&peer) {
                continue;
            }

            let blocks = match self.fetcher.fetch_from(&peer, &request).await {
                Ok(blocks) => blocks,
                Err(_) => continue,
            };

            // The fork point is the first block that extends a known block with an unknown
            // one.
            let fork_point = blocks.iter().position(|block| {
                self.store.has_block(&block.parent_root())
                    && !self.store.has_block(&block.block_root())
            });
            let fork_point = match fork_point {
                Some(position) => position,
                None => continue,
            };

            let divergent_slot = blocks[fork_point].slot();
            let new_start = epoch_start_slot(slot_to_epoch(divergent_slot)) + 1;
            let seed = blocks
                .iter()
                .filter(|b| {
                    b.slot() >= new_start && b.slot() < new_start + self.blocks_per_request
                })
                .cloned()
                .collect::<Vec<_>>();

            tracing::debug!(
                %peer,
                divergent_slot,
                new_start,
                "sync-queue-alternative-branch"
            );

            self.grid.rearrange(new_start, now);
            self.grid.seed_data(new_start, peer, seed, now);
            self.recompute_target(new_start);
            self.head_at_last_rearrange = None;
            return true;
        }

        tracing::debug!("sync-queue-no-alternative-branch");
        false
    }

    fn grid_width(&self) -> usize {
        usize::try_from(
            (self.grid.highest_start() - self.grid.lowest_start()) / self.grid.bucket_size() + 1,
        )
        .unwrap()
    }
}
