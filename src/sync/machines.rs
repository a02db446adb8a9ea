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

//! Window of per-range state machines.
//!
//! The lookahead window is a fixed number of machines covering contiguous, non-overlapping
//! buckets of slots. Each machine tracks the download of its bucket through five states:
//!
//! - `New`: nothing has been done for this range yet.
//! - `Scheduled`: a fetch request for the range has been handed to the fetcher.
//! - `DataParsed`: a well-formed response has arrived and is waiting to be emitted.
//! - `Skipped`: the range produced no blocks, or lies beyond the sync target.
//! - `Sent`: the range's blocks have been emitted on the output channel.
//!
//! The window enforces strict-order delivery: a machine's blocks can only be emitted once
//! every machine covering lower slots is either `Sent` or `Skipped`. Responses therefore
//! accumulate in arbitrary order, but leave in slot order.
//!
//! This module performs no I/O and never reads a clock; the current time is a parameter of
//! every age-dependent operation. The event loop in [`crate::sync::queue`] owns the window
//! and feeds it.

use std::time::Instant;

use crate::block::SignedBeaconBlock;
use crate::network::PeerId;

/// State of one machine. See the module documentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    New,
    Scheduled,
    DataParsed {
        /// Peer the response came from.
        peer: PeerId,
        /// Blocks of the response, in increasing slot order. Possibly empty.
        blocks: Vec<SignedBeaconBlock>,
    },
    Skipped,
    Sent,
}

impl MachineState {
    fn is_terminal(&self) -> bool {
        matches!(self, MachineState::Skipped | MachineState::Sent)
    }
}

/// One per-range machine.
#[derive(Debug)]
struct Machine {
    /// First slot of the range. The range spans `bucket_size` slots.
    start_slot: u64,
    state: MachineState,
    /// Time of the last state change (or refresh).
    updated: Instant,
}

/// Blocks of one range, ready to be handed to the chain-processing layer.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    /// First slot of the range the batch covers.
    pub start_slot: u64,
    /// Peer that served the batch.
    pub peer: PeerId,
    /// Blocks in increasing slot order. Never empty.
    pub blocks: Vec<SignedBeaconBlock>,
}

/// Outcome of [`MachineGrid::process_skipped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkippedOutcome {
    /// Nothing noteworthy.
    Idle,
    /// Every machine in the window is skipped. The window is exhausted and must be
    /// re-arranged by the caller.
    AllSkipped,
}

/// Fixed-width window of contiguous per-range machines.
///
/// Invariant: machines are kept sorted by `start_slot`, and the union of their ranges is one
/// contiguous half-open slot interval.
pub struct MachineGrid {
    machines: Vec<Machine>,
    bucket_size: u64,
}

impl MachineGrid {
    /// Builds a window of `width` machines covering `width * bucket_size` slots starting at
    /// `start_slot`.
    ///
    /// # Panic
    ///
    /// Panics if `width` is zero or `bucket_size` is zero.
    ///
    pub fn new(start_slot: u64, width: usize, bucket_size: u64, now: Instant) -> Self {
        assert!(width != 0);
        assert!(bucket_size != 0);

        let machines = (0..width)
            .map(|index| Machine {
                start_slot: start_slot + bucket_size * u64::try_from(index).unwrap(),
                state: MachineState::New,
                updated: now,
            })
            .collect();

        MachineGrid {
            machines,
            bucket_size,
        }
    }

    /// Number of slots covered by each machine.
    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    /// Start slot of the lowest machine.
    pub fn lowest_start(&self) -> u64 {
        self.machines.first().unwrap().start_slot
    }

    /// Start slot of the highest machine.
    pub fn highest_start(&self) -> u64 {
        self.machines.last().unwrap().start_slot
    }

    /// State of the machine covering the given start slot, if any.
    pub fn state(&self, start_slot: u64) -> Option<&MachineState> {
        self.machine(start_slot).map(|machine| &machine.state)
    }

    /// Returns `true` if every machine is `Skipped`.
    pub fn all_skipped(&self) -> bool {
        self.machines
            .iter()
            .all(|m| matches!(m.state, MachineState::Skipped))
    }

    /// Drives every `New` machine: machines whose range begins at or below
    /// `highest_expected_slot` become `Scheduled` and their start slot is returned so that
    /// the caller enqueues a fetch; machines beyond the target become `Skipped`.
    pub fn schedule(&mut self, highest_expected_slot: u64, now: Instant) -> Vec<u64> {
        let mut to_fetch = Vec::new();
        for machine in &mut self.machines {
            if !matches!(machine.state, MachineState::New) {
                continue;
            }
            if machine.start_slot <= highest_expected_slot {
                machine.state = MachineState::Scheduled;
                machine.updated = now;
                to_fetch.push(machine.start_slot);
            } else {
                machine.state = MachineState::Skipped;
                machine.updated = now;
            }
        }
        to_fetch
    }

    /// Applies a well-formed response to the machine covering `start_slot`.
    ///
    /// Returns `false` if the response was discarded: no machine covers this start slot
    /// anymore, or the machine isn't waiting for data. Both happen legitimately when a slow
    /// response arrives after the window moved on.
    pub fn data_received(
        &mut self,
        start_slot: u64,
        peer: PeerId,
        blocks: Vec<SignedBeaconBlock>,
        now: Instant,
    ) -> bool {
        match self.machine_mut(start_slot) {
            Some(machine) if matches!(machine.state, MachineState::Scheduled) => {
                machine.state = MachineState::DataParsed { peer, blocks };
                machine.updated = now;
                true
            }
            _ => false,
        }
    }

    /// Resets the machine immediately below the one covering `start_slot` back to `New`,
    /// forcing a re-request of the range that straddles a boundary the responding peer
    /// can't serve past.
    ///
    /// Returns `false` if there is no machine below.
    pub fn reset_previous(&mut self, start_slot: u64, now: Instant) -> bool {
        let previous_start = match start_slot.checked_sub(self.bucket_size) {
            Some(previous_start) => previous_start,
            None => return false,
        };
        match self.machine_mut(previous_start) {
            Some(machine) => {
                machine.state = MachineState::New;
                machine.updated = now;
                true
            }
            None => false,
        }
    }

    /// Refreshes the age of the machine covering `start_slot` without changing its state.
    /// Used when a fetch is re-issued for a still-`Scheduled` machine.
    pub fn refresh(&mut self, start_slot: u64, now: Instant) {
        if let Some(machine) = self.machine_mut(start_slot) {
            machine.updated = now;
        }
    }

    /// Start slots of `Scheduled` machines whose last activity is older than `timeout`.
    /// Their fetch presumably got lost; the caller should re-issue it and [`refresh`] them.
    ///
    /// [`refresh`]: MachineGrid::refresh
    pub fn scheduled_needing_retry(&self, timeout: core::time::Duration, now: Instant) -> Vec<u64> {
        self.machines
            .iter()
            .filter(|m| matches!(m.state, MachineState::Scheduled))
            .filter(|m| now.saturating_duration_since(m.updated) >= timeout)
            .map(|m| m.start_slot)
            .collect()
    }

    /// Emits the next batch in slot order, if any.
    ///
    /// A `DataParsed` machine becomes eligible once every machine below it is terminal. An
    /// eligible machine with an empty response becomes `Skipped` and the scan continues; one
    /// with blocks becomes `Sent` and its batch is returned.
    pub fn pop_ready(&mut self, now: Instant) -> Option<BlockBatch> {
        for index in 0..self.machines.len() {
            if !self.machines[index].state.is_terminal() {
                let eligible = matches!(self.machines[index].state, MachineState::DataParsed { .. });
                if !eligible {
                    // A `New` or `Scheduled` machine blocks everything above it.
                    return None;
                }

                let start_slot = self.machines[index].start_slot;
                let machine = &mut self.machines[index];
                let (peer, blocks) = match core::mem::replace(&mut machine.state, MachineState::Sent)
                {
                    MachineState::DataParsed { peer, blocks } => (peer, blocks),
                    _ => unreachable!(),
                };
                machine.updated = now;

                if blocks.is_empty() {
                    machine.state = MachineState::Skipped;
                    continue;
                }

                return Some(BlockBatch {
                    start_slot,
                    peer,
                    blocks,
                });
            }
        }
        None
    }

    /// Gives timed-out `Skipped` machines (except the last of the window) another chance by
    /// resetting them to `New`, and reports whether the whole window is exhausted.
    pub fn process_skipped(
        &mut self,
        timeout: core::time::Duration,
        now: Instant,
    ) -> SkippedOutcome {
        if self.all_skipped() {
            return SkippedOutcome::AllSkipped;
        }

        let last_index = self.machines.len() - 1;
        for machine in &mut self.machines[..last_index] {
            if matches!(machine.state, MachineState::Skipped)
                && now.saturating_duration_since(machine.updated) >= timeout
            {
                machine.state = MachineState::New;
                machine.updated = now;
            }
        }
        SkippedOutcome::Idle
    }

    /// Turns `Sent` machines whose blocks still haven't been processed after `timeout` back
    /// into `Skipped`, so that [`MachineGrid::process_skipped`] eventually re-requests them.
    pub fn check_stale(&mut self, timeout: core::time::Duration, now: Instant) {
        for machine in &mut self.machines {
            if matches!(machine.state, MachineState::Sent)
                && now.saturating_duration_since(machine.updated) >= timeout
            {
                machine.state = MachineState::Skipped;
                machine.updated = now;
            }
        }
    }

    /// Slides the window past every machine whose entire range is at or below `head_slot`:
    /// such machines are destroyed and replaced by fresh `New` machines on top of the
    /// window, keeping its width and contiguity.
    pub fn advance(&mut self, head_slot: u64, now: Instant) {
        while self.machines[0].start_slot + self.bucket_size - 1 <= head_slot {
            let new_start = self.highest_start() + self.bucket_size;
            self.machines.remove(0);
            self.machines.push(Machine {
                start_slot: new_start,
                state: MachineState::New,
                updated: now,
            });
        }
    }

    /// Destroys every machine and reallocates the window at `new_start`.
    pub fn rearrange(&mut self, new_start: u64, now: Instant) {
        let width = self.machines.len();
        *self = MachineGrid::new(new_start, width, self.bucket_size, now);
    }

    /// Places a response directly into the machine covering `start_slot`, regardless of its
    /// current state. Used to seed the window with the blocks found by the
    /// alternative-branch search.
    ///
    /// # Panic
    ///
    /// Panics if no machine covers `start_slot`.
    ///
    pub fn seed_data(
        &mut self,
        start_slot: u64,
        peer: PeerId,
        blocks: Vec<SignedBeaconBlock>,
        now: Instant,
    ) {
        let machine = self.machine_mut(start_slot).unwrap();
        machine.state = MachineState::DataParsed { peer, blocks };
        machine.updated = now;
    }

    fn machine(&self, start_slot: u64) -> Option<&Machine> {
        self.machines.iter().find(|m| m.start_slot == start_slot)
    }

    fn machine_mut(&mut self, start_slot: u64) -> Option<&mut Machine> {
        self.machines.iter_mut().find(|m| m.start_slot == start_slot)
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::time::Instant;

    use super::{MachineGrid, MachineState, SkippedOutcome};
    use crate::block::{BeaconBlock, SignedBeaconBlock};
    use crate::network::PeerId;

    const BUCKET: u64 = 64;
    const WIDTH: usize = 8;

    fn peer() -> PeerId {
        PeerId([7; 32])
    }

    fn blocks_for(start_slot: u64, count: u64) -> Vec<SignedBeaconBlock> {
        (start_slot..start_slot + count)
            .map(|slot| SignedBeaconBlock {
                message: BeaconBlock {
                    slot,
                    proposer_index: 0,
                    parent_root: [0; 32],
                    state_root: [0; 32],
                    body: Vec::new(),
                },
                signature: [0; 96],
            })
            .collect()
    }

    fn grid(now: Instant) -> MachineGrid {
        MachineGrid::new(1, WIDTH, BUCKET, now)
    }

    #[test]
    fn window_covers_contiguous_buckets() {
        let grid = grid(Instant::now());
        assert_eq!(grid.lowest_start(), 1);
        assert_eq!(
            grid.highest_start(),
            1 + BUCKET * (WIDTH as u64 - 1)
        );
        for index in 0..WIDTH as u64 {
            assert!(matches!(
                grid.state(1 + BUCKET * index),
                Some(MachineState::New)
            ));
        }
    }

    #[test]
    fn schedule_splits_on_target() {
        let now = Instant::now();
        let mut grid = grid(now);

        // Target inside the third bucket: three machines are scheduled, five are skipped.
        let target = 1 + 2 * BUCKET;
        let to_fetch = grid.schedule(target, now);
        assert_eq!(to_fetch, vec![1, 1 + BUCKET, 1 + 2 * BUCKET]);
        assert!(matches!(grid.state(1), Some(MachineState::Scheduled)));
        assert!(matches!(
            grid.state(1 + 3 * BUCKET),
            Some(MachineState::Skipped)
        ));
    }

    #[test]
    fn strict_order_delivery() {
        let now = Instant::now();
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);

        // Responses arrive out of order: second bucket first.
        assert!(grid.data_received(1 + BUCKET, peer(), blocks_for(1 + BUCKET, BUCKET), now));
        assert!(grid.pop_ready(now).is_none());

        // Once the first bucket arrives, both pop out, in slot order.
        assert!(grid.data_received(1, peer(), blocks_for(1, BUCKET), now));
        let first = grid.pop_ready(now).unwrap();
        assert_eq!(first.start_slot, 1);
        let second = grid.pop_ready(now).unwrap();
        assert_eq!(second.start_slot, 1 + BUCKET);
        assert!(grid.pop_ready(now).is_none());

        assert!(matches!(grid.state(1), Some(MachineState::Sent)));
        assert!(matches!(grid.state(1 + BUCKET), Some(MachineState::Sent)));
    }

    #[test]
    fn empty_response_skips_and_unblocks() {
        let now = Instant::now();
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);

        assert!(grid.data_received(1, peer(), Vec::new(), now));
        assert!(grid.data_received(1 + BUCKET, peer(), blocks_for(1 + BUCKET, 3), now));

        // The empty first bucket is skipped silently and the second pops.
        let batch = grid.pop_ready(now).unwrap();
        assert_eq!(batch.start_slot, 1 + BUCKET);
        assert!(matches!(grid.state(1), Some(MachineState::Skipped)));
    }

    #[test]
    fn late_response_is_discarded() {
        let now = Instant::now();
        let mut grid = grid(now);

        // Not scheduled yet: response refused.
        assert!(!grid.data_received(1, peer(), blocks_for(1, 4), now));

        grid.schedule(u64::max_value(), now);
        assert!(grid.data_received(1, peer(), blocks_for(1, 4), now));
        // Already parsed: second response refused.
        assert!(!grid.data_received(1, peer(), blocks_for(1, 4), now));
        // Unknown range: refused.
        assert!(!grid.data_received(7777, peer(), blocks_for(7777, 4), now));
    }

    #[test]
    fn slot_too_high_resets_previous_machine() {
        let now = Instant::now();
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);

        assert!(grid.data_received(1, peer(), blocks_for(1, BUCKET), now));
        assert!(grid.pop_ready(now).is_some());
        assert!(matches!(grid.state(1), Some(MachineState::Sent)));

        // The peer serving the second bucket advertised slots it can't deliver: the first
        // machine is re-requested, whatever state it was in.
        assert!(grid.reset_previous(1 + BUCKET, now));
        assert!(matches!(grid.state(1), Some(MachineState::New)));

        // The lowest machine has nothing below it.
        assert!(!grid.reset_previous(1, now));
    }

    #[test]
    fn skipped_machines_are_retried_after_timeout() {
        let now = Instant::now();
        let timeout = Duration::from_secs(192);
        let mut grid = grid(now);

        // Everything beyond the first bucket is beyond the target.
        grid.schedule(1, now);
        assert_eq!(
            grid.process_skipped(timeout, now),
            SkippedOutcome::Idle
        );
        assert!(matches!(
            grid.state(1 + BUCKET),
            Some(MachineState::Skipped)
        ));

        // After the timeout, non-last skipped machines get another chance.
        let later = now + timeout;
        assert_eq!(
            grid.process_skipped(timeout, later),
            SkippedOutcome::Idle
        );
        assert!(matches!(grid.state(1 + BUCKET), Some(MachineState::New)));
        // The last machine of the window is deliberately left skipped.
        assert!(matches!(
            grid.state(1 + BUCKET * (WIDTH as u64 - 1)),
            Some(MachineState::Skipped)
        ));
    }

    #[test]
    fn exhausted_window_is_reported() {
        let now = Instant::now();
        let mut grid = grid(now);

        // Target below the window: every machine skips.
        grid.schedule(0, now);
        assert!(grid.all_skipped());
        assert_eq!(
            grid.process_skipped(Duration::from_secs(192), now),
            SkippedOutcome::AllSkipped
        );
    }

    #[test]
    fn stale_sent_machines_are_recycled() {
        let now = Instant::now();
        let timeout = Duration::from_secs(384);
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);
        grid.data_received(1, peer(), blocks_for(1, BUCKET), now);
        grid.pop_ready(now).unwrap();

        grid.check_stale(timeout, now);
        assert!(matches!(grid.state(1), Some(MachineState::Sent)));

        grid.check_stale(timeout, now + timeout);
        assert!(matches!(grid.state(1), Some(MachineState::Skipped)));
    }

    #[test]
    fn advance_slides_the_window() {
        let now = Instant::now();
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);
        grid.data_received(1, peer(), blocks_for(1, BUCKET), now);
        grid.pop_ready(now).unwrap();

        // The head processed the whole first bucket: the window slides by one machine.
        grid.advance(BUCKET, now);
        assert_eq!(grid.lowest_start(), 1 + BUCKET);
        assert_eq!(
            grid.highest_start(),
            1 + BUCKET * (WIDTH as u64)
        );
        assert!(matches!(
            grid.state(1 + BUCKET * (WIDTH as u64)),
            Some(MachineState::New)
        ));

        // Head still inside the (new) first bucket: no slide.
        grid.advance(BUCKET + 10, now);
        assert_eq!(grid.lowest_start(), 1 + BUCKET);
    }

    #[test]
    fn rearrange_reallocates_everything() {
        let now = Instant::now();
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);
        grid.data_received(1, peer(), blocks_for(1, 5), now);

        grid.rearrange(1000, now);
        assert_eq!(grid.lowest_start(), 1000);
        assert_eq!(
            grid.highest_start(),
            1000 + BUCKET * (WIDTH as u64 - 1)
        );
        assert!(grid
            .state(1)
            .is_none());
        assert!(matches!(grid.state(1000), Some(MachineState::New)));
    }

    #[test]
    fn seeding_bypasses_scheduling() {
        let now = Instant::now();
        let mut grid = grid(now);

        grid.seed_data(1, peer(), blocks_for(1, 10), now);
        let batch = grid.pop_ready(now).unwrap();
        assert_eq!(batch.start_slot, 1);
        assert_eq!(batch.blocks.len(), 10);
    }

    #[test]
    fn scheduled_retry_listing() {
        let now = Instant::now();
        let timeout = Duration::from_secs(192);
        let mut grid = grid(now);
        grid.schedule(u64::max_value(), now);

        assert!(grid.scheduled_needing_retry(timeout, now).is_empty());

        let later = now + timeout;
        let stale = grid.scheduled_needing_retry(timeout, later);
        assert_eq!(stale.len(), WIDTH);

        grid.refresh(1, later);
        let stale = grid.scheduled_needing_retry(timeout, later);
        assert_eq!(stale.len(), WIDTH - 1);
        assert!(!stale.contains(&1));
    }
}
