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

//! Pool of outbound block requests.
//!
//! The fetcher sits between the synchronization queue and the network: the queue asks for a
//! range of slots, the fetcher picks a peer able to serve it, performs the blocks-by-range
//! exchange on its own task, classifies the outcome, and pushes a [`FetchResponse`] onto the
//! channel shared with the queue. Several fetches run in parallel, one task each.
//!
//! The fetcher is also where a peer's advertised chain is compared against what it is asked
//! for: a range that starts beyond what the current peer set can possibly serve fails
//! immediately with [`FetchFailure::SlotTooHigh`], without burning a request on it.

use core::pin::Pin;
use std::sync::Arc;

use futures::{
    channel::mpsc,
    future::{AbortHandle, Abortable},
    prelude::*,
};
use rand::seq::SliceRandom as _;

use super::{SyncMode, MIN_SYNC_PEERS};
use crate::block::{epoch_start_slot, SignedBeaconBlock};
use crate::chain::PeerRegistry;
use crate::network::protocol::{BlocksByRangeRequest, StatusCode, BLOCKS_BY_RANGE_PROTOCOL};
use crate::network::range_client::{self, FetchError};
use crate::network::{PeerId, StreamDialer};

/// Configuration for a [`BlocksFetcher`].
pub struct Config<TDialer, TReg> {
    /// Closure that spawns background tasks.
    pub tasks_executor: Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>,

    /// Access to the transport layer.
    pub dialer: TDialer,

    /// View of the connected peers.
    pub peers: Arc<TReg>,

    /// Whether ranges beyond the peer-majority finalized slot are servable.
    pub mode: SyncMode,
}

/// Result of one fetch, keyed by the start slot of the range it covered.
#[derive(Debug)]
pub struct FetchResponse {
    /// Start slot of the range the fetch covered.
    pub start_slot: u64,
    /// What happened.
    pub outcome: FetchOutcome,
}

/// See [`FetchResponse::outcome`].
#[derive(Debug)]
pub enum FetchOutcome {
    /// The peer answered with a protocol-conformant response. Possibly empty.
    Blocks {
        peer: PeerId,
        blocks: Vec<SignedBeaconBlock>,
    },
    /// The fetch failed.
    Failed {
        /// Peer that was asked, if the failure happened after peer selection.
        peer: Option<PeerId>,
        failure: FetchFailure,
    },
}

/// Ways a fetch can fail. The distinctions drive the queue's recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FetchFailure {
    /// The requested range starts beyond what the current peer set advertises being able to
    /// serve.
    SlotTooHigh,
    /// The peer's response violates the protocol invariants. The peer has been penalized.
    InvalidData,
    /// Transport-level failure, remote refusal, or timeout. Nobody's fault; retry through
    /// another peer.
    Transient,
    /// No connected peer is able to serve the range.
    NoPeers,
}

/// Pool of outbound block requests. See the module documentation.
pub struct BlocksFetcher<TDialer, TReg> {
    tasks_executor: parking_lot::Mutex<Box<dyn FnMut(Pin<Box<dyn Future<Output = ()> + Send>>) + Send>>,
    dialer: Arc<TDialer>,
    peers: Arc<TReg>,
    mode: SyncMode,
    responses_tx: mpsc::UnboundedSender<FetchResponse>,
    /// Abort handles of the in-flight fetch tasks. Sized for the lookahead window;
    /// completed entries are cleaned up lazily.
    in_flight: smallvec::SmallVec<[AbortHandle; 8]>,
}

impl<TDialer, TReg> BlocksFetcher<TDialer, TReg>
where
    TDialer: StreamDialer,
    TReg: PeerRegistry + Send + Sync + 'static,
{
    /// Builds a new fetcher, plus the receiving half of its response channel.
    pub fn new(config: Config<TDialer, TReg>) -> (Self, mpsc::UnboundedReceiver<FetchResponse>) {
        let (responses_tx, responses_rx) = mpsc::unbounded();
        (
            BlocksFetcher {
                tasks_executor: parking_lot::Mutex::new(config.tasks_executor),
                dialer: Arc::new(config.dialer),
                peers: config.peers,
                mode: config.mode,
                responses_tx,
                in_flight: smallvec::SmallVec::new(),
            },
            responses_rx,
        )
    }

    /// Highest slot the current peer set can be expected to serve, given the mode.
    ///
    /// In [`SyncMode::StopOnFinalized`], this is the slot sealing the epoch that most peers
    /// report as finalized (ties going to the higher epoch). In [`SyncMode::Unconstrained`],
    /// it is the highest head slot any usable peer advertises.
    pub fn highest_servable_slot(&self) -> u64 {
        match self.mode {
            SyncMode::StopOnFinalized => epoch_start_slot(self.best_finalized_epoch()),
            SyncMode::Unconstrained => self.best_head_slot(),
        }
    }

    /// The finalized epoch claimed by the largest group of usable peers.
    pub fn best_finalized_epoch(&self) -> u64 {
        best_finalized_epoch(&*self.peers)
    }

    /// The highest head slot any usable peer advertises.
    pub fn best_head_slot(&self) -> u64 {
        best_head_slot(&*self.peers)
    }

    /// Returns `true` if enough peers are connected to sync at all.
    pub fn enough_peers(&self) -> bool {
        self.usable_peers().count() >= MIN_SYNC_PEERS
    }

    /// Starts a fetch for `count` slots starting at `start_slot`. The outcome, success or
    /// failure, arrives on the response channel.
    pub fn schedule(&mut self, start_slot: u64, count: u64) {
        // A range beyond what the peer set advertises fails without a network round trip.
        if start_slot > self.highest_servable_slot() {
            let _ = self.responses_tx.unbounded_send(FetchResponse {
                start_slot,
                outcome: FetchOutcome::Failed {
                    peer: None,
                    failure: FetchFailure::SlotTooHigh,
                },
            });
            return;
        }

        let peer = {
            let candidates = self
                .usable_peers()
                .filter(|peer| {
                    self.peers
                        .chain_state(peer)
                        .map_or(false, |state| state.head_slot >= start_slot)
                })
                .collect::<Vec<_>>();
            candidates.choose(&mut rand::thread_rng()).copied()
        };

        let peer = match peer {
            Some(peer) => peer,
            None => {
                let _ = self.responses_tx.unbounded_send(FetchResponse {
                    start_slot,
                    outcome: FetchOutcome::Failed {
                        peer: None,
                        failure: FetchFailure::NoPeers,
                    },
                });
                return;
            }
        };

        let request = BlocksByRangeRequest {
            start_slot,
            step: 1,
            count,
        };

        let dialer = self.dialer.clone();
        let peers = self.peers.clone();
        let responses_tx = self.responses_tx.clone();

        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        self.in_flight.retain(|handle| !handle.is_aborted());
        self.in_flight.push(abort_handle);

        let task = async move {
            let outcome = match fetch_once(&*dialer, &*peers, &peer, &request).await {
                Ok(blocks) => FetchOutcome::Blocks { peer, blocks },
                Err(failure) => FetchOutcome::Failed {
                    peer: Some(peer),
                    failure,
                },
            };
            let _ = responses_tx.unbounded_send(FetchResponse {
                start_slot: request.start_slot,
                outcome,
            });
        };

        (*self.tasks_executor.lock())(Box::pin(
            Abortable::new(task, abort_registration).map(|_| ()),
        ));
    }

    /// Performs one blocks-by-range exchange with a specific peer, inline.
    ///
    /// Used by the alternative-branch search, which wants to interrogate each peer in turn
    /// rather than go through the scheduling machinery.
    pub async fn fetch_from(
        &self,
        peer: &PeerId,
        request: &BlocksByRangeRequest,
    ) -> Result<Vec<SignedBeaconBlock>, FetchFailure> {
        fetch_once(&*self.dialer, &*self.peers, peer, request).await
    }

    /// Aborts every in-flight fetch. Their results are discarded.
    pub fn stop(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
    }

    fn usable_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .connected()
            .into_iter()
            .filter(move |peer| !self.peers.is_bad(peer))
    }
}

impl<TDialer, TReg> Drop for BlocksFetcher<TDialer, TReg> {
    fn drop(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
    }
}

/// The finalized epoch claimed by the largest group of usable peers, ties going to the
/// higher epoch. Zero if no usable peer advertised a chain state yet.
pub fn best_finalized_epoch<TReg: PeerRegistry>(peers: &TReg) -> u64 {
    let mut votes: Vec<(u64, usize)> = Vec::new();
    for peer in peers.connected() {
        if peers.is_bad(&peer) {
            continue;
        }
        if let Some(state) = peers.chain_state(&peer) {
            match votes
                .iter_mut()
                .find(|(epoch, _)| *epoch == state.finalized_epoch)
            {
                Some((_, count)) => *count += 1,
                None => votes.push((state.finalized_epoch, 1)),
            }
        }
    }
    votes
        .into_iter()
        .max_by_key(|(epoch, count)| (*count, *epoch))
        .map(|(epoch, _)| epoch)
        .unwrap_or(0)
}

/// The highest head slot any usable peer advertises.
pub fn best_head_slot<TReg: PeerRegistry>(peers: &TReg) -> u64 {
    peers
        .connected()
        .into_iter()
        .filter(|peer| !peers.is_bad(peer))
        .filter_map(|peer| peers.chain_state(&peer))
        .map(|state| state.head_slot)
        .max()
        .unwrap_or(0)
}

/// Number of usable peers whose advertised head reaches `slot`.
pub fn num_peers_serving<TReg: PeerRegistry>(peers: &TReg, slot: u64) -> usize {
    peers
        .connected()
        .into_iter()
        .filter(|peer| !peers.is_bad(peer))
        .filter_map(|peer| peers.chain_state(&peer))
        .filter(|state| state.head_slot >= slot)
        .count()
}

/// Dials, performs the exchange, and classifies the outcome.
async fn fetch_once<TDialer, TReg>(
    dialer: &TDialer,
    peers: &TReg,
    peer: &PeerId,
    request: &BlocksByRangeRequest,
) -> Result<Vec<SignedBeaconBlock>, FetchFailure>
where
    TDialer: StreamDialer,
    TReg: PeerRegistry,
{
    let mut stream = match dialer.open_stream(peer, BLOCKS_BY_RANGE_PROTOCOL).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::debug!(%peer, error = %err, "blocks-fetch-dial-failed");
            return Err(FetchFailure::Transient);
        }
    };

    match range_client::blocks_by_range(&mut stream, request).await {
        Ok(blocks) => {
            peers.report_blocks_provided(peer, u64::try_from(blocks.len()).unwrap());
            Ok(blocks)
        }
        Err(FetchError::InvalidFetchedData(violation)) => {
            tracing::debug!(%peer, %violation, "blocks-fetch-invalid-data");
            peers.report_bad_response(peer);
            Err(FetchFailure::InvalidData)
        }
        Err(FetchError::Remote { status, reason }) => {
            tracing::debug!(%peer, ?status, %reason, "blocks-fetch-refused");
            if matches!(status, StatusCode::InvalidRequest) {
                // The remote judged our request invalid; its view of the policy limits
                // differs from ours. Not retriable with the same parameters, but not a
                // correctness problem either.
                tracing::warn!(%peer, %reason, "blocks-fetch-request-rejected");
            }
            Err(FetchFailure::Transient)
        }
        Err(FetchError::Codec(err)) => {
            tracing::debug!(%peer, error = %err, "blocks-fetch-stream-failed");
            Err(FetchFailure::Transient)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::{executor::block_on, executor::ThreadPool, prelude::*};

    use super::{BlocksFetcher, Config, FetchFailure, FetchOutcome};
    use crate::chain::PeerRegistry;
    use crate::block::slot_to_epoch;
    use crate::chain::PeerChainState;
    use crate::network::protocol::BlocksByRangeRequest;
    use crate::network::PeerId;
    use crate::sync::testutil::{linear_chain, Tamper, TestDialer, TestRegistry};
    use crate::sync::SyncMode;

    fn peer_state(head_slot: u64) -> PeerChainState {
        PeerChainState {
            finalized_epoch: slot_to_epoch(head_slot),
            finalized_root: [0; 32],
            head_slot,
            head_root: [0; 32],
            fork_digest: [0; 4],
        }
    }

    fn fetcher_with(
        dialer: TestDialer,
        registry: Arc<TestRegistry>,
        mode: SyncMode,
    ) -> (
        BlocksFetcher<TestDialer, TestRegistry>,
        futures::channel::mpsc::UnboundedReceiver<super::FetchResponse>,
    ) {
        let pool = ThreadPool::new().unwrap();
        BlocksFetcher::new(Config {
            tasks_executor: Box::new(move |future| pool.spawn_ok(future)),
            dialer,
            peers: registry,
            mode,
        })
    }

    #[test]
    fn fetches_blocks_from_a_peer() {
        let peer = PeerId([1; 32]);
        let chain = linear_chain(1, 320, [0; 32], 0);

        let dialer = TestDialer::default();
        dialer.add_peer(peer, chain, Tamper::None);
        let registry = Arc::new(TestRegistry::default());
        registry.add_peer(peer, peer_state(320));

        let (mut fetcher, mut responses) =
            fetcher_with(dialer, registry, SyncMode::StopOnFinalized);

        fetcher.schedule(1, 64);
        let response = block_on(responses.next()).unwrap();
        assert_eq!(response.start_slot, 1);
        match response.outcome {
            FetchOutcome::Blocks { peer: from, blocks } => {
                assert_eq!(from, peer);
                assert_eq!(blocks.len(), 64);
                assert_eq!(blocks.first().unwrap().slot(), 1);
                assert_eq!(blocks.last().unwrap().slot(), 64);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn range_beyond_peers_fails_fast() {
        let peer = PeerId([1; 32]);
        let dialer = TestDialer::default();
        dialer.add_peer(peer, linear_chain(1, 64, [0; 32], 0), Tamper::None);
        let registry = Arc::new(TestRegistry::default());
        registry.add_peer(peer, peer_state(64));

        let (mut fetcher, mut responses) =
            fetcher_with(dialer, registry, SyncMode::StopOnFinalized);

        // Epoch 2 is finalized, so slot 64 is servable but slot 1000 isn't.
        fetcher.schedule(1000, 64);
        let response = block_on(responses.next()).unwrap();
        assert!(matches!(
            response.outcome,
            FetchOutcome::Failed {
                failure: FetchFailure::SlotTooHigh,
                ..
            }
        ));
    }

    #[test]
    fn no_peers_is_reported() {
        let (mut fetcher, mut responses) = fetcher_with(
            TestDialer::default(),
            Arc::new(TestRegistry::default()),
            SyncMode::StopOnFinalized,
        );

        fetcher.schedule(0, 64);
        let response = block_on(responses.next()).unwrap();
        assert!(matches!(
            response.outcome,
            FetchOutcome::Failed {
                failure: FetchFailure::NoPeers,
                ..
            }
        ));
    }

    #[test]
    fn tampered_response_penalizes_peer() {
        let peer = PeerId([1; 32]);
        let dialer = TestDialer::default();
        dialer.add_peer(peer, linear_chain(1, 320, [0; 32], 0), Tamper::ReverseOrder);
        let registry = Arc::new(TestRegistry::default());
        registry.add_peer(peer, peer_state(320));

        let (mut fetcher, mut responses) =
            fetcher_with(dialer, registry.clone(), SyncMode::StopOnFinalized);

        fetcher.schedule(1, 64);
        let response = block_on(responses.next()).unwrap();
        assert!(matches!(
            response.outcome,
            FetchOutcome::Failed {
                failure: FetchFailure::InvalidData,
                peer: Some(from),
            } if from == peer
        ));
        assert_eq!(registry.bad_response_count(&peer), 1);
    }

    #[test]
    fn unreachable_peer_is_transient() {
        let peer = PeerId([1; 32]);
        let dialer = TestDialer::default();
        dialer.add_peer(peer, Vec::new(), Tamper::Unreachable);
        let registry = Arc::new(TestRegistry::default());
        registry.add_peer(peer, peer_state(320));

        let (mut fetcher, mut responses) =
            fetcher_with(dialer, registry, SyncMode::StopOnFinalized);

        fetcher.schedule(1, 64);
        let response = block_on(responses.next()).unwrap();
        assert!(matches!(
            response.outcome,
            FetchOutcome::Failed {
                failure: FetchFailure::Transient,
                ..
            }
        ));
    }

    #[test]
    fn fetch_from_interrogates_a_specific_peer() {
        let peer = PeerId([1; 32]);
        let dialer = TestDialer::default();
        dialer.add_peer(peer, linear_chain(1, 100, [0; 32], 0), Tamper::None);
        let registry = Arc::new(TestRegistry::default());
        registry.add_peer(peer, peer_state(100));

        let (fetcher, _responses) = fetcher_with(dialer, registry, SyncMode::StopOnFinalized);

        let blocks = block_on(fetcher.fetch_from(
            &peer,
            &BlocksByRangeRequest {
                start_slot: 33,
                step: 1,
                count: 16,
            },
        ))
        .unwrap();
        assert_eq!(blocks.len(), 16);
        assert_eq!(blocks.first().unwrap().slot(), 33);
    }

    #[test]
    fn majority_vote_prefers_most_supported_epoch() {
        let registry = TestRegistry::default();
        registry.add_peer(PeerId([1; 32]), peer_state(320)); // finalized epoch 10
        registry.add_peer(PeerId([2; 32]), peer_state(320));
        registry.add_peer(PeerId([3; 32]), peer_state(640)); // finalized epoch 20

        assert_eq!(super::best_finalized_epoch(&registry), 10);
        assert_eq!(super::best_head_slot(&registry), 640);
        assert_eq!(super::num_peers_serving(&registry, 640), 1);
        assert_eq!(super::num_peers_serving(&registry, 1), 3);
    }
}
