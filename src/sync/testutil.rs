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

//! Test fixtures for the synchronization modules: an in-memory peer registry, block store,
//! block receiver, and a dialer whose streams answer blocks-by-range requests from a
//! per-peer chain of blocks, entirely in memory.

#![cfg(test)]

use core::{
    pin::Pin,
    task::{Context, Poll},
};
use std::io;
use std::time::Instant;

use futures::prelude::*;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::block::{BeaconBlock, SignedBeaconBlock};
use crate::chain::{
    BlockFilter, BlockStore, Checkpoint, ForkChoice, PeerChainState, PeerRegistry, StoreError,
};
use crate::network::protocol::{self, StatusCode};
use crate::network::{DialError, PeerId, StreamDialer};
use crate::util::leb128;

/// Builds a linear chain of `count` blocks starting at `start_slot`, anchored on
/// `parent_root`. `body_tag` differentiates otherwise-identical forks.
pub(crate) fn linear_chain(
    start_slot: u64,
    count: u64,
    parent_root: [u8; 32],
    body_tag: u8,
) -> Vec<SignedBeaconBlock> {
    let mut out = Vec::new();
    let mut parent_root = parent_root;
    for slot in start_slot..start_slot + count {
        let block = SignedBeaconBlock {
            message: BeaconBlock {
                slot,
                proposer_index: slot % 64,
                parent_root,
                state_root: [0; 32],
                body: vec![body_tag],
            },
            signature: [0; 96],
        };
        parent_root = block.block_root();
        out.push(block);
    }
    out
}

/// In-memory block store.
#[derive(Default)]
pub(crate) struct TestStore {
    blocks: Mutex<Vec<(SignedBeaconBlock, [u8; 32])>>,
}

impl TestStore {
    pub fn insert(&self, block: SignedBeaconBlock) {
        let root = block.block_root();
        let mut blocks = self.blocks.lock();
        if !blocks.iter().any(|(_, r)| *r == root) {
            blocks.push((block, root));
        }
    }

    pub fn highest_slot(&self) -> u64 {
        self.blocks
            .lock()
            .iter()
            .map(|(b, _)| b.slot())
            .max()
            .unwrap_or(0)
    }
}

impl BlockStore for TestStore {
    fn has_block(&self, block_root: &[u8; 32]) -> bool {
        self.blocks.lock().iter().any(|(_, r)| r == block_root)
    }
    fn block(&self, block_root: &[u8; 32]) -> Result<Option<SignedBeaconBlock>, StoreError> {
        Ok(self
            .blocks
            .lock()
            .iter()
            .find(|(_, r)| r == block_root)
            .map(|(b, _)| b.clone()))
    }
    fn blocks_in_range(
        &self,
        filter: &BlockFilter,
    ) -> Result<Vec<(SignedBeaconBlock, [u8; 32])>, StoreError> {
        Ok(self
            .blocks
            .lock()
            .iter()
            .filter(|(b, _)| b.slot() >= filter.start_slot && b.slot() <= filter.end_slot)
            .cloned()
            .collect())
    }
    fn genesis_block(&self) -> Result<Option<SignedBeaconBlock>, StoreError> {
        Ok(self
            .blocks
            .lock()
            .iter()
            .find(|(b, _)| b.slot() == 0)
            .map(|(b, _)| b.clone()))
    }
    fn save_block(&self, block: SignedBeaconBlock) -> Result<(), StoreError> {
        self.insert(block);
        Ok(())
    }
    fn save_genesis_block_root(&self, _: [u8; 32]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Fork-choice view backed by plain fields.
pub(crate) struct TestForkChoice {
    pub head_slot: Mutex<u64>,
    pub head_root: Mutex<[u8; 32]>,
    pub finalized: Mutex<Checkpoint>,
    pub current_slot: u64,
}

impl TestForkChoice {
    pub fn new(current_slot: u64) -> Self {
        TestForkChoice {
            head_slot: Mutex::new(0),
            head_root: Mutex::new([0; 32]),
            finalized: Mutex::new(Checkpoint {
                epoch: 0,
                root: [0; 32],
            }),
            current_slot,
        }
    }
}

impl ForkChoice for TestForkChoice {
    fn is_canonical(&self, _: &[u8; 32]) -> bool {
        true
    }
    fn finalized_checkpoint(&self) -> Checkpoint {
        *self.finalized.lock()
    }
    fn head_slot(&self) -> u64 {
        *self.head_slot.lock()
    }
    fn head_root(&self) -> [u8; 32] {
        *self.head_root.lock()
    }
    fn current_slot(&self) -> u64 {
        self.current_slot
    }
}

/// Peer registry backed by a plain map.
#[derive(Default)]
pub(crate) struct TestRegistry {
    peers: Mutex<HashMap<PeerId, PeerChainState>>,
    bad_responses: Mutex<HashMap<PeerId, u32>>,
}

impl TestRegistry {
    pub fn add_peer(&self, peer: PeerId, state: PeerChainState) {
        self.peers.lock().insert(peer, state);
    }
}

impl PeerRegistry for TestRegistry {
    fn connected(&self) -> Vec<PeerId> {
        self.peers.lock().keys().copied().collect()
    }
    fn chain_state(&self, peer: &PeerId) -> Option<PeerChainState> {
        self.peers.lock().get(peer).cloned()
    }
    fn is_bad(&self, peer: &PeerId) -> bool {
        self.bad_responses
            .lock()
            .get(peer)
            .map_or(false, |count| *count >= crate::chain::MAX_BAD_RESPONSES)
    }
    fn set_next_valid_time(&self, _: &PeerId, _: Instant) {}
    fn best_non_finalized(&self, max_peers: usize, epoch: u64) -> Vec<PeerId> {
        let peers = self.peers.lock();
        let mut out: Vec<(PeerId, u64)> = peers
            .iter()
            .filter(|(_, state)| crate::block::slot_to_epoch(state.head_slot) > epoch)
            .map(|(peer, state)| (*peer, state.head_slot))
            .collect();
        out.sort_by_key(|(_, head)| core::cmp::Reverse(*head));
        out.truncate(max_peers);
        out.into_iter().map(|(peer, _)| peer).collect()
    }
    fn report_bad_response(&self, peer: &PeerId) {
        *self.bad_responses.lock().entry(*peer).or_insert(0) += 1;
    }
    fn bad_response_count(&self, peer: &PeerId) -> u32 {
        self.bad_responses.lock().get(peer).copied().unwrap_or(0)
    }
    fn report_blocks_provided(&self, _: &PeerId, _: u64) {}
}

/// How a test peer mangles its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tamper {
    /// Honest peer.
    None,
    /// Blocks served in reverse slot order.
    ReverseOrder,
    /// The dial itself fails.
    Unreachable,
}

/// Dialer whose streams answer blocks-by-range requests from a per-peer chain.
#[derive(Default)]
pub(crate) struct TestDialer {
    chains: Mutex<HashMap<PeerId, (Vec<SignedBeaconBlock>, Tamper)>>,
}

impl TestDialer {
    pub fn add_peer(&self, peer: PeerId, chain: Vec<SignedBeaconBlock>, tamper: Tamper) {
        self.chains.lock().insert(peer, (chain, tamper));
    }
}

impl StreamDialer for TestDialer {
    type Stream = ServedStream;
    type DialFuture = future::Ready<Result<ServedStream, DialError>>;

    fn open_stream(&self, peer: &PeerId, _protocol: &'static str) -> Self::DialFuture {
        let (chain, tamper) = self
            .chains
            .lock()
            .get(peer)
            .cloned()
            .unwrap_or((Vec::new(), Tamper::None));
        if tamper == Tamper::Unreachable {
            return future::ready(Err(DialError("unreachable".to_owned())));
        }
        future::ready(Ok(ServedStream {
            chain,
            tamper,
            written: Vec::new(),
            response: None,
        }))
    }
}

/// Stream returned by [`TestDialer`]: buffers the request written to it, and serves the
/// matching response once read.
pub(crate) struct ServedStream {
    chain: Vec<SignedBeaconBlock>,
    tamper: Tamper,
    written: Vec<u8>,
    response: Option<futures::io::Cursor<Vec<u8>>>,
}

impl ServedStream {
    /// Parses the buffered request and lays out the response bytes.
    fn build_response(&mut self) -> Vec<u8> {
        // Request layout: protocol-id frame, then one chunk (status byte + frame).
        let parsed = (|| -> Option<protocol::BlocksByRangeRequest> {
            let input = &self.written[..];
            let (input, id_len) =
                leb128::nom_leb128_usize::<nom::error::Error<&[u8]>>(input).ok()?;
            let input = input.get(id_len..)?;
            let (input, status) = (input.get(1..)?, *input.first()?);
            if status != StatusCode::Success.to_byte() {
                return None;
            }
            let (input, payload_len) =
                leb128::nom_leb128_usize::<nom::error::Error<&[u8]>>(input).ok()?;
            let payload = input.get(..payload_len)?;
            protocol::decode_blocks_by_range_request(payload).ok()
        })();

        let request = match parsed {
            Some(request) => request,
            None => return Vec::new(),
        };

        let mut blocks: Vec<&SignedBeaconBlock> = self
            .chain
            .iter()
            .filter(|b| b.slot() >= request.start_slot && b.slot() < request.end_slot())
            .collect();
        blocks.sort_by_key(|b| b.slot());
        if self.tamper == Tamper::ReverseOrder {
            blocks.reverse();
        }

        let mut out = Vec::new();
        for block in blocks {
            let payload = protocol::build_signed_block(block);
            out.push(StatusCode::Success.to_byte());
            out.extend(leb128::encode_usize(payload.len()));
            out.extend_from_slice(&payload);
        }
        out
    }
}

impl AsyncWrite for ServedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ServedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if self.response.is_none() {
            let bytes = self.build_response();
            self.response = Some(futures::io::Cursor::new(bytes));
        }
        Pin::new(self.response.as_mut().unwrap()).poll_read(cx, buf)
    }
}
