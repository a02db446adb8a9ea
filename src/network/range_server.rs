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

//! Responder side of the blocks protocols.
//!
//! [`serve_blocks_by_range`] and [`serve_blocks_by_root`] each handle one inbound stream:
//! they read the request, admit it through the rate limiter, then stream the matching
//! blocks back as success chunks.
//!
//! The range protocol is served in batches, paced by a one-second ticker, so that one peer
//! can't make the local node read and serve an arbitrarily large range at full speed. Within
//! each batch, the blocks read from the store are deduplicated, sorted, and filtered down to
//! the canonical chain; see [`serve_blocks_by_range`] for the exact rules.

use core::time::Duration;
use std::time::Instant;

use futures::prelude::*;
use futures_timer::Delay;
use itertools::Itertools as _;

use super::codec::{self, CodecError, RESP_TIMEOUT};
use super::protocol::{
    self, BlocksByRangeRequest, RangeRequestPolicyViolation, StatusCode, BLOCKS_PER_SECOND,
};
use super::rate_limiter::RateLimiter;
use super::PeerId;
use crate::block::SignedBeaconBlock;
use crate::chain::{BlockFilter, BlockStore, ForkChoice, PeerRegistry, StoreError};

/// Error potentially returned by the serving functions of this module.
///
/// Apart from [`ServeError::Codec`], all of these describe exchanges that terminated in a
/// protocol-defined way; they are returned so that the embedder can log them, not because
/// anything is left to clean up.
#[derive(Debug, derive_more::Display)]
pub enum ServeError {
    /// Failure of the underlying stream.
    #[display(fmt = "Stream failure: {}", _0)]
    Codec(CodecError),
    /// The request doesn't decode. An error chunk has been sent, and the requester has been
    /// penalized.
    #[display(fmt = "Undecodable request: {}", _0)]
    UndecodableRequest(protocol::DecodeRequestError),
    /// The request doesn't pass validation. An error chunk has been sent, and the requester
    /// has been penalized.
    #[display(fmt = "Invalid request: {}", _0)]
    InvalidRequest(RangeRequestPolicyViolation),
    /// The requester's rate-limiter bucket can't cover the request. An error chunk has been
    /// sent.
    RateLimited,
    /// The blocks read from the store don't form a linear chain. The response has been
    /// truncated at the first break; deliberately not reported to the requester as an error.
    DisjointChain,
    /// The store failed. A server-error chunk has been sent.
    #[display(fmt = "Store failure: {}", _0)]
    Store(StoreError),
}

/// Handles one inbound blocks-by-range stream.
///
/// Reads and validates the request, then serves the blocks in batches of up to
/// [`BLOCKS_PER_SECOND`] grid slots each, one batch per second. For every batch, the blocks
/// read from the store are:
///
/// - deduplicated by root, keeping the first occurrence;
/// - sorted by `(slot, root)`, the root being a deterministic tie-break between forked
///   blocks at the same slot;
/// - filtered down to blocks that are on the requested slot-step grid and marked canonical
///   by the fork-choice view;
/// - when `step` is 1, checked to extend a linear chain: each served block must have the
///   previously-served block's root as its parent. The anchor survives across batches
///   within this one response. The first block that breaks the chain is still served, then
///   the stream ends; the requester sees a truncated but otherwise valid response.
///
/// A request covering slot 0 has the genesis block prepended to its first batch.
#[tracing::instrument(
    level = "trace",
    skip(stream, store, fork_choice, peers, rate_limiter)
)]
pub async fn serve_blocks_by_range<TStream, TStore, TFc, TReg>(
    stream: &mut TStream,
    peer: &PeerId,
    store: &TStore,
    fork_choice: &TFc,
    peers: &TReg,
    rate_limiter: &futures::lock::Mutex<RateLimiter>,
) -> Result<(), ServeError>
where
    TStream: AsyncRead + AsyncWrite + Unpin,
    TStore: BlockStore,
    TFc: ForkChoice,
    TReg: PeerRegistry,
{
    // Read and decode the request.
    let payload = match read_request(stream, protocol::BLOCKS_BY_RANGE_PROTOCOL).await? {
        Some(payload) => payload,
        // The requester went away without asking anything.
        None => return Ok(()),
    };

    let request = match protocol::decode_blocks_by_range_request(&payload) {
        Ok(request) => request,
        Err(err) => {
            peers.report_bad_response(peer);
            codec::write_error(
                stream,
                StatusCode::InvalidRequest,
                "undecodable request",
                RESP_TIMEOUT,
            )
            .await
            .map_err(ServeError::Codec)?;
            return Err(ServeError::UndecodableRequest(err));
        }
    };

    if let Err(violation) = request.validate(fork_choice.current_slot()) {
        peers.report_bad_response(peer);
        codec::write_error(
            stream,
            StatusCode::InvalidRequest,
            &violation.to_string(),
            RESP_TIMEOUT,
        )
        .await
        .map_err(ServeError::Codec)?;
        return Err(ServeError::InvalidRequest(violation));
    }

    // Admission control. The up-front check covers one second's worth of blocks; each batch
    // then debits what it actually spanned.
    if rate_limiter
        .lock()
        .await
        .validate(
            protocol::BLOCKS_BY_RANGE_PROTOCOL,
            peer,
            BLOCKS_PER_SECOND,
            Instant::now(),
        )
        .is_err()
    {
        peers.report_bad_response(peer);
        codec::write_error(stream, StatusCode::RateLimited, "rate limited", RESP_TIMEOUT)
            .await
            .map_err(ServeError::Codec)?;
        return Err(ServeError::RateLimited);
    }

    tracing::debug!(
        %peer,
        start_slot = request.start_slot,
        step = request.step,
        count = request.count,
        "serving-blocks-by-range"
    );

    // Last slot on the request's grid, inclusive.
    let last_slot = request
        .start_slot
        .saturating_add(request.step.saturating_mul(request.count - 1));

    // Root of the previously-served block. Threaded through every batch of this response,
    // and deliberately local to it: a new request starts from a clean anchor.
    let mut prev_root: Option<[u8; 32]> = None;

    let mut batch_start = request.start_slot;
    loop {
        // The batch covers `BLOCKS_PER_SECOND` consecutive grid slots.
        let batch_end = core::cmp::min(
            batch_start.saturating_add(request.step * (BLOCKS_PER_SECOND - 1)),
            last_slot,
        );

        let batch = match read_batch(store, batch_start, batch_end) {
            Ok(batch) => batch,
            Err(err) => {
                codec::write_error(
                    stream,
                    StatusCode::ServerError,
                    "store failure",
                    RESP_TIMEOUT,
                )
                .await
                .map_err(ServeError::Codec)?;
                return Err(ServeError::Store(err));
            }
        };

        let (to_send, disjoint) = filter_blocks(batch, &request, fork_choice, &mut prev_root);

        for (block, _root) in &to_send {
            let chunk = protocol::build_signed_block(block);
            codec::write_chunk(stream, &chunk, RESP_TIMEOUT)
                .await
                .map_err(ServeError::Codec)?;
        }

        rate_limiter.lock().await.add(
            protocol::BLOCKS_BY_RANGE_PROTOCOL,
            peer,
            1 + (batch_end - batch_start) / request.step,
            Instant::now(),
        );

        if disjoint {
            tracing::debug!(%peer, slot = batch_start, "blocks-by-range-disjoint-chain");
            return Err(ServeError::DisjointChain);
        }

        match batch_end.checked_add(request.step) {
            Some(next) if next <= last_slot => batch_start = next,
            _ => break,
        }

        // Pace the stream: one batch per second.
        Delay::new(Duration::from_secs(1)).await;
    }

    peers.report_blocks_provided(peer, request.count);
    Ok(())
}

/// Handles one inbound blocks-by-root stream.
///
/// Every requested root that resolves to a block in the store is served as one success
/// chunk, in the order of the request. Unknown roots are silently skipped.
#[tracing::instrument(level = "trace", skip(stream, store, peers, rate_limiter))]
pub async fn serve_blocks_by_root<TStream, TStore, TReg>(
    stream: &mut TStream,
    peer: &PeerId,
    store: &TStore,
    peers: &TReg,
    rate_limiter: &futures::lock::Mutex<RateLimiter>,
) -> Result<(), ServeError>
where
    TStream: AsyncRead + AsyncWrite + Unpin,
    TStore: BlockStore,
    TReg: PeerRegistry,
{
    let payload = match read_request(stream, protocol::BLOCKS_BY_ROOT_PROTOCOL).await? {
        Some(payload) => payload,
        None => return Ok(()),
    };

    let roots = match protocol::decode_blocks_by_root_request(&payload) {
        Ok(roots) => roots,
        Err(err) => {
            peers.report_bad_response(peer);
            codec::write_error(
                stream,
                StatusCode::InvalidRequest,
                "undecodable request",
                RESP_TIMEOUT,
            )
            .await
            .map_err(ServeError::Codec)?;
            return Err(ServeError::UndecodableRequest(err));
        }
    };

    let cost = u64::try_from(roots.len()).unwrap();
    if rate_limiter
        .lock()
        .await
        .validate(protocol::BLOCKS_BY_ROOT_PROTOCOL, peer, cost, Instant::now())
        .is_err()
    {
        peers.report_bad_response(peer);
        codec::write_error(stream, StatusCode::RateLimited, "rate limited", RESP_TIMEOUT)
            .await
            .map_err(ServeError::Codec)?;
        return Err(ServeError::RateLimited);
    }
    rate_limiter
        .lock()
        .await
        .add(protocol::BLOCKS_BY_ROOT_PROTOCOL, peer, cost, Instant::now());

    let mut num_served = 0;
    for root in &roots {
        let block = match store.block(root) {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(err) => {
                codec::write_error(
                    stream,
                    StatusCode::ServerError,
                    "store failure",
                    RESP_TIMEOUT,
                )
                .await
                .map_err(ServeError::Codec)?;
                return Err(ServeError::Store(err));
            }
        };

        let chunk = protocol::build_signed_block(&block);
        codec::write_chunk(stream, &chunk, RESP_TIMEOUT)
            .await
            .map_err(ServeError::Codec)?;
        num_served += 1;
    }

    peers.report_blocks_provided(peer, num_served);
    Ok(())
}

/// Reads the request chunk that opens an inbound stream. Returns `None` if the requester
/// closed the stream without sending one.
async fn read_request<TStream>(
    stream: &mut TStream,
    protocol_id: &str,
) -> Result<Option<Vec<u8>>, ServeError>
where
    TStream: AsyncRead + AsyncWrite + Unpin,
{
    match codec::read_chunk(stream, true, protocol_id, RESP_TIMEOUT)
        .await
        .map_err(ServeError::Codec)?
    {
        codec::Chunk::Payload(payload) => Ok(Some(payload)),
        codec::Chunk::EndOfStream | codec::Chunk::Error { .. } => Ok(None),
    }
}

/// Reads one batch's blocks from the store, prepending the genesis block if the batch
/// covers slot 0.
fn read_batch<TStore>(
    store: &TStore,
    batch_start: u64,
    batch_end: u64,
) -> Result<Vec<(SignedBeaconBlock, [u8; 32])>, StoreError>
where
    TStore: BlockStore,
{
    let mut blocks = Vec::new();

    if batch_start == 0 {
        if let Some(genesis) = store.genesis_block()? {
            let root = genesis.block_root();
            blocks.push((genesis, root));
        }
    }

    blocks.extend(store.blocks_in_range(&BlockFilter {
        start_slot: batch_start,
        end_slot: batch_end,
    })?);

    Ok(blocks)
}

/// Deduplicates, sorts, and filters one batch. Returns the blocks to serve, plus whether
/// the linear chain broke; in that case the last returned block is the breaking one and the
/// stream must end after it.
fn filter_blocks<TFc>(
    batch: Vec<(SignedBeaconBlock, [u8; 32])>,
    request: &BlocksByRangeRequest,
    fork_choice: &TFc,
    prev_root: &mut Option<[u8; 32]>,
) -> (Vec<(SignedBeaconBlock, [u8; 32])>, bool)
where
    TFc: ForkChoice,
{
    debug_assert_ne!(request.step, 0);

    let sorted = batch
        .into_iter()
        .unique_by(|(_, root)| *root)
        .sorted_by_key(|(block, root)| (block.slot(), *root));

    let mut out = Vec::new();
    for (block, root) in sorted {
        // Off-grid and non-canonical blocks are silently skipped; they don't participate in
        // the linearity check either.
        let on_grid = block.slot() >= request.start_slot
            && (block.slot() - request.start_slot) % request.step == 0;
        if !on_grid || !fork_choice.is_canonical(&root) {
            continue;
        }

        if let Some(prev) = prev_root.as_ref() {
            if request.step == 1 && block.parent_root() != *prev {
                out.push((block, root));
                return (out, true);
            }
        }

        *prev_root = Some(root);
        out.push((block, root));
    }

    (out, false)
}
