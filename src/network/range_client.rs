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

//! Requester side of the request-response protocols.
//!
//! The functions of this module write one request on a freshly-opened stream and collect the
//! response chunks, enforcing the protocol invariants chunk by chunk. A response that
//! violates them aborts the exchange with [`FetchError::InvalidFetchedData`]; the caller is
//! expected to penalize the peer, because a violation is never the result of an honest
//! remote talking to an honest network.
//!
//! Nothing here checks parent links or canonicality: a response can be protocol-conformant
//! and still carry blocks from a fork the local node will end up discarding. Sorting that
//! out is the job of the synchronization queue and of the chain-processing layer.

use std::time::Instant;

use futures::prelude::*;

use super::codec::{self, Chunk, CodecError, RESP_TIMEOUT};
use super::protocol::{
    self, BlocksByRangeRequest, GoodbyeReason, StatusCode, MAX_REQUEST_BLOCKS,
};
use super::PeerId;
use crate::block::SignedBeaconBlock;
use crate::chain::PeerRegistry;

/// Error potentially returned by the fetching functions of this module.
#[derive(Debug, derive_more::Display)]
pub enum FetchError {
    /// Failure of the underlying stream. Transient; the peer isn't at fault.
    #[display(fmt = "Stream failure: {}", _0)]
    Codec(CodecError),
    /// The remote answered with an error chunk instead of blocks.
    #[display(fmt = "Remote refused: {}", reason)]
    Remote {
        status: StatusCode,
        reason: String,
    },
    /// The response violates the protocol invariants. The peer should be penalized.
    #[display(fmt = "Invalid fetched data: {}", _0)]
    InvalidFetchedData(ResponseViolation),
}

/// Way in which a response violates the protocol invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ResponseViolation {
    /// More chunks than requested blocks.
    TooManyChunks,
    /// A chunk doesn't decode to a block.
    UndecodableBlock,
    /// A block's slot is outside the requested range.
    SlotOutOfRange,
    /// Block slots aren't strictly increasing.
    NonMonotonicSlot,
    /// The difference between two consecutive block slots isn't a multiple of the requested
    /// step.
    OffStepSlot,
    /// A block wasn't requested, or was served twice.
    UnrequestedRoot,
}

/// Sends a blocks-by-range request on the given stream and collects the response.
///
/// For each received chunk, enforces in order: the chunk index is below both the requested
/// count and [`MAX_REQUEST_BLOCKS`]; the block's slot lies within the requested range; and,
/// past the first chunk, slots are strictly increasing with differences that are multiples
/// of the requested step.
#[tracing::instrument(level = "trace", skip(stream))]
pub async fn blocks_by_range<TStream>(
    stream: &mut TStream,
    request: &BlocksByRangeRequest,
) -> Result<Vec<SignedBeaconBlock>, FetchError>
where
    TStream: AsyncRead + AsyncWrite + Unpin,
{
    codec::write_protocol_id(stream, protocol::BLOCKS_BY_RANGE_PROTOCOL, RESP_TIMEOUT)
        .await
        .map_err(FetchError::Codec)?;
    let payload = protocol::build_blocks_by_range_request(request);
    codec::write_chunk(stream, &payload, RESP_TIMEOUT)
        .await
        .map_err(FetchError::Codec)?;

    let mut blocks: Vec<SignedBeaconBlock> = Vec::new();

    loop {
        let chunk = codec::read_chunk(
            stream,
            false,
            protocol::BLOCKS_BY_RANGE_PROTOCOL,
            RESP_TIMEOUT,
        )
        .await
        .map_err(FetchError::Codec)?;

        let payload = match chunk {
            Chunk::Payload(payload) => payload,
            Chunk::Error { status, reason } => {
                return Err(FetchError::Remote { status, reason })
            }
            Chunk::EndOfStream => break,
        };

        if u64::try_from(blocks.len()).unwrap() >= request.count.min(MAX_REQUEST_BLOCKS) {
            return Err(FetchError::InvalidFetchedData(
                ResponseViolation::TooManyChunks,
            ));
        }

        let block = protocol::decode_signed_block(&payload)
            .map_err(|_| FetchError::InvalidFetchedData(ResponseViolation::UndecodableBlock))?;

        if block.slot() < request.start_slot || block.slot() >= request.end_slot() {
            return Err(FetchError::InvalidFetchedData(
                ResponseViolation::SlotOutOfRange,
            ));
        }

        if let Some(prev) = blocks.last() {
            if block.slot() <= prev.slot() {
                return Err(FetchError::InvalidFetchedData(
                    ResponseViolation::NonMonotonicSlot,
                ));
            }
            if (block.slot() - prev.slot()) % request.step != 0 {
                return Err(FetchError::InvalidFetchedData(
                    ResponseViolation::OffStepSlot,
                ));
            }
        }

        blocks.push(block);
    }

    Ok(blocks)
}

/// Sends a blocks-by-root request on the given stream and collects the response.
///
/// Every returned block must be one of the requested roots, and no root may be served
/// twice.
#[tracing::instrument(level = "trace", skip(stream, roots))]
pub async fn blocks_by_root<TStream>(
    stream: &mut TStream,
    roots: &[[u8; 32]],
) -> Result<Vec<SignedBeaconBlock>, FetchError>
where
    TStream: AsyncRead + AsyncWrite + Unpin,
{
    codec::write_protocol_id(stream, protocol::BLOCKS_BY_ROOT_PROTOCOL, RESP_TIMEOUT)
        .await
        .map_err(FetchError::Codec)?;
    let payload = protocol::build_blocks_by_root_request(roots);
    codec::write_chunk(stream, &payload, RESP_TIMEOUT)
        .await
        .map_err(FetchError::Codec)?;

    let mut blocks: Vec<SignedBeaconBlock> = Vec::new();
    let mut remaining: Vec<[u8; 32]> = roots.to_vec();

    loop {
        let chunk = codec::read_chunk(
            stream,
            false,
            protocol::BLOCKS_BY_ROOT_PROTOCOL,
            RESP_TIMEOUT,
        )
        .await
        .map_err(FetchError::Codec)?;

        let payload = match chunk {
            Chunk::Payload(payload) => payload,
            Chunk::Error { status, reason } => {
                return Err(FetchError::Remote { status, reason })
            }
            Chunk::EndOfStream => break,
        };

        let block = protocol::decode_signed_block(&payload)
            .map_err(|_| FetchError::InvalidFetchedData(ResponseViolation::UndecodableBlock))?;

        // Serving a root twice removes it the first time, so the second occurrence fails
        // the lookup just like a root that was never requested.
        let block_root = block.block_root();
        match remaining.iter().position(|root| *root == block_root) {
            Some(position) => {
                remaining.swap_remove(position);
            }
            None => {
                return Err(FetchError::InvalidFetchedData(
                    ResponseViolation::UnrequestedRoot,
                ))
            }
        }

        blocks.push(block);
    }

    Ok(blocks)
}

/// Sends a goodbye message on the given stream. One-shot: the stream carries no response.
#[tracing::instrument(level = "trace", skip(stream))]
pub async fn say_goodbye<TStream>(
    stream: &mut TStream,
    reason: GoodbyeReason,
) -> Result<(), CodecError>
where
    TStream: AsyncWrite + Unpin,
{
    codec::write_protocol_id(stream, protocol::GOODBYE_PROTOCOL, RESP_TIMEOUT).await?;
    let payload = protocol::build_goodbye(reason);
    codec::write_chunk(stream, &payload, RESP_TIMEOUT).await
}

/// Processes a goodbye received from a peer: forbids dialing it again for the duration the
/// policy table associates with the reason.
pub fn on_goodbye_received<TReg>(peers: &TReg, peer: &PeerId, reason: GoodbyeReason)
where
    TReg: PeerRegistry,
{
    let backoff = reason.dial_backoff();
    tracing::debug!(%peer, ?reason, ?backoff, "goodbye-received");
    peers.set_next_valid_time(peer, Instant::now() + backoff);
}

#[cfg(test)]
mod tests {
    use futures::{executor::block_on, io::Cursor, prelude::*};

    use super::{FetchError, ResponseViolation};
    use crate::block::{BeaconBlock, SignedBeaconBlock};
    use crate::network::codec::{self, RESP_TIMEOUT};
    use crate::network::protocol::{self, BlocksByRangeRequest, StatusCode};

    use core::{pin::Pin, task::Context, task::Poll};
    use std::io;

    struct DuplexStream {
        read: Cursor<Vec<u8>>,
        write: Cursor<Vec<u8>>,
    }

    impl DuplexStream {
        fn new(inbound: Vec<u8>) -> Self {
            DuplexStream {
                read: Cursor::new(inbound),
                write: Cursor::new(Vec::new()),
            }
        }
    }

    impl AsyncRead for DuplexStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.read).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for DuplexStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.write).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.write).poll_flush(cx)
        }
        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.write).poll_close(cx)
        }
    }

    fn block_at(slot: u64, parent_root: [u8; 32]) -> SignedBeaconBlock {
        SignedBeaconBlock {
            message: BeaconBlock {
                slot,
                proposer_index: slot % 64,
                parent_root,
                state_root: [0; 32],
                body: Vec::new(),
            },
            signature: [0; 96],
        }
    }

    fn recorded_response(blocks: &[SignedBeaconBlock]) -> Vec<u8> {
        block_on(async {
            let mut stream = Cursor::new(Vec::new());
            for block in blocks {
                let payload = protocol::build_signed_block(block);
                codec::write_chunk(&mut stream, &payload, RESP_TIMEOUT)
                    .await
                    .unwrap();
            }
            stream.into_inner()
        })
    }

    #[test]
    fn collects_conformant_response() {
        let response = [
            block_at(10, [0; 32]),
            block_at(12, [1; 32]),
            block_at(16, [2; 32]),
        ];
        let mut stream = DuplexStream::new(recorded_response(&response));

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 2,
            count: 8,
        };
        let obtained = block_on(super::blocks_by_range(&mut stream, &request)).unwrap();
        assert_eq!(obtained, response.to_vec());
    }

    #[test]
    fn empty_response_is_fine() {
        let mut stream = DuplexStream::new(Vec::new());
        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 1,
            count: 8,
        };
        assert!(block_on(super::blocks_by_range(&mut stream, &request))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn too_many_chunks_rejected() {
        let response = [
            block_at(10, [0; 32]),
            block_at(11, [0; 32]),
            block_at(12, [0; 32]),
        ];
        let mut stream = DuplexStream::new(recorded_response(&response));

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 1,
            count: 2,
        };
        assert!(matches!(
            block_on(super::blocks_by_range(&mut stream, &request)),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::TooManyChunks
            ))
        ));
    }

    #[test]
    fn out_of_range_slot_rejected() {
        let response = [block_at(30, [0; 32])];
        let mut stream = DuplexStream::new(recorded_response(&response));

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 1,
            count: 8,
        };
        assert!(matches!(
            block_on(super::blocks_by_range(&mut stream, &request)),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::SlotOutOfRange
            ))
        ));
    }

    #[test]
    fn non_monotonic_slots_rejected() {
        let response = [block_at(12, [0; 32]), block_at(11, [0; 32])];
        let mut stream = DuplexStream::new(recorded_response(&response));

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 1,
            count: 8,
        };
        assert!(matches!(
            block_on(super::blocks_by_range(&mut stream, &request)),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::NonMonotonicSlot
            ))
        ));
    }

    #[test]
    fn off_step_slots_rejected() {
        let response = [block_at(10, [0; 32]), block_at(13, [0; 32])];
        let mut stream = DuplexStream::new(recorded_response(&response));

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 2,
            count: 8,
        };
        assert!(matches!(
            block_on(super::blocks_by_range(&mut stream, &request)),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::OffStepSlot
            ))
        ));
    }

    #[test]
    fn error_chunk_is_surfaced() {
        let inbound = block_on(async {
            let mut stream = Cursor::new(Vec::new());
            codec::write_error(
                &mut stream,
                StatusCode::RateLimited,
                "rate limited",
                RESP_TIMEOUT,
            )
            .await
            .unwrap();
            stream.into_inner()
        });
        let mut stream = DuplexStream::new(inbound);

        let request = BlocksByRangeRequest {
            start_slot: 10,
            step: 1,
            count: 8,
        };
        assert!(matches!(
            block_on(super::blocks_by_range(&mut stream, &request)),
            Err(FetchError::Remote {
                status: StatusCode::RateLimited,
                ..
            })
        ));
    }

    #[test]
    fn by_root_accepts_requested_blocks_only() {
        let requested = block_at(10, [0; 32]);
        let unrequested = block_at(11, [0; 32]);

        let mut stream = DuplexStream::new(recorded_response(&[requested.clone()]));
        let obtained =
            block_on(super::blocks_by_root(&mut stream, &[requested.block_root()])).unwrap();
        assert_eq!(obtained, vec![requested.clone()]);

        let mut stream = DuplexStream::new(recorded_response(&[unrequested]));
        assert!(matches!(
            block_on(super::blocks_by_root(&mut stream, &[requested.block_root()])),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::UnrequestedRoot
            ))
        ));
    }

    #[test]
    fn by_root_rejects_duplicates() {
        let block = block_at(10, [0; 32]);
        let mut stream = DuplexStream::new(recorded_response(&[block.clone(), block.clone()]));
        assert!(matches!(
            block_on(super::blocks_by_root(&mut stream, &[block.block_root()])),
            Err(FetchError::InvalidFetchedData(
                ResponseViolation::UnrequestedRoot
            ))
        ));
    }

    #[test]
    fn goodbye_applies_policy_backoff() {
        use crate::chain::{PeerChainState, PeerRegistry};
        use crate::network::protocol::GoodbyeReason;
        use core::time::Duration;
        use std::time::Instant;

        #[derive(Default)]
        struct Registry {
            next_valid: parking_lot::Mutex<Option<Instant>>,
        }

        impl PeerRegistry for Registry {
            fn connected(&self) -> Vec<crate::network::PeerId> {
                Vec::new()
            }
            fn chain_state(&self, _: &crate::network::PeerId) -> Option<PeerChainState> {
                None
            }
            fn is_bad(&self, _: &crate::network::PeerId) -> bool {
                false
            }
            fn set_next_valid_time(&self, _: &crate::network::PeerId, when: Instant) {
                *self.next_valid.lock() = Some(when);
            }
            fn best_non_finalized(&self, _: usize, _: u64) -> Vec<crate::network::PeerId> {
                Vec::new()
            }
            fn report_bad_response(&self, _: &crate::network::PeerId) {}
            fn bad_response_count(&self, _: &crate::network::PeerId) -> u32 {
                0
            }
            fn report_blocks_provided(&self, _: &crate::network::PeerId, _: u64) {}
        }

        let registry = Registry::default();
        let before = Instant::now();
        super::on_goodbye_received(
            &registry,
            &crate::network::PeerId([1; 32]),
            GoodbyeReason::Banned,
        );

        let until = registry.next_valid.lock().take().unwrap();
        assert!(until >= before + Duration::from_secs(24 * 3600));
    }
}
