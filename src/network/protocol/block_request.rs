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

use prost::Message as _;

use super::{schema, ProtobufDecodeError, MAX_REQUEST_BLOCKS, RANGE_LIMIT};
use crate::block::{BeaconBlock, SignedBeaconBlock};

/// Description of a blocks-by-range request that can be sent to a peer.
///
/// A conformant response contains blocks whose slots lie in
/// `[start_slot, start_slot + step * count)`, in strictly increasing slot order, with every
/// consecutive slot difference an integer multiple of `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlocksByRangeRequest {
    /// Slot of the first requested block.
    pub start_slot: u64,
    /// Distance, in slots, between two consecutive requested blocks. `1` means every slot.
    pub step: u64,
    /// Number of blocks requested. The remote is free to return fewer blocks than requested.
    pub count: u64,
}

impl BlocksByRangeRequest {
    /// First slot *not* covered by the request.
    pub fn end_slot(&self) -> u64 {
        self.start_slot
            .saturating_add(self.step.saturating_mul(self.count))
    }

    /// Checks the request against the protocol's policy limits.
    ///
    /// `highest_expected_slot` is the highest slot the local node believes can exist right
    /// now, i.e. the current wall-clock slot.
    pub fn validate(
        &self,
        highest_expected_slot: u64,
    ) -> Result<(), RangeRequestPolicyViolation> {
        if self.count == 0 {
            return Err(RangeRequestPolicyViolation::ZeroCount);
        }
        if self.count > MAX_REQUEST_BLOCKS {
            return Err(RangeRequestPolicyViolation::TooManyBlocks);
        }
        if self.step == 0 {
            return Err(RangeRequestPolicyViolation::ZeroStep);
        }
        if self.step > RANGE_LIMIT {
            return Err(RangeRequestPolicyViolation::StepTooLarge);
        }
        if self.start_slot > highest_expected_slot.saturating_add(2 * RANGE_LIMIT) {
            return Err(RangeRequestPolicyViolation::StartSlotTooFar);
        }
        // `count - 1` rather than `count`: the span is measured between the first and the
        // last requested slot, both included.
        if self.step.saturating_mul(self.count - 1) > RANGE_LIMIT {
            return Err(RangeRequestPolicyViolation::SpanTooLarge);
        }
        Ok(())
    }
}

/// Way in which a [`BlocksByRangeRequest`] violates the protocol's policy limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RangeRequestPolicyViolation {
    /// Zero blocks requested.
    ZeroCount,
    /// More than [`MAX_REQUEST_BLOCKS`] blocks requested.
    TooManyBlocks,
    /// Slot step of zero.
    ZeroStep,
    /// Slot step larger than [`RANGE_LIMIT`].
    StepTooLarge,
    /// Start slot further in the future than the node can possibly serve.
    StartSlotTooFar,
    /// The span between the first and last requested slot exceeds [`RANGE_LIMIT`].
    SpanTooLarge,
}

/// Builds the bytes corresponding to a blocks-by-range request.
pub fn build_blocks_by_range_request(request: &BlocksByRangeRequest) -> Vec<u8> {
    let message = schema::BlocksByRangeRequest {
        start_slot: request.start_slot,
        step: request.step,
        count: request.count,
    };

    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).unwrap();
    buf
}

/// Decodes a blocks-by-range request.
///
/// Only the encoding is checked here; use [`BlocksByRangeRequest::validate`] for the policy
/// limits.
pub fn decode_blocks_by_range_request(
    bytes: &[u8],
) -> Result<BlocksByRangeRequest, DecodeRequestError> {
    let message = schema::BlocksByRangeRequest::decode(bytes)
        .map_err(ProtobufDecodeError)
        .map_err(DecodeRequestError::ProtobufDecode)?;

    Ok(BlocksByRangeRequest {
        start_slot: message.start_slot,
        step: message.step,
        count: message.count,
    })
}

/// Builds the bytes corresponding to a blocks-by-root request.
pub fn build_blocks_by_root_request(roots: &[[u8; 32]]) -> Vec<u8> {
    let message = schema::BlocksByRootRequest {
        roots: roots.iter().map(|r| r.to_vec()).collect(),
    };

    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).unwrap();
    buf
}

/// Decodes a blocks-by-root request.
pub fn decode_blocks_by_root_request(
    bytes: &[u8],
) -> Result<Vec<[u8; 32]>, DecodeRequestError> {
    let message = schema::BlocksByRootRequest::decode(bytes)
        .map_err(ProtobufDecodeError)
        .map_err(DecodeRequestError::ProtobufDecode)?;

    if message.roots.is_empty() {
        return Err(DecodeRequestError::NoRoots);
    }
    if u64::try_from(message.roots.len()).unwrap() > MAX_REQUEST_BLOCKS {
        return Err(DecodeRequestError::TooManyRoots);
    }

    message
        .roots
        .iter()
        .map(|root| {
            <[u8; 32]>::try_from(&root[..]).map_err(|_| DecodeRequestError::InvalidRootLength)
        })
        .collect()
}

/// Error potentially returned by [`decode_blocks_by_range_request`] and
/// [`decode_blocks_by_root_request`].
#[derive(Debug, derive_more::Display)]
pub enum DecodeRequestError {
    /// Error while decoding the Protobuf encoding.
    ProtobufDecode(ProtobufDecodeError),
    /// Empty list of requested roots.
    NoRoots,
    /// More than [`MAX_REQUEST_BLOCKS`] roots requested.
    TooManyRoots,
    /// A requested root isn't 32 bytes.
    InvalidRootLength,
}

/// Builds the bytes corresponding to one signed block, as carried in a response chunk.
pub fn build_signed_block(block: &SignedBeaconBlock) -> Vec<u8> {
    let message = schema::SignedBeaconBlock {
        block: Some(schema::BeaconBlock {
            slot: block.message.slot,
            proposer_index: block.message.proposer_index,
            parent_root: block.message.parent_root.to_vec(),
            state_root: block.message.state_root.to_vec(),
            body: block.message.body.clone(),
        }),
        signature: block.signature.to_vec(),
    };

    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).unwrap();
    buf
}

/// Decodes one signed block received in a response chunk.
///
/// > **Note**: Assuming that this block comes from the network, the information in it can be
/// >           erroneous and shouldn't be trusted.
pub fn decode_signed_block(bytes: &[u8]) -> Result<SignedBeaconBlock, DecodeBlockError> {
    let message = schema::SignedBeaconBlock::decode(bytes)
        .map_err(ProtobufDecodeError)
        .map_err(DecodeBlockError::ProtobufDecode)?;

    let block = message.block.ok_or(DecodeBlockError::MissingBlock)?;

    Ok(SignedBeaconBlock {
        message: BeaconBlock {
            slot: block.slot,
            proposer_index: block.proposer_index,
            parent_root: <[u8; 32]>::try_from(&block.parent_root[..])
                .map_err(|_| DecodeBlockError::InvalidRootLength)?,
            state_root: <[u8; 32]>::try_from(&block.state_root[..])
                .map_err(|_| DecodeBlockError::InvalidRootLength)?,
            body: block.body,
        },
        signature: <[u8; 96]>::try_from(&message.signature[..])
            .map_err(|_| DecodeBlockError::InvalidSignatureLength)?,
    })
}

/// Error potentially returned by [`decode_signed_block`].
#[derive(Debug, derive_more::Display)]
pub enum DecodeBlockError {
    /// Error while decoding the Protobuf encoding.
    ProtobufDecode(ProtobufDecodeError),
    /// The signed envelope doesn't contain a block.
    MissingBlock,
    /// A root field isn't 32 bytes.
    InvalidRootLength,
    /// The signature isn't 96 bytes.
    InvalidSignatureLength,
}
