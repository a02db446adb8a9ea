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

//! Builds requests and responses of the streamed request-response protocols.
//!
//! Each message is encoded as Protobuf and carried as the payload of one chunk (see
//! [`crate::network::codec`] for the chunk framing). This module is only about the payloads
//! themselves: building the bytes to send out, and decoding (with validation) the bytes
//! received.

use core::time::Duration;

use prost::Message as _;

mod block_request;

pub use block_request::{
    build_blocks_by_range_request, build_blocks_by_root_request, build_signed_block,
    decode_blocks_by_range_request, decode_blocks_by_root_request, decode_signed_block,
    BlocksByRangeRequest, DecodeBlockError, DecodeRequestError, RangeRequestPolicyViolation,
};

pub(crate) mod schema {
    include!(concat!(env!("OUT_DIR"), "/sync.v1.rs"));
}

/// Name of the protocol carrying [`BlocksByRangeRequest`] requests.
pub const BLOCKS_BY_RANGE_PROTOCOL: &str = "/eth2/beacon_chain/req/beacon_blocks_by_range/1";

/// Name of the protocol carrying blocks-by-root requests.
pub const BLOCKS_BY_ROOT_PROTOCOL: &str = "/eth2/beacon_chain/req/beacon_blocks_by_root/1";

/// Name of the protocol carrying [`GoodbyeReason`] messages.
pub const GOODBYE_PROTOCOL: &str = "/eth2/beacon_chain/req/goodbye/1";

/// Maximum number of blocks a single request, range or root, may ask for.
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// Number of blocks per second a responder is willing to serve to one peer, sustained.
pub const BLOCKS_PER_SECOND: u64 = 64;

/// How many seconds worth of [`BLOCKS_PER_SECOND`] a peer may consume in a burst.
pub const BURST_FACTOR: u64 = 10;

/// Maximum slot span a single range request may cover, and the bucket capacity of the
/// per-peer rate limiter.
pub const RANGE_LIMIT: u64 = BLOCKS_PER_SECOND * BURST_FACTOR;

/// Status byte prefixed to every chunk of a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The chunk carries a payload.
    Success,
    /// The request doesn't pass validation. Terminal.
    InvalidRequest,
    /// The responder failed on its side. Terminal.
    ServerError,
    /// The responder refuses to serve the requester for now. Terminal.
    RateLimited,
}

impl StatusCode {
    /// Returns the byte representing this status on the wire.
    pub fn to_byte(self) -> u8 {
        match self {
            StatusCode::Success => 0,
            StatusCode::InvalidRequest => 1,
            StatusCode::ServerError => 2,
            StatusCode::RateLimited => 3,
        }
    }

    /// Parses a status byte. Any unassigned non-zero value decodes to
    /// [`StatusCode::ServerError`], the protocol's catch-all failure.
    pub fn from_byte(byte: u8) -> StatusCode {
        match byte {
            0 => StatusCode::Success,
            1 => StatusCode::InvalidRequest,
            3 => StatusCode::RateLimited,
            _ => StatusCode::ServerError,
        }
    }
}

/// Reason sent along a `Goodbye` message when disconnecting from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeReason {
    ClientShutdown,
    IrrelevantNetwork,
    FaultOrError,
    UnableToVerifyNetwork,
    WrongNetwork,
    TooManyPeers,
    BadScore,
    Banned,
    GenericError,
}

impl GoodbyeReason {
    /// Returns the numeric code representing this reason on the wire.
    pub fn to_code(self) -> u64 {
        match self {
            GoodbyeReason::ClientShutdown => 1,
            GoodbyeReason::IrrelevantNetwork => 2,
            GoodbyeReason::FaultOrError => 3,
            GoodbyeReason::UnableToVerifyNetwork => 128,
            GoodbyeReason::WrongNetwork => 129,
            GoodbyeReason::TooManyPeers => 130,
            GoodbyeReason::BadScore => 250,
            GoodbyeReason::Banned => 251,
            GoodbyeReason::GenericError => 252,
        }
    }

    /// Parses a numeric code. Codes this version of the protocol doesn't know about are
    /// mapped to [`GoodbyeReason::GenericError`].
    pub fn from_code(code: u64) -> GoodbyeReason {
        match code {
            1 => GoodbyeReason::ClientShutdown,
            2 => GoodbyeReason::IrrelevantNetwork,
            3 => GoodbyeReason::FaultOrError,
            128 => GoodbyeReason::UnableToVerifyNetwork,
            129 => GoodbyeReason::WrongNetwork,
            130 => GoodbyeReason::TooManyPeers,
            250 => GoodbyeReason::BadScore,
            251 => GoodbyeReason::Banned,
            _ => GoodbyeReason::GenericError,
        }
    }

    /// How long a peer that said (or was told) goodbye with this reason should not be dialed
    /// again.
    pub fn dial_backoff(self) -> Duration {
        match self {
            GoodbyeReason::Banned => Duration::from_secs(24 * 3600),
            GoodbyeReason::BadScore => Duration::from_secs(2 * 3600),
            GoodbyeReason::TooManyPeers => Duration::from_secs(3600),
            GoodbyeReason::ClientShutdown => Duration::from_secs(5 * 60),
            _ => Duration::from_secs(2 * 60),
        }
    }
}

/// Builds the bytes corresponding to a `Goodbye` message.
pub fn build_goodbye(reason: GoodbyeReason) -> Vec<u8> {
    let message = schema::Goodbye {
        code: reason.to_code(),
    };

    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf).unwrap();
    buf
}

/// Decodes a `Goodbye` message.
pub fn decode_goodbye(bytes: &[u8]) -> Result<GoodbyeReason, ProtobufDecodeError> {
    let message = schema::Goodbye::decode(bytes).map_err(ProtobufDecodeError)?;
    Ok(GoodbyeReason::from_code(message.code))
}

/// Error while decoding the Protobuf encoding.
#[derive(Debug, derive_more::Display)]
#[display(fmt = "{}", _0)]
pub struct ProtobufDecodeError(pub(crate) prost::DecodeError);
