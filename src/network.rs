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

//! Beacon-chain-specific networking.
//!
//! This module contains the streamed request-response protocols spoken between beacon nodes,
//! on top of whatever transport the embedder provides. A transport is anything implementing
//! `AsyncRead + AsyncWrite`; opening and closing connections, multiplexing streams, and
//! peer discovery are out of scope.
//!
//! Every request-response exchange follows the same shape: the requester opens a stream,
//! writes one framed request, then reads zero or more framed *chunks*, each carrying either a
//! block or an error, until the responder closes its half of the stream. The framing lives in
//! the [`codec`] module, the message encodings in [`protocol`], and the two halves of the
//! blocks protocols in [`range_server`] and [`range_client`]. Inbound requests are admitted
//! through the per-peer [`rate_limiter`].

use core::fmt;

use futures::prelude::*;

use crate::informant::HashDisplay;

pub mod codec;
pub mod protocol;
pub mod range_client;
pub mod range_server;
pub mod rate_limiter;

/// Identity of a peer on the network.
///
/// Opaque to this library. The embedder derives it from the peer's network-level public key;
/// here it is only ever used as a map key and as a logging label.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The first few bytes are enough to tell peers apart in logs.
        HashDisplay(&self.0[..8]).fmt(f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Access to the transport layer: opening an outbound stream towards a peer, for a given
/// protocol.
///
/// Implemented by the embedder on top of its connection machinery. One stream carries
/// exactly one request-response exchange and is dropped afterwards.
pub trait StreamDialer: Send + Sync + 'static {
    /// The stream itself. Reading reads what the remote wrote, writing is observed by the
    /// remote.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Future that resolves once the stream is open.
    type DialFuture: Future<Output = Result<Self::Stream, DialError>> + Send;

    /// Opens a stream towards the given peer, negotiating the given protocol.
    fn open_stream(&self, peer: &PeerId, protocol: &'static str) -> Self::DialFuture;
}

impl<T: StreamDialer> StreamDialer for std::sync::Arc<T> {
    type Stream = T::Stream;
    type DialFuture = T::DialFuture;

    fn open_stream(&self, peer: &PeerId, protocol: &'static str) -> Self::DialFuture {
        (**self).open_stream(peer, protocol)
    }
}

/// Error potentially returned by [`StreamDialer::open_stream`].
#[derive(Debug, derive_more::Display)]
#[display(fmt = "Failed to open stream: {}", _0)]
pub struct DialError(pub String);
