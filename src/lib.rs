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

//! Building blocks for the synchronization layer of a beacon-chain node.
//!
//! # Overview
//!
//! This library contains the pieces required to bring a beacon-chain node from its current
//! local head to the tip of the chain agreed upon by its peers, and to serve the symmetric
//! requests that other nodes performing the same work will send:
//!
//! - The [`sync`] module drives outbound synchronization: a lookahead queue of per-range
//!   state machines ([`sync::queue`]) schedules block downloads across several peers in
//!   parallel through a [`sync::fetcher`], re-orders the answers, and hands over batches of
//!   blocks in strict slot order. The [`sync::round_robin`] driver repeats this process until
//!   the local head has caught up with either the peer-majority finalized slot or the current
//!   wall-clock slot.
//!
//! - The [`network`] module contains the peer-to-peer plumbing: the framed chunk codec used
//!   by all streamed request-response protocols ([`network::codec`]), the request and
//!   response encodings ([`network::protocol`]), the server side of the *blocks-by-range*
//!   and *blocks-by-root* protocols ([`network::range_server`]), the client side
//!   ([`network::range_client`]), and the per-peer admission control
//!   ([`network::rate_limiter`]).
//!
//! - The [`gossip`] module classifies blocks pushed by remote peers over the gossip overlay
//!   as accepted, rejected, or ignored, and parks blocks whose parent isn't known locally
//!   until that parent arrives.
//!
//! The consensus rules themselves are out of scope. Verifying block signatures, applying the
//! state transition, and deciding which fork is canonical are delegated to the embedder
//! through the traits of the [`chain`] module. Similarly, this library never touches the
//! disk: blocks are read from and written to a [`chain::BlockStore`] implementation provided
//! by the embedder.
//!
//! # Usage
//!
//! The library is organized as a collection of state machines and `async` services. None of
//! the services spawns threads or assumes a specific executor: long-running tasks are handed
//! to the embedder through a `tasks_executor` callback found in the various `Config` structs,
//! and all timing is performed through timer futures. Dropping a service, or calling its
//! `stop` function, cancels every in-flight operation it owns.

#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod block;
pub mod chain;
pub mod gossip;
pub mod informant;
pub mod network;
pub mod sync;

mod util;
