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

//! Chunked stream codec.
//!
//! A bidirectional byte stream carries an arbitrary number of *chunks*. Each chunk begins
//! with a single status byte (see [`StatusCode`]): `0` means success and is followed by a
//! LEB128-length-delimited payload, anything else means failure and is followed by a
//! LEB128-length-delimited UTF-8 reason. End-of-stream is signalled by the sender closing
//! its write half, which the reader observes as a clean EOF at a chunk boundary.
//!
//! The very first frame written by the requester, before its request chunk, is the name of
//! the protocol being spoken, so that the responder can reject streams opened for a protocol
//! it doesn't serve. Response chunks carry no such header.
//!
//! Deadlines are per-chunk, not per-stream: as long as the remote keeps making progress,
//! a response can take arbitrarily long in total.

use core::time::Duration;
use std::io;

use futures::prelude::*;
use futures_timer::Delay;

use super::protocol::StatusCode;
use crate::util::leb128;

/// Per-chunk deadline applied by default to every read and write.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted length of a chunk payload.
///
/// Must comfortably exceed the largest block the chain can produce, while bounding how much
/// memory a malicious remote can make the local node allocate per chunk.
pub const MAX_CHUNK_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Maximum accepted length of the reason attached to an error chunk.
const MAX_ERROR_REASON_LEN: usize = 256;

/// Maximum accepted length of the protocol-name header frame.
const MAX_PROTOCOL_ID_LEN: usize = 128;

/// One chunk successfully read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Success chunk. Contains the payload.
    Payload(Vec<u8>),
    /// Error chunk. The stream must be considered terminated by the remote.
    Error {
        status: StatusCode,
        reason: String,
    },
    /// The remote has closed its write half. No further chunk will arrive.
    EndOfStream,
}

/// Error potentially returned by the functions of this module.
#[derive(Debug, derive_more::Display)]
pub enum CodecError {
    /// The remote aborted the stream, or the transport failed underneath it.
    StreamReset,
    /// The remote stopped making progress for longer than the allotted deadline.
    Deadline,
    /// The framing or the payload is ill-formed.
    #[display(fmt = "Malformed chunk: {}", _0)]
    Decode(String),
}

impl From<io::Error> for CodecError {
    fn from(_: io::Error) -> CodecError {
        // Every I/O failure mid-exchange, EOF in the middle of a chunk included, means the
        // remote went away without properly finishing the stream.
        CodecError::StreamReset
    }
}

/// Writes the protocol-name header frame. Must be called by the requester exactly once per
/// stream, before the request chunk.
pub async fn write_protocol_id<TStream>(
    stream: &mut TStream,
    protocol: &str,
    timeout: Duration,
) -> Result<(), CodecError>
where
    TStream: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(protocol.len() + 2);
    frame.extend(leb128::encode_usize(protocol.len()));
    frame.extend_from_slice(protocol.as_bytes());
    write_all_with_deadline(stream, &frame, timeout).await
}

/// Writes one success chunk: the `0` status byte followed by the length-delimited payload.
pub async fn write_chunk<TStream>(
    stream: &mut TStream,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), CodecError>
where
    TStream: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(1 + 10 + payload.len());
    frame.push(StatusCode::Success.to_byte());
    frame.extend(leb128::encode_usize(payload.len()));
    frame.extend_from_slice(payload);
    write_all_with_deadline(stream, &frame, timeout).await
}

/// Writes one error chunk: a non-zero status byte followed by the length-delimited UTF-8
/// reason.
///
/// # Panic
///
/// Panics if `status` is [`StatusCode::Success`], which isn't an error.
///
pub async fn write_error<TStream>(
    stream: &mut TStream,
    status: StatusCode,
    reason: &str,
    timeout: Duration,
) -> Result<(), CodecError>
where
    TStream: AsyncWrite + Unpin,
{
    assert!(!matches!(status, StatusCode::Success));

    let reason = if reason.len() > MAX_ERROR_REASON_LEN {
        let mut end = MAX_ERROR_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        &reason[..end]
    } else {
        reason
    };
    let mut frame = Vec::with_capacity(1 + 2 + reason.len());
    frame.push(status.to_byte());
    frame.extend(leb128::encode_usize(reason.len()));
    frame.extend_from_slice(reason.as_bytes());
    write_all_with_deadline(stream, &frame, timeout).await
}

/// Reads one chunk from the stream.
///
/// If `is_first` is `true`, first reads the protocol-name header frame and checks it against
/// `protocol`; a mismatch is a [`CodecError::Decode`].
///
/// A clean EOF before the status byte yields [`Chunk::EndOfStream`]; an EOF anywhere else is
/// a [`CodecError::StreamReset`].
pub async fn read_chunk<TStream>(
    stream: &mut TStream,
    is_first: bool,
    protocol: &str,
    timeout: Duration,
) -> Result<Chunk, CodecError>
where
    TStream: AsyncRead + Unpin,
{
    if is_first {
        let header = read_frame(stream, MAX_PROTOCOL_ID_LEN, timeout).await?;
        let header = match header {
            Some(header) => header,
            None => return Ok(Chunk::EndOfStream),
        };
        if header != protocol.as_bytes() {
            return Err(CodecError::Decode(format!(
                "protocol header mismatch: expected {}",
                protocol
            )));
        }
    }

    // Status byte. A clean EOF here is the regular end of the stream.
    let status = {
        let mut byte = [0u8; 1];
        match read_with_deadline(stream, &mut byte, timeout).await? {
            0 => return Ok(Chunk::EndOfStream),
            _ => StatusCode::from_byte(byte[0]),
        }
    };

    match status {
        StatusCode::Success => {
            let payload = read_frame(stream, MAX_CHUNK_PAYLOAD_LEN, timeout)
                .await?
                .ok_or(CodecError::StreamReset)?;
            Ok(Chunk::Payload(payload))
        }
        status => {
            let reason = read_frame(stream, MAX_ERROR_REASON_LEN, timeout)
                .await?
                .ok_or(CodecError::StreamReset)?;
            let reason = String::from_utf8(reason)
                .map_err(|_| CodecError::Decode("error reason isn't UTF-8".to_owned()))?;
            Ok(Chunk::Error { status, reason })
        }
    }
}

/// Reads one length-delimited frame. Returns `None` on a clean EOF before the first byte of
/// the length prefix.
async fn read_frame<TStream>(
    stream: &mut TStream,
    max_len: usize,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, CodecError>
where
    TStream: AsyncRead + Unpin,
{
    let mut frame = leb128::FramedInProgress::new(max_len);
    let mut first_byte = true;

    loop {
        // Reading byte by byte while decoding the length prefix, then in bulk for the body,
        // guarantees that no byte belonging to the next chunk is consumed.
        let mut byte = [0u8; 1];
        let num_read = read_with_deadline(stream, &mut byte, timeout).await?;
        if num_read == 0 {
            if first_byte {
                return Ok(None);
            }
            return Err(CodecError::StreamReset);
        }
        first_byte = false;

        frame = match frame.update(&byte) {
            Ok((_, leb128::Framed::Finished(data))) => return Ok(Some(data)),
            Ok((_, leb128::Framed::InProgress(in_progress))) => in_progress,
            Err(err) => return Err(CodecError::Decode(err.to_string())),
        };

        if let Some(missing) = frame.missing_body_len() {
            // Length prefix fully decoded: switch to bulk reads for the body.
            let mut body = vec![0u8; missing];
            read_exact_with_deadline(stream, &mut body, timeout).await?;
            return match frame.update(&body) {
                Ok((_, leb128::Framed::Finished(data))) => Ok(Some(data)),
                Ok((_, leb128::Framed::InProgress(_))) => {
                    // `missing_body_len` bytes always complete the frame.
                    unreachable!()
                }
                Err(err) => Err(CodecError::Decode(err.to_string())),
            };
        }
    }
}

/// Reads some bytes, racing against the deadline. Returns the number of bytes read; `0`
/// means EOF.
async fn read_with_deadline<TStream>(
    stream: &mut TStream,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, CodecError>
where
    TStream: AsyncRead + Unpin,
{
    let mut deadline = Delay::new(timeout).fuse();
    let mut read = stream.read(buffer).fuse();
    futures::select! {
        result = read => Ok(result?),
        _ = deadline => Err(CodecError::Deadline),
    }
}

/// Fills `buffer` entirely, resetting the deadline every time at least one byte arrives.
async fn read_exact_with_deadline<TStream>(
    stream: &mut TStream,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<(), CodecError>
where
    TStream: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let num_read = read_with_deadline(stream, &mut buffer[filled..], timeout).await?;
        if num_read == 0 {
            return Err(CodecError::StreamReset);
        }
        filled += num_read;
    }
    Ok(())
}

/// Writes `data` entirely then flushes, racing against the deadline.
async fn write_all_with_deadline<TStream>(
    stream: &mut TStream,
    data: &[u8],
    timeout: Duration,
) -> Result<(), CodecError>
where
    TStream: AsyncWrite + Unpin,
{
    let mut deadline = Delay::new(timeout).fuse();
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok::<(), io::Error>(())
    }
    .fuse();
    futures::pin_mut!(write);
    futures::select! {
        result = write => Ok(result?),
        _ = deadline => Err(CodecError::Deadline),
    }
}
