// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage store - Node codec contract
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Structures staged on disk move their payloads through a caller-supplied
// fixed-size codec. The contract is deliberately narrow: one constant size,
// one write, one read, always advancing by exactly that size. Multi-byte
// integers are big-endian everywhere in the stage formats.

use crate::stage::ChunkId;

/// The on-disk sentinel for an absent chunk ID.
pub const NIL_CHUNK_ID: i64 = -1;

/// Encode an optional chunk ID into its signed on-disk form.
pub fn encode_chunk_id(id: Option<ChunkId>) -> i64 {
    match id {
        Some(id) => id as i64,
        None => NIL_CHUNK_ID,
    }
}

/// Decode the signed on-disk form of a chunk ID. Any negative value is
/// treated as the absence sentinel.
pub fn decode_chunk_id(raw: i64) -> Option<ChunkId> {
    if raw < 0 {
        None
    } else {
        Some(raw as ChunkId)
    }
}

// ---------------------------------------------------------------------------
// NodeIo
// ---------------------------------------------------------------------------

/// A fixed-size codec for one node payload.
///
/// Implementations must be pure with respect to the buffer: `write_node`
/// appends exactly [`node_buffer_size`](NodeIo::node_buffer_size) bytes,
/// `read_node` consumes exactly as many. The size is constant for the
/// lifetime of the instance; containers size their I/O buffers from it
/// once and reuse them.
pub trait NodeIo<T> {
    /// The exact number of bytes one encoded payload occupies.
    fn node_buffer_size(&self) -> usize;

    /// Serialize `value`, appending `node_buffer_size()` bytes to `buf`.
    fn write_node(&self, value: &T, buf: &mut Vec<u8>);

    /// Deserialize one payload, consuming `node_buffer_size()` bytes from
    /// the front of `buf`.
    fn read_node(&self, buf: &mut &[u8]) -> T;
}

/// Read a big-endian `i64` off the front of a slice, advancing it.
pub fn take_i64(buf: &mut &[u8]) -> i64 {
    let (head, tail) = buf.split_at(8);
    *buf = tail;
    i64::from_be_bytes(head.try_into().unwrap())
}

/// Read a big-endian `i32` off the front of a slice, advancing it.
pub fn take_i32(buf: &mut &[u8]) -> i32 {
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    i32::from_be_bytes(head.try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Primitive codecs
// ---------------------------------------------------------------------------

/// Codec for an `i32` payload: four big-endian bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Io;

impl NodeIo<i32> for I32Io {
    fn node_buffer_size(&self) -> usize {
        4
    }

    fn write_node(&self, value: &i32, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn read_node(&self, buf: &mut &[u8]) -> i32 {
        let (head, tail) = buf.split_at(4);
        *buf = tail;
        i32::from_be_bytes(head.try_into().unwrap())
    }
}

/// Codec for a `u64` payload: eight big-endian bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Io;

impl NodeIo<u64> for U64Io {
    fn node_buffer_size(&self) -> usize {
        8
    }

    fn write_node(&self, value: &u64, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn read_node(&self, buf: &mut &[u8]) -> u64 {
        let (head, tail) = buf.split_at(8);
        *buf = tail;
        u64::from_be_bytes(head.try_into().unwrap())
    }
}
