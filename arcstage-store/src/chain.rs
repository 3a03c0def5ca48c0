// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage store - Whole-node chain codec
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Higher-level persistent structures (stacks, lists) stage one node per
// chunk: a fixed static part followed by the payload, with the parent
// direction expressed as a chunk ID. `ChainNodeIo` composes a payload
// codec into a whole-node codec and carries the two staging helpers that
// write and read one node per `Stage` operation.
//
// On-disk node layout (big-endian):
//
//   +-------------------+---------------------+----------------------+
//   | height (8 bytes)  | parent ID (8 bytes) | payload (fixed size) |
//   +-------------------+---------------------+----------------------+

use crate::codec::{decode_chunk_id, encode_chunk_id, take_i64, NodeIo};
use crate::error::StageResult;
use crate::stage::{ChunkId, Stage};

/// Size of the static part preceding the payload: height + parent ID.
pub const CHAIN_STATIC_PART_SIZE: usize = 8 + 8;

/// One node of a persistent chain: a payload at a height, with the rest of
/// the chain reachable through the parent chunk ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode<T> {
    /// Number of nodes below this one; the bottom node has height 0.
    pub height: u64,

    /// Chunk ID of the parent node, or `None` at the bottom of the chain.
    pub parent_id: Option<ChunkId>,

    /// The staged payload.
    pub payload: T,
}

/// Whole-node codec composing a payload [`NodeIo`] with the chain's static
/// part.
#[derive(Debug, Clone, Copy)]
pub struct ChainNodeIo<IO> {
    payload_io: IO,
}

impl<IO> ChainNodeIo<IO> {
    /// Wrap a payload codec.
    pub fn new(payload_io: IO) -> Self {
        Self { payload_io }
    }

    /// The wrapped payload codec.
    pub fn payload_io(&self) -> &IO {
        &self.payload_io
    }
}

impl<T, IO: NodeIo<T>> NodeIo<ChainNode<T>> for ChainNodeIo<IO> {
    fn node_buffer_size(&self) -> usize {
        CHAIN_STATIC_PART_SIZE + self.payload_io.node_buffer_size()
    }

    fn write_node(&self, node: &ChainNode<T>, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(node.height as i64).to_be_bytes());
        buf.extend_from_slice(&encode_chunk_id(node.parent_id).to_be_bytes());
        self.payload_io.write_node(&node.payload, buf);
    }

    fn read_node(&self, buf: &mut &[u8]) -> ChainNode<T> {
        let height = take_i64(buf) as u64;
        let parent_id = decode_chunk_id(take_i64(buf));
        let payload = self.payload_io.read_node(buf);
        ChainNode {
            height,
            parent_id,
            payload,
        }
    }
}

impl<IO> ChainNodeIo<IO> {
    /// Write `node` as one chunk, reusing `scratch` for the encoding.
    /// Returns the new node's chunk ID.
    pub fn append_to_stage<T>(
        &self,
        stage: &Stage,
        node: &ChainNode<T>,
        scratch: &mut Vec<u8>,
    ) -> StageResult<ChunkId>
    where
        IO: NodeIo<T>,
    {
        scratch.clear();
        self.write_node(node, scratch);
        stage.append(scratch)
    }

    /// Read the node staged at `id`, reusing `scratch` for the raw bytes.
    pub fn read_from_stage<T>(
        &self,
        stage: &Stage,
        id: ChunkId,
        scratch: &mut Vec<u8>,
    ) -> StageResult<ChainNode<T>>
    where
        IO: NodeIo<T>,
    {
        scratch.resize(self.node_buffer_size(), 0);
        stage.read(scratch, id)?;
        let mut cursor = scratch.as_slice();
        Ok(self.read_node(&mut cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::I32Io;
    use tempfile::NamedTempFile;

    #[test]
    fn test_node_buffer_size_composes() {
        let io = ChainNodeIo::new(I32Io);
        assert_eq!(io.node_buffer_size(), CHAIN_STATIC_PART_SIZE + 4);
    }

    #[test]
    fn test_memory_roundtrip() {
        let io = ChainNodeIo::new(I32Io);
        let node = ChainNode {
            height: 3,
            parent_id: Some(40),
            payload: -123,
        };

        let mut buf = Vec::new();
        io.write_node(&node, &mut buf);
        assert_eq!(buf.len(), io.node_buffer_size());

        let mut cursor = buf.as_slice();
        assert_eq!(io.read_node(&mut cursor), node);
    }

    #[test]
    fn test_chain_walk_through_stage() {
        let file = NamedTempFile::new().unwrap();
        let stage = Stage::open(file.path(), true).unwrap();
        let io = ChainNodeIo::new(I32Io);
        let mut scratch = Vec::new();

        // Stage a three-node chain bottom-up.
        let bottom = io
            .append_to_stage(
                &stage,
                &ChainNode {
                    height: 0,
                    parent_id: None,
                    payload: 10,
                },
                &mut scratch,
            )
            .unwrap();
        let middle = io
            .append_to_stage(
                &stage,
                &ChainNode {
                    height: 1,
                    parent_id: Some(bottom),
                    payload: 20,
                },
                &mut scratch,
            )
            .unwrap();
        let top = io
            .append_to_stage(
                &stage,
                &ChainNode {
                    height: 2,
                    parent_id: Some(middle),
                    payload: 30,
                },
                &mut scratch,
            )
            .unwrap();

        // Walk back down by parent IDs.
        let mut payloads = Vec::new();
        let mut next = Some(top);
        while let Some(id) = next {
            let node = io.read_from_stage(&stage, id, &mut scratch).unwrap();
            payloads.push(node.payload);
            next = node.parent_id;
        }
        assert_eq!(payloads, vec![30, 20, 10]);
    }
}
