// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage store crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Append-only staging substrate for constructive data structures. A
// `Stage` is a single file treated as a growing byte sequence: chunks are
// appended, never modified, and identified by the file offset at which
// they landed. Structures that materialize onto a stage move their
// payloads through the fixed-size `NodeIo` codec contract; `ChainNodeIo`
// is the generic whole-node codec that linked structures compose from it.
//
// # Modules
//
// - [`error`] -- The `StageError` enum covering all staging failure modes.
// - [`stage`] -- The append-only `Stage` file and its `Appender` handle.
// - [`codec`] -- The `NodeIo` contract plus primitive payload codecs.
// - [`chain`] -- The generic whole-node chain codec.
//
// # Example
//
// ```rust
// use arcstage_store::{Stage, NodeIo, I32Io};
//
// let dir = tempfile::tempdir().unwrap();
// let stage = Stage::open(dir.path().join("stage.bin"), true).unwrap();
//
// // Stage a payload through a codec.
// let io = I32Io;
// let mut buf = Vec::new();
// io.write_node(&42, &mut buf);
// let id = stage.append(&buf).unwrap();
//
// // Read it back at the returned chunk ID.
// let mut raw = vec![0u8; io.node_buffer_size()];
// stage.read(&mut raw, id).unwrap();
// assert_eq!(io.read_node(&mut raw.as_slice()), 42);
// ```

pub mod chain;
pub mod codec;
pub mod error;
pub mod stage;

// Re-export the primary public API for ergonomic imports.
pub use chain::{ChainNode, ChainNodeIo, CHAIN_STATIC_PART_SIZE};
pub use codec::{decode_chunk_id, encode_chunk_id, I32Io, NodeIo, U64Io, NIL_CHUNK_ID};
pub use error::{StageError, StageResult};
pub use stage::{Appender, ChunkId, Stage};
