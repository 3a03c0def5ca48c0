// SPDX-License-Identifier: PMPL-1.0-or-later
//
// ArcStage store - Append-only stage file
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A stage is on-disk storage for large constructive data structures: any
// substructure handed out is conceptually immutable, so data written to a
// stage is never modified again. The only two I/O operations are therefore
// reading a chunk of bytes at a known offset and appending a chunk to the
// end of the file. Each append yields the file offset at which the chunk
// landed; that offset is the chunk's identity for the rest of its life.
//
// Chunk sizes are not recorded on disk. The file is a bare concatenation
// of appended bytes, which also means read boundaries need not align with
// write boundaries: eight bytes written as one chunk can be read back as
// two four-byte chunks, or straddled by a read that starts inside them.
//
// Appends are serialized by a stage-wide lock and flushed to stable
// storage before they return, so a chunk ID handed to a caller always
// refers to durable bytes. Reads are positioned and run lock-free once the
// channel handle is obtained.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{StageError, StageResult};

/// A chunk's identity: the file offset of its first byte.
pub type ChunkId = u64;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// An append-only chunk log over a single file.
///
/// The stage may be shared freely across threads: appends are serialized
/// internally, reads never block each other. It is the caller's job not to
/// open the same file through two `Stage` instances at once.
///
/// After [`close`](Stage::close), the next operation transparently reopens
/// the same path (non-truncating) and retries, so a `Stage` value remains
/// usable for the lifetime of the process.
pub struct Stage {
    /// Pathname of the underlying file, retained for reopening and for
    /// error context.
    path: PathBuf,

    /// The current channel, or `None` after a close. The write half of the
    /// lock also serializes appends.
    channel: RwLock<Option<Arc<File>>>,
}

impl Stage {
    /// Open a stage file.
    ///
    /// The file is always opened read/write and created if missing. If the
    /// contents are to be retained in order to recover state from a
    /// previous session, pass `truncate = false`; otherwise the file is
    /// truncated to zero length, discarding all previously staged chunks.
    pub fn open(path: impl AsRef<Path>, truncate: bool) -> StageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_channel(&path, truncate).map_err(|source| StageError::Open {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), truncate, "Opened stage file");

        Ok(Self {
            path,
            channel: RwLock::new(Some(Arc::new(file))),
        })
    }

    /// Returns the pathname of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` while the underlying channel is open.
    pub fn is_open(&self) -> bool {
        self.channel.read().unwrap().is_some()
    }

    /// Flush and close the underlying channel.
    ///
    /// Closing is not final: a later `read` or `append` reopens the file at
    /// the same path without truncating. Closing an already-closed stage is
    /// a no-op.
    pub fn close(&self) -> StageResult<()> {
        let mut guard = self.channel.write().unwrap();
        if let Some(file) = guard.take() {
            file.sync_all().map_err(|source| StageError::Close {
                path: self.path.clone(),
                source,
            })?;
            info!(path = %self.path.display(), "Closed stage file");
        }
        Ok(())
    }

    /// Current size of the stage file in bytes.
    ///
    /// Every chunk ID returned by [`append`](Stage::append) is strictly
    /// less than the size reported afterwards.
    pub fn size(&self) -> StageResult<u64> {
        let file = self.read_channel()?;
        file.metadata()
            .map(|metadata| metadata.len())
            .map_err(|source| StageError::Read {
                path: self.path.clone(),
                source,
            })
    }

    /// Append a chunk to the end of the stage file.
    ///
    /// Writes all of `chunk`, flushes it to stable storage, and returns the
    /// offset at which its first byte landed. Appends from concurrent
    /// threads are serialized, but two *successive* appends by one thread
    /// are not guaranteed adjacency unless wrapped in
    /// [`sequence`](Stage::sequence).
    pub fn append(&self, chunk: &[u8]) -> StageResult<ChunkId> {
        let mut guard = self.channel.write().unwrap();
        append_locked(&self.path, &mut guard, chunk)
    }

    /// Run `task` while holding the stage-wide append lock, so that every
    /// append performed through the provided [`Appender`] lands adjacently,
    /// with no chunks from other threads interleaved.
    pub fn sequence<R>(&self, task: impl FnOnce(&mut Appender<'_>) -> R) -> R {
        let guard = self.channel.write().unwrap();
        let mut appender = Appender {
            path: &self.path,
            slot: guard,
        };
        task(&mut appender)
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// The region `[offset, offset + buf.len())` must lie entirely within
    /// the current file size; hitting end-of-file mid-read fails with
    /// [`StageError::OffsetOutOfRange`] (the buffer may have been partially
    /// filled by then). Short reads are retried until the count is met. A
    /// zero-length read succeeds at any offset without touching the file.
    pub fn read(&self, buf: &mut [u8], offset: ChunkId) -> StageResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let file = self.read_channel()?;
        let mut filled = 0usize;
        let mut position = offset;

        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], position) {
                Ok(0) => {
                    return Err(StageError::OffsetOutOfRange {
                        path: self.path.clone(),
                        offset,
                    });
                }
                Ok(count) => {
                    filled += count;
                    position += count as u64;
                }
                Err(source) if source.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(StageError::Read {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }

        debug!(offset, len = buf.len(), "Read chunk");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Open a channel on `path` with the stage option set: read + write +
    /// create-if-missing, truncating only when requested at construction.
    fn open_channel(path: &Path, truncate: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
    }

    /// Obtain the current channel for reading, reopening it if a close
    /// intervened. The double-check under the write lock keeps concurrent
    /// reopeners from racing each other.
    fn read_channel(&self) -> StageResult<Arc<File>> {
        if let Some(file) = self.channel.read().unwrap().as_ref() {
            return Ok(Arc::clone(file));
        }

        let mut guard = self.channel.write().unwrap();
        reopen_locked(&self.path, &mut guard).map_err(|source| StageError::Read {
            path: self.path.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Appender
// ---------------------------------------------------------------------------

/// Append handle bound to the stage-wide lock, handed to the closure of
/// [`Stage::sequence`]. Appends performed through it are guaranteed to be
/// adjacent in the file.
pub struct Appender<'a> {
    path: &'a Path,
    slot: std::sync::RwLockWriteGuard<'a, Option<Arc<File>>>,
}

impl Appender<'_> {
    /// Append a chunk; identical contract to [`Stage::append`] except that
    /// the lock is already held.
    pub fn append(&mut self, chunk: &[u8]) -> StageResult<ChunkId> {
        append_locked(self.path, &mut self.slot, chunk)
    }
}

/// Append while holding the channel write lock: resolve the channel
/// (reopening if closed), write at the current end, flush.
fn append_locked(
    path: &Path,
    slot: &mut Option<Arc<File>>,
    chunk: &[u8],
) -> StageResult<ChunkId> {
    let file = match slot.as_ref() {
        Some(file) => Arc::clone(file),
        None => reopen_locked(path, slot).map_err(|source| StageError::Write {
            path: path.to_path_buf(),
            source,
        })?,
    };

    let write = |file: &File| -> io::Result<u64> {
        let start = file.metadata()?.len();
        file.write_all_at(chunk, start)?;
        file.sync_all()?;
        Ok(start)
    };

    let start = write(&file).map_err(|source| StageError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(offset = start, len = chunk.len(), "Appended chunk");
    Ok(start)
}

/// Reopen the stage file non-truncating and install the fresh channel.
/// Must be called with the write lock held.
fn reopen_locked(path: &Path, slot: &mut Option<Arc<File>>) -> io::Result<Arc<File>> {
    if let Some(file) = slot.as_ref() {
        return Ok(Arc::clone(file));
    }
    let file = Arc::new(Stage::open_channel(path, false)?);
    info!(path = %path.display(), "Reopened stage file");
    *slot = Some(Arc::clone(&file));
    Ok(file)
}
