// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The data source seam.
//!
//! The VM never owns the raw bytes of an element sequence; it pulls windows
//! of them through [`DataSource`]. Sources hand out [`Bytes`] so windows and
//! the substring/BLOB elements cut from them share the underlying storage
//! without copying.

use bytes::Bytes;

/// A source of element sequence bytes.
///
/// The VM requests at most 9 bytes at a time (the widest single read is 64
/// bits starting up to 7 bits into a byte), but a source is free to return
/// more than `min_size_bytes`; larger windows mean fewer calls. A source
/// must return at least `min_size_bytes` bytes whenever that much data
/// exists; a short window is only permitted when the element sequence ends
/// before `offset_bytes + min_size_bytes`.
pub trait DataSource {
    /// Returns a window starting at `offset_bytes` within the element
    /// sequence, or `None` when no data exists at that offset.
    fn data(&mut self, offset_bytes: u64, min_size_bytes: usize) -> Option<Bytes>;
}

impl<S: DataSource + ?Sized> DataSource for &mut S {
    fn data(&mut self, offset_bytes: u64, min_size_bytes: usize) -> Option<Bytes> {
        (**self).data(offset_bytes, min_size_bytes)
    }
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn data(&mut self, offset_bytes: u64, min_size_bytes: usize) -> Option<Bytes> {
        (**self).data(offset_bytes, min_size_bytes)
    }
}

/// A data source over an in-memory element sequence (a whole trace file read
/// or mapped into memory).
#[derive(Clone, Debug)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    /// Creates a source over `data`.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Returns the length of the element sequence (bytes).
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }
}

impl DataSource for MemorySource {
    fn data(&mut self, offset_bytes: u64, _min_size_bytes: usize) -> Option<Bytes> {
        let offset = usize::try_from(offset_bytes).ok()?;
        if offset >= self.data.len() {
            return None;
        }
        // Everything from the offset on: the VM re-checks coverage, so a
        // window shorter than requested simply means end of stream.
        Some(self.data.slice(offset..))
    }
}

/// A data source which caps every window at a fixed size.
///
/// Mostly useful in tests to force the VM through many refills, but also the
/// natural shape for sources backed by bounded read buffers.
#[derive(Clone, Debug)]
pub struct ChunkedSource {
    data: Bytes,
    max_window_bytes: usize,
}

impl ChunkedSource {
    /// Creates a source over `data` returning at most `max_window_bytes`
    /// bytes per call.
    ///
    /// # Panics
    ///
    /// Panics if `max_window_bytes` is zero.
    #[must_use]
    pub fn new(data: impl Into<Bytes>, max_window_bytes: usize) -> Self {
        assert!(max_window_bytes > 0, "window size must be non-zero");
        Self {
            data: data.into(),
            max_window_bytes,
        }
    }
}

impl DataSource for ChunkedSource {
    fn data(&mut self, offset_bytes: u64, min_size_bytes: usize) -> Option<Bytes> {
        let offset = usize::try_from(offset_bytes).ok()?;
        if offset >= self.data.len() {
            return None;
        }
        let size = self.max_window_bytes.max(min_size_bytes);
        let end = (offset + size).min(self.data.len());
        Some(self.data.slice(offset..end))
    }
}
