// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The element sequence iterator.
//!
//! [`ElementSeqIter`] is a streaming iterator: [`ElementSeqIter::next`]
//! borrows the produced element from the iterator, so it cannot implement
//! [`Iterator`] directly. Positions can be saved and restored to replay a
//! region of the sequence; comparing positions orders them by `(offset,
//! mark)` within the element sequence.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::elem::Element;
use crate::error::DecodeError;
use crate::pos::VmPos;
use crate::proc::PacketProc;
use crate::source::DataSource;
use crate::vm::{ItInfos, Vm, END_OFFSET};

/// An iterator over the elements of one element sequence.
pub struct ElementSeqIter<S: DataSource> {
    vm: Vm<S>,
}

impl<S: DataSource> std::fmt::Debug for ElementSeqIter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementSeqIter")
            .field("offset", &self.vm.it.offset)
            .field("mark", &self.vm.it.mark)
            .finish_non_exhaustive()
    }
}

impl<S: DataSource> ElementSeqIter<S> {
    /// Creates an iterator decoding `source` with the procedures of
    /// `pkt_proc`, positioned before the first element.
    #[must_use]
    pub fn new(pkt_proc: Arc<PacketProc>, source: S) -> Self {
        Self {
            vm: Vm::new(pkt_proc, source),
        }
    }

    /// Produces the next element, or `None` at the end of the element
    /// sequence. Calling `next` again after the end is a no-op returning
    /// `None`.
    ///
    /// After an error the iterator is left in a safe but unspecified state;
    /// callers are expected to stop iterating.
    pub fn next(&mut self) -> Result<Option<&Element>, DecodeError> {
        if self.vm.is_at_end() {
            return Ok(None);
        }
        self.vm.next_elem()?;
        Ok(self.vm.pos.cur_elem.as_ref())
    }

    /// Returns the element produced by the last [`ElementSeqIter::next`]
    /// call, if any.
    #[must_use]
    pub fn cur_elem(&self) -> Option<&Element> {
        self.vm.pos.cur_elem.as_ref()
    }

    /// Returns the offset (bits) of the current element within the element
    /// sequence.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.vm.it.offset
    }

    /// Returns the mark of the current element: its rank among the elements
    /// sharing its offset.
    #[must_use]
    pub fn mark(&self) -> u64 {
        self.vm.it.mark
    }

    /// Returns `true` once the iterator reached the end of the element
    /// sequence.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.vm.is_at_end()
    }

    /// Repositions the iterator to the packet starting at `offset_bytes`
    /// within the element sequence. The caller guarantees that a packet
    /// really begins there; the next [`ElementSeqIter::next`] call decodes
    /// it (or reports the end of the sequence).
    pub fn seek_packet(&mut self, offset_bytes: u64) {
        self.vm.seek_pkt(offset_bytes);
    }

    /// Saves the complete decoding position. No I/O is performed.
    #[must_use]
    pub fn save_pos(&self) -> IterPos {
        IterPos {
            pos: self.vm.pos.clone(),
            it: self.vm.it,
        }
    }

    /// Restores a position previously saved with
    /// [`ElementSeqIter::save_pos`] on an iterator over the same element
    /// sequence. No I/O is performed; the next advance refills the buffer
    /// window.
    pub fn restore_pos(&mut self, pos: &IterPos) {
        self.vm.pos = pos.pos.clone();
        self.vm.it = pos.it;
        self.vm.reset_window();
    }
}

/// A saved iterator position.
///
/// Positions taken from the same element sequence are totally ordered by
/// `(offset, mark)`; the end-of-sequence position orders after every other
/// one.
#[derive(Clone, Debug)]
pub struct IterPos {
    pos: VmPos,
    it: ItInfos,
}

impl IterPos {
    /// Returns the offset (bits) of the saved current element within the
    /// element sequence, or `None` for an end-of-sequence position.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        (self.it.offset != END_OFFSET).then_some(self.it.offset)
    }

    /// Returns the mark of the saved current element.
    #[must_use]
    pub fn mark(&self) -> u64 {
        self.it.mark
    }
}

impl PartialEq for IterPos {
    fn eq(&self, other: &Self) -> bool {
        self.it == other.it
    }
}

impl Eq for IterPos {}

impl PartialOrd for IterPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IterPos {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.it.offset, self.it.mark).cmp(&(other.it.offset, other.it.mark))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bits::ByteOrder;
    use crate::instr::{FixedLenRead, Instr, Proc};
    use crate::proc::StreamPacketProc;
    use crate::source::MemorySource;

    fn u8_payload_proc() -> Arc<PacketProc> {
        let er_proc = Arc::new(Proc::new(vec![
            Instr::ReadUInt(FixedLenRead {
                len: 8,
                byte_order: ByteOrder::Little,
                align: 8,
            }),
            Instr::EndErProc,
        ]));
        let stream = Arc::new(StreamPacketProc::new(
            Proc::new(vec![Instr::EndDsPktPreambleProc]),
            Proc::new(vec![
                Instr::SetEventRecordType { fixed_id: Some(0) },
                Instr::EndDsErPreambleProc,
            ]),
            8,
            [(0u64, er_proc)].into_iter().collect::<HashMap<_, _>>(),
        ));
        Arc::new(PacketProc::new(
            Proc::new(vec![
                Instr::SetDataStreamType { fixed_id: Some(0) },
                Instr::EndPktPreambleProc,
            ]),
            0,
            None,
            [(0u64, stream)].into_iter().collect(),
        ))
    }

    fn drain<S: DataSource>(it: &mut ElementSeqIter<S>) -> Vec<Element> {
        let mut out = Vec::new();
        while let Some(elem) = it.next().expect("decoding succeeds") {
            out.push(elem.clone());
        }
        out
    }

    #[test]
    fn next_after_end_is_noop() {
        let mut it = ElementSeqIter::new(u8_payload_proc(), MemorySource::new(vec![0x2A]));
        let _ = drain(&mut it);
        assert!(it.is_at_end());
        assert!(it.next().unwrap().is_none());
        assert!(it.next().unwrap().is_none());
    }

    #[test]
    fn save_restore_replays_same_elements() {
        let mut it = ElementSeqIter::new(u8_payload_proc(), MemorySource::new(vec![1, 2, 3]));

        // Advance into the packet, then checkpoint.
        for _ in 0..3 {
            it.next().unwrap();
        }
        let saved = it.save_pos();
        let rest: Vec<Element> = drain(&mut it);
        assert!(it.is_at_end());

        it.restore_pos(&saved);
        let replayed: Vec<Element> = drain(&mut it);
        assert_eq!(rest, replayed);
    }

    #[test]
    fn positions_order_by_offset_then_mark() {
        let mut it = ElementSeqIter::new(u8_payload_proc(), MemorySource::new(vec![1, 2]));
        it.next().unwrap();
        let first = it.save_pos();
        it.next().unwrap();
        let second = it.save_pos();
        assert!(first < second);
        assert_eq!(first, first.clone());

        let _ = drain(&mut it);
        let end = it.save_pos();
        assert!(second < end);
        assert_eq!(end.offset(), None);
    }

    #[test]
    fn seek_packet_restarts_decoding() {
        let mut it = ElementSeqIter::new(u8_payload_proc(), MemorySource::new(vec![5, 6]));
        let _ = drain(&mut it);
        assert!(it.is_at_end());

        it.seek_packet(0);
        assert!(!it.is_at_end());
        assert_eq!(it.next().unwrap(), Some(&Element::PacketBeginning));
    }
}
