// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The decoding virtual machine.
//!
//! The VM is a pull-driven state machine: each call to [`Vm::next_elem`]
//! loops over [`Vm::handle_state`] until exactly one new element has been
//! produced (or the element sequence ends). The outer states cover packet
//! and event record boundaries and the sub-state machines (padding skips,
//! substrings, BLOB sections, UUID bytes); within the `ExecInstr` states the
//! VM fetches instructions from the top stack frame and reacts to what each
//! handler returns.
//!
//! Between two emitted elements the VM observes bytes of the element
//! sequence in non-decreasing offset order, and never rereads a byte except
//! after a position restore.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::bits::{self, ByteOrder};
use crate::elem::{Element, EventRecordInfo};
use crate::error::DecodeError;
use crate::instr::{FixedLenRead, Instr, Proc};
use crate::pos::{VmPos, VmState, SAVED_VAL_UNSET};
use crate::proc::PacketProc;
use crate::source::DataSource;

/// Iterator offset marking the end of the element sequence.
pub(crate) const END_OFFSET: u64 = u64::MAX;

/// The iterator-visible part of the decoding state: the offset (bits) of the
/// current element within the element sequence, and a mark making elements
/// at the same offset totally ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ItInfos {
    pub offset: u64,
    pub mark: u64,
}

/// The current window into the element sequence: a byte buffer handed out by
/// the data source and its position within the current packet.
#[derive(Clone, Debug, Default)]
struct Window {
    buf: Bytes,
    /// Offset of `buf[0]` within the current packet (bits); always a
    /// multiple of 8.
    offset_in_pkt_bits: u64,
}

impl Window {
    fn len_bits(&self) -> u64 {
        self.buf.len() as u64 * 8
    }

    fn end_offset_bits(&self) -> u64 {
        self.offset_in_pkt_bits + self.len_bits()
    }
}

/// What an instruction handler asks the dispatcher to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reaction {
    /// An element was emitted; advance the program counter and stop.
    FetchNextAndStop,
    /// An element was emitted; the handler already updated the program
    /// counter (or pushed a frame); stop.
    Stop,
    /// No element; advance the program counter and keep executing.
    ExecNext,
    /// No element; keep executing the current instruction slot (a new
    /// procedure was just loaded).
    ExecCur,
    /// No element; the handler changed the dispatcher state.
    ChangeState,
}

/// The decoding virtual machine.
pub(crate) struct Vm<S: DataSource> {
    source: S,
    pkt_proc: Arc<PacketProc>,
    window: Window,
    /// Frame procedure for the sub-state machines which track progress with
    /// a byte counter only (text arrays, BLOBs, UUID bytes).
    empty_proc: Arc<Proc>,
    pub(crate) pos: VmPos,
    pub(crate) it: ItInfos,
}

impl<S: DataSource> fmt::Debug for Vm<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("pos", &self.pos)
            .field("it", &self.it)
            .finish_non_exhaustive()
    }
}

impl<S: DataSource> Vm<S> {
    pub fn new(pkt_proc: Arc<PacketProc>, source: S) -> Self {
        let pos = VmPos::new(pkt_proc.saved_vals_count());
        Self {
            source,
            pkt_proc,
            window: Window::default(),
            empty_proc: Arc::new(Proc::default()),
            pos,
            it: ItInfos { offset: 0, mark: 0 },
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.it.offset == END_OFFSET
    }

    /// Produces the next element, or marks the iterator as ended.
    pub fn next_elem(&mut self) -> Result<(), DecodeError> {
        loop {
            match self.handle_state() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    debug!(error = %e, "decoding error");
                    return Err(e);
                }
            }
        }
    }

    /// Repositions to the packet starting at `offset_bytes`. The next call
    /// to [`Vm::next_elem`] decodes from there; no I/O happens here.
    pub fn seek_pkt(&mut self, offset_bytes: u64) {
        debug!(offset_bytes, "seeking packet");
        self.pos.cur_pkt_offset_bits = offset_bytes * 8;
        self.pos.reset_for_new_pkt();
        self.pos.cur_elem = None;
        self.reset_window();
        self.it.offset = self.pos.cur_pkt_offset_bits;
        self.it.mark = 0;
    }

    /// Discards the window; the next read refills it from the source.
    pub fn reset_window(&mut self) {
        self.window.buf = Bytes::new();
        self.window.offset_in_pkt_bits = self.pos.head_offset_bits;
    }

    // ---- buffer window primitives ----

    fn rem_bits_in_window(&self) -> u64 {
        debug_assert!(self.window.end_offset_bits() >= self.pos.head_offset_bits);
        self.window.end_offset_bits() - self.pos.head_offset_bits
    }

    /// Returns the window bytes starting at the byte containing the head.
    fn bytes_at_head(&self) -> &[u8] {
        let byte_off = ((self.pos.head_offset_bits - self.window.offset_in_pkt_bits) / 8) as usize;
        &self.window.buf[byte_off..]
    }

    /// Returns a zero-copy handle over the window bytes starting at the
    /// head, which must be byte-aligned.
    fn window_slice_at_head(&self) -> Bytes {
        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);
        let byte_off = ((self.pos.head_offset_bits - self.window.offset_in_pkt_bits) / 8) as usize;
        self.window.buf.slice(byte_off..)
    }

    fn consume_bits(&mut self, bits: u64) {
        debug_assert!(bits <= self.rem_bits_in_window());
        self.pos.head_offset_bits += bits;
    }

    /// Returns `true` if at least `bits` bits are reachable from the head
    /// without going past the end of the element sequence, refilling the
    /// window from the source if needed.
    fn try_have_bits(&mut self, bits: u64) -> bool {
        debug_assert!(bits <= 64);

        if bits <= self.rem_bits_in_window() {
            return true;
        }

        // Request from the byte containing the head.
        let floored_head_bytes = (self.pos.head_offset_bits & !7) / 8;
        let req_offset_bytes = self.pos.cur_pkt_offset_bits / 8 + floored_head_bytes;
        let bit_in_byte = self.pos.head_offset_bits & 7;
        let size_bytes = ((bits + 7 + bit_in_byte) / 8) as usize;

        let Some(buf) = self.source.data(req_offset_bytes, size_bytes) else {
            return false;
        };

        self.window.offset_in_pkt_bits = req_offset_bytes * 8 - self.pos.cur_pkt_offset_bits;
        self.window.buf = buf;
        bits <= self.rem_bits_in_window()
    }

    fn require_bits(&mut self, bits: u64) -> Result<(), DecodeError> {
        if self.try_have_bits(bits) {
            Ok(())
        } else {
            Err(DecodeError::PrematureEndOfData {
                offset_bits: self.pos.head_offset_in_elem_seq(),
                needed_bits: bits,
            })
        }
    }

    fn require_content_bits(&mut self, bits: u64) -> Result<(), DecodeError> {
        if bits > self.pos.rem_content_bits() {
            return Err(DecodeError::DataBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq(),
                needed_bits: bits,
                remaining_bits: self.pos.rem_content_bits(),
            });
        }
        self.require_bits(bits)
    }

    // ---- alignment ----

    fn align_head(&mut self, align: u32) -> Result<(), DecodeError> {
        debug_assert!(align.is_power_of_two());
        let align = u64::from(align);
        let new_head = (self.pos.head_offset_bits + align - 1) & !(align - 1);
        let bits_to_skip = new_head - self.pos.head_offset_bits;

        if bits_to_skip == 0 {
            return Ok(());
        }

        if bits_to_skip > self.pos.rem_content_bits() {
            return Err(DecodeError::DataBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq(),
                needed_bits: bits_to_skip,
                remaining_bits: self.pos.rem_content_bits(),
            });
        }

        self.pos.rem_bits_to_skip = bits_to_skip;
        self.pos.post_skip_state = self.pos.state;
        self.pos.state = VmState::ContinueSkipContentPaddingBits;
        self.continue_skip_padding_bits(true)
    }

    /// Skips `rem_bits_to_skip` padding bits, refilling the window as many
    /// times as it takes, then restores `post_skip_state`.
    fn continue_skip_padding_bits(&mut self, content_bits: bool) -> Result<(), DecodeError> {
        while self.pos.rem_bits_to_skip > 0 {
            if content_bits {
                self.require_content_bits(1)?;
            } else {
                self.require_bits(1)?;
            }

            let bits = self.pos.rem_bits_to_skip.min(self.rem_bits_in_window());
            self.pos.rem_bits_to_skip -= bits;
            self.consume_bits(bits);
        }

        self.pos.state = self.pos.post_skip_state;
        Ok(())
    }

    // ---- element emission ----

    fn emit_at(&mut self, elem: Element, offset_bits: u64) {
        self.it.offset = offset_bits;
        self.it.mark += 1;
        self.pos.cur_elem = Some(elem);
    }

    fn emit(&mut self, elem: Element) {
        self.emit_at(elem, self.pos.head_offset_in_elem_seq());
    }

    fn set_it_end(&mut self) {
        self.it.mark = 0;
        self.it.offset = END_OFFSET;
        self.pos.cur_elem = None;
    }

    // ---- outer state machine ----

    /// Handles the current state; returns `true` once an element has been
    /// produced (or the sequence ended).
    fn handle_state(&mut self) -> Result<bool, DecodeError> {
        match self.pos.state {
            VmState::ExecInstr => self.state_exec_instr(),
            VmState::ExecArrayInstr => self.state_exec_array_instr(),
            VmState::BeginEr => self.state_begin_er(),
            VmState::EndEr => self.state_end_er(),
            VmState::ReadSubstr => self.state_read_substr(),
            VmState::ReadSubstrUntilNull => self.state_read_substr_until_null(),
            VmState::ReadBlobSection => self.state_read_blob_section(),
            VmState::EndStr => self.state_end_str(),
            VmState::ContinueSkipPaddingBits | VmState::ContinueSkipContentPaddingBits => {
                self.state_continue_skip_padding_bits()
            }
            VmState::ReadUuidByte => self.state_read_uuid_byte(),
            VmState::SetTraceTypeUuid => self.state_set_trace_type_uuid(),
            VmState::BeginPkt => self.state_begin_pkt(),
            VmState::BeginPktContent => self.state_begin_pkt_content(),
            VmState::EndPktContent => self.state_end_pkt_content(),
            VmState::EndPkt => self.state_end_pkt(),
        }
    }

    fn state_exec_instr(&mut self) -> Result<bool, DecodeError> {
        loop {
            let (proc, pc) = {
                let top = self.pos.stack_top();
                (Arc::clone(&top.proc), top.pc)
            };

            match self.exec(&proc.instrs()[pc])? {
                Reaction::FetchNextAndStop => {
                    self.pos.goto_next_instr();
                    return Ok(true);
                }
                Reaction::Stop => return Ok(true),
                Reaction::ExecNext => self.pos.goto_next_instr(),
                Reaction::ExecCur => {}
                Reaction::ChangeState => return Ok(false),
            }
        }
    }

    fn state_exec_array_instr(&mut self) -> Result<bool, DecodeError> {
        if self.pos.stack_top().rem_elems == 0 {
            self.pos.set_parent_state_and_pop();
            return Ok(false);
        }

        loop {
            // Wrap the program counter around the element procedure.
            if self.pos.stack_top().pc == self.pos.stack_top().proc.len() {
                let top = self.pos.stack_top_mut();
                debug_assert!(top.rem_elems > 0);
                top.rem_elems -= 1;

                if top.rem_elems == 0 {
                    self.pos.set_parent_state_and_pop();
                    return Ok(false);
                }

                self.pos.stack_top_mut().pc = 0;
                continue;
            }

            let (proc, pc) = {
                let top = self.pos.stack_top();
                (Arc::clone(&top.proc), top.pc)
            };

            match self.exec(&proc.instrs()[pc])? {
                Reaction::FetchNextAndStop => {
                    self.pos.goto_next_instr();
                    return Ok(true);
                }
                Reaction::Stop => return Ok(true),
                Reaction::ExecNext => self.pos.goto_next_instr(),
                Reaction::ExecCur | Reaction::ChangeState => {
                    unreachable!("reaction not reachable within an array procedure")
                }
            }
        }
    }

    fn state_begin_pkt(&mut self) -> Result<bool, DecodeError> {
        self.it.mark = 0;
        self.pos.reset_for_new_pkt();

        if self.rem_bits_in_window() == 0 {
            // Probe one bit to learn whether the element sequence ends
            // here; between packets, no data at all is a clean end.
            if !self.try_have_bits(1) {
                debug!(
                    offset_bits = self.pos.cur_pkt_offset_bits,
                    "end of element sequence"
                );
                self.set_it_end();
                return Ok(true);
            }
        }

        trace!(
            offset_bits = self.pos.cur_pkt_offset_bits,
            "packet beginning"
        );
        self.emit(Element::PacketBeginning);
        self.pos
            .load_new_proc(Arc::clone(self.pkt_proc.preamble_proc()));
        self.pos.state = VmState::BeginPktContent;
        Ok(true)
    }

    fn state_begin_pkt_content(&mut self) -> Result<bool, DecodeError> {
        self.emit(Element::PacketContentBeginning);

        // The trace preamble procedure is already loaded at this point.
        self.pos.state = VmState::ExecInstr;
        Ok(true)
    }

    fn state_end_pkt_content(&mut self) -> Result<bool, DecodeError> {
        // Skip the padding after the packet content before ending the
        // packet. Without an expected total length the element sequence
        // holds a single packet and there is no padding to skip.
        let bits_to_skip = match self.pos.expected_total_len_bits {
            Some(total) => total - self.pos.head_offset_bits,
            None => 0,
        };

        if bits_to_skip > 0 {
            self.pos.rem_bits_to_skip = bits_to_skip;
            self.pos.post_skip_state = VmState::EndPkt;
            self.pos.state = VmState::ContinueSkipPaddingBits;
        } else {
            self.pos.state = VmState::EndPkt;
        }

        self.emit(Element::End);
        Ok(true)
    }

    fn state_end_pkt(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos.head_offset_in_elem_seq();

        self.pos.cur_pkt_offset_bits = offset;
        self.pos.head_offset_bits = 0;
        debug_assert_eq!(offset & 7, 0);

        match self.pos.expected_total_len_bits {
            None => {
                // Single-packet element sequence.
                self.reset_window();
            }
            Some(total) => {
                // Drop the consumed packet bytes from the window; whatever
                // remains already belongs to the next packet.
                let advance = ((total - self.window.offset_in_pkt_bits) / 8) as usize;
                debug_assert!(advance <= self.window.buf.len());
                self.window.buf = self.window.buf.slice(advance..);
                self.window.offset_in_pkt_bits = 0;
            }
        }

        trace!(offset_bits = offset, "packet end");
        self.emit_at(Element::End, offset);
        self.pos.state = VmState::BeginPkt;
        Ok(true)
    }

    fn state_begin_er(&mut self) -> Result<bool, DecodeError> {
        let stream = self
            .pos
            .cur_stream_proc
            .clone()
            .expect("a data stream type is selected");

        if self.pos.expected_content_len_bits.is_some() {
            if self.pos.rem_content_bits() == 0 {
                self.pos.state = VmState::EndPktContent;
                return Ok(false);
            }
        } else if self.rem_bits_in_window() == 0 {
            // Unknown content length: probe one bit to learn whether the
            // packet content ends here.
            if !self.try_have_bits(1) {
                self.pos.state = VmState::EndPktContent;
                return Ok(false);
            }
        }

        // Align now so that the emitted offset is past any padding.
        self.align_head(stream.er_align())?;

        trace!(
            offset_bits = self.pos.head_offset_in_elem_seq(),
            "event record beginning"
        );
        self.pos.pending_er_info = EventRecordInfo::default();
        self.emit(Element::EventRecordBeginning);
        self.pos
            .load_new_proc(Arc::clone(stream.er_preamble_proc()));
        self.pos.state = VmState::ExecInstr;
        Ok(true)
    }

    fn state_end_er(&mut self) -> Result<bool, DecodeError> {
        debug_assert!(self.pos.cur_er_proc.is_some());
        self.pos.cur_er_proc = None;
        self.emit(Element::End);
        self.pos.state = VmState::BeginEr;
        Ok(true)
    }

    fn state_read_uuid_byte(&mut self) -> Result<bool, DecodeError> {
        if self.pos.stack_top().rem_elems == 0 {
            self.pos.state = VmState::SetTraceTypeUuid;
            return Ok(false);
        }

        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);
        self.require_content_bits(8)?;

        let byte = self.bytes_at_head()[0];
        let index = (16 - self.pos.stack_top().rem_elems) as usize;
        self.pos.uuid[index] = byte;
        self.pos.last_int_val = u64::from(byte);
        self.emit(Element::UnsignedInteger(u64::from(byte)));
        self.consume_bits(8);
        self.pos.stack_top_mut().rem_elems -= 1;
        Ok(true)
    }

    fn state_set_trace_type_uuid(&mut self) -> Result<bool, DecodeError> {
        self.emit(Element::TraceTypeUuid {
            uuid: self.pos.uuid,
            expected: self.pkt_proc.uuid(),
        });
        self.pos.set_parent_state_and_pop();
        Ok(true)
    }

    fn state_read_substr(&mut self) -> Result<bool, DecodeError> {
        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);

        if self.pos.stack_top().rem_elems == 0 {
            self.pos.set_parent_state_and_pop();
            return Ok(false);
        }

        let section = self.read_byte_section()?;
        self.emit(Element::Substring(section.clone()));
        self.consume_bits(section.len() as u64 * 8);
        self.pos.stack_top_mut().rem_elems -= section.len() as u64;
        Ok(true)
    }

    fn state_read_blob_section(&mut self) -> Result<bool, DecodeError> {
        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);

        if self.pos.stack_top().rem_elems == 0 {
            self.pos.set_parent_state_and_pop();
            return Ok(false);
        }

        let section = self.read_byte_section()?;
        self.emit(Element::BlobSection(section.clone()));
        self.consume_bits(section.len() as u64 * 8);
        self.pos.stack_top_mut().rem_elems -= section.len() as u64;
        Ok(true)
    }

    /// Cuts the next section of a fixed-length byte run (text array or
    /// BLOB): whatever the window holds, bounded by the remaining byte
    /// count of the top frame.
    fn read_byte_section(&mut self) -> Result<Bytes, DecodeError> {
        self.require_content_bits(8)?;

        let win = self.window_slice_at_head();
        let take = win.len().min(self.pos.stack_top().rem_elems as usize);
        let len_bits = take as u64 * 8;

        if len_bits > self.pos.rem_content_bits() {
            return Err(DecodeError::DataBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq(),
                needed_bits: len_bits,
                remaining_bits: self.pos.rem_content_bits(),
            });
        }

        debug_assert!(take > 0);
        Ok(win.slice(..take))
    }

    fn state_read_substr_until_null(&mut self) -> Result<bool, DecodeError> {
        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);

        self.require_content_bits(8)?;

        let win = self.window_slice_at_head();
        let (end, found_null) = match win.iter().position(|&b| b == 0) {
            // One past the null byte, to include it in the substring.
            Some(i) => (i + 1, true),
            // No null byte yet: up to the end of the window.
            None => (win.len(), false),
        };
        let len_bits = end as u64 * 8;

        if len_bits > self.pos.rem_content_bits() {
            return Err(DecodeError::DataBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq(),
                needed_bits: len_bits,
                remaining_bits: self.pos.rem_content_bits(),
            });
        }

        if found_null {
            self.pos.state = VmState::EndStr;
        }

        self.emit(Element::Substring(win.slice(..end)));
        self.consume_bits(len_bits);
        Ok(true)
    }

    fn state_end_str(&mut self) -> Result<bool, DecodeError> {
        self.emit(Element::End);
        self.pos.state = self.pos.post_end_str_state;
        debug_assert!(matches!(
            self.pos.state,
            VmState::ExecInstr | VmState::ExecArrayInstr
        ));
        Ok(true)
    }

    fn state_continue_skip_padding_bits(&mut self) -> Result<bool, DecodeError> {
        let content_bits = self.pos.state == VmState::ContinueSkipContentPaddingBits;
        self.continue_skip_padding_bits(content_bits)?;

        // Not done: handle the restored state immediately.
        Ok(false)
    }

    // ---- instruction execution ----

    /// Reads a fixed-length bit array: aligns, checks the
    /// byte-order-change-within-byte rule and decodes the raw bits. The
    /// caller consumes the bits after emitting its element.
    fn read_bit_array(&mut self, read: &FixedLenRead) -> Result<u64, DecodeError> {
        self.align_head(read.align)?;
        self.require_content_bits(u64::from(read.len))?;

        let bit_in_byte = (self.pos.head_offset_bits & 7) as u32;

        if bit_in_byte != 0 {
            // A bit array which does not start on a byte boundary must have
            // the same byte order as the previous bit array.
            if let Some(prev) = self.pos.last_bo {
                if prev != read.byte_order {
                    return Err(DecodeError::ByteOrderChangeWithinByte {
                        offset_bits: self.pos.head_offset_in_elem_seq(),
                        prev,
                        next: read.byte_order,
                    });
                }
            }
        }

        self.pos.last_bo = Some(read.byte_order);
        Ok(bits::read_uint(
            self.bytes_at_head(),
            bit_in_byte,
            read.len,
            read.byte_order,
        ))
    }

    /// Reads the continuation bytes of a variable-length integer. Returns
    /// the accumulated low 64 bits, the shift of the final byte and the
    /// final byte itself (for sign extension).
    fn read_vl_raw(
        &mut self,
        start_offset_bits: u64,
        signed: bool,
    ) -> Result<(u64, u32, u8), DecodeError> {
        debug_assert_eq!(self.pos.head_offset_bits & 7, 0);

        let mut val: u64 = 0;
        let mut shift: u32 = 0;

        loop {
            self.require_content_bits(8)?;
            let byte = self.bytes_at_head()[0];
            self.consume_bits(8);

            if shift >= 64 {
                return Err(DecodeError::UnsupportedVariableLengthIntegerLength {
                    offset_bits: start_offset_bits,
                });
            }

            let part = u64::from(byte & 0x7F);

            // The tenth byte carries only 64 - shift value bits; the bits
            // above them must be zero (or, for a signed read, copies of the
            // topmost kept bit), otherwise the value needs more than 64
            // bits.
            if shift + 7 > 64 {
                let kept = 64 - shift;
                let dropped = part >> kept;
                let expected = if signed && (part >> (kept - 1)) & 1 == 1 {
                    (1 << (7 - kept)) - 1
                } else {
                    0
                };
                if dropped != expected {
                    return Err(DecodeError::UnsupportedVariableLengthIntegerLength {
                        offset_bits: start_offset_bits,
                    });
                }
            }

            val |= part << shift;

            if byte & 0x80 == 0 {
                return Ok((val, shift, byte));
            }

            shift += 7;
        }
    }

    /// Pushes an array-like frame for the subprocedure (or byte run) which
    /// the `Begin*` instruction at the current program counter opens, then
    /// enters `state`.
    fn push_counted_frame(&mut self, proc: Arc<Proc>, rem_elems: u64, state: VmState) {
        self.pos.goto_next_instr();
        self.pos.stack_push(proc);
        self.pos.stack_top_mut().rem_elems = rem_elems;
        self.pos.state = state;
    }

    #[allow(clippy::too_many_lines)]
    fn exec(&mut self, instr: &Instr) -> Result<Reaction, DecodeError> {
        match instr {
            Instr::ReadUInt(read) => {
                let val = self.read_bit_array(read)?;
                self.pos.last_int_val = val;
                self.emit(Element::UnsignedInteger(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadSInt(read) => {
                let val = bits::sign_extend(self.read_bit_array(read)?, read.len);
                self.pos.last_int_val = val as u64;
                self.emit(Element::SignedInteger(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadUEnum(read) => {
                let val = self.read_bit_array(read)?;
                self.pos.last_int_val = val;
                self.emit(Element::UnsignedEnumeration(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadSEnum(read) => {
                let val = bits::sign_extend(self.read_bit_array(read)?, read.len);
                self.pos.last_int_val = val as u64;
                self.emit(Element::SignedEnumeration(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadBool(read) => {
                let val = self.read_bit_array(read)?;
                self.pos.last_int_val = val;
                self.emit(Element::Boolean(val != 0));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadBitArray(read) => {
                let val = self.read_bit_array(read)?;
                self.pos.last_int_val = val;
                self.emit(Element::BitArray(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadBitMap(read) => {
                let val = self.read_bit_array(read)?;
                self.pos.last_int_val = val;
                self.emit(Element::BitMap(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadFloat(read) => {
                debug_assert!(read.len == 32 || read.len == 64);
                let raw = self.read_bit_array(read)?;
                let val = if read.len == 32 {
                    f64::from(f32::from_bits(raw as u32))
                } else {
                    f64::from_bits(raw)
                };
                self.emit(Element::FloatingPointNumber(val));
                self.consume_bits(u64::from(read.len));
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::ReadVlUInt { align } => {
                self.align_head(*align)?;
                let offset = self.pos.head_offset_in_elem_seq();
                let (val, _, _) = self.read_vl_raw(offset, false)?;
                self.pos.last_int_val = val;
                self.emit_at(Element::UnsignedInteger(val), offset);
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::ReadVlSInt { align } => {
                self.align_head(*align)?;
                let offset = self.pos.head_offset_in_elem_seq();
                let (mut val, shift, last) = self.read_vl_raw(offset, true)?;
                let used_bits = shift + 7;
                if used_bits < 64 && (last & 0x40) != 0 {
                    val |= !0u64 << used_bits;
                }
                self.pos.last_int_val = val;
                self.emit_at(Element::SignedInteger(val as i64), offset);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::ReadNtStr { align } => {
                self.align_head(*align)?;
                self.emit(Element::StringBeginning);
                self.pos.post_end_str_state = self.pos.state;
                self.pos.state = VmState::ReadSubstrUntilNull;
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadScope { scope, align, proc } => {
                // Align now so that the emitted offset is past any padding.
                self.align_head(*align)?;
                self.emit(Element::ScopeBeginning(*scope));
                self.pos.goto_next_instr();
                self.pos.stack_push(Arc::clone(proc));
                Ok(Reaction::Stop)
            }
            Instr::EndReadScope { .. } => {
                self.emit(Element::End);
                self.pos.stack_pop();
                debug_assert_eq!(self.pos.state, VmState::ExecInstr);
                Ok(Reaction::Stop)
            }

            Instr::BeginReadStruct { align, proc } => {
                self.align_head(*align)?;
                self.emit(Element::StructureBeginning);
                self.pos.goto_next_instr();
                self.pos.stack_push(Arc::clone(proc));
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::EndReadStruct => {
                self.emit(Element::End);
                self.pos.set_parent_state_and_pop();
                Ok(Reaction::Stop)
            }

            Instr::BeginReadStaticArray { len, align, proc } => {
                self.align_head(*align)?;
                self.emit(Element::StaticArrayBeginning { len: *len });
                self.push_counted_frame(Arc::clone(proc), *len, VmState::ExecArrayInstr);
                Ok(Reaction::Stop)
            }
            Instr::EndReadStaticArray => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadStaticTextArray { len_bytes, align } => {
                self.align_head(*align)?;
                self.emit(Element::StaticTextArrayBeginning { len: *len_bytes });
                let proc = Arc::clone(&self.empty_proc);
                self.push_counted_frame(proc, *len_bytes, VmState::ReadSubstr);
                Ok(Reaction::Stop)
            }
            Instr::EndReadStaticTextArray => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadUuidArray { align } => {
                self.align_head(*align)?;
                self.emit(Element::StaticArrayBeginning { len: 16 });
                let proc = Arc::clone(&self.empty_proc);
                self.push_counted_frame(proc, 16, VmState::ReadUuidByte);
                Ok(Reaction::Stop)
            }

            Instr::BeginReadDynArray {
                len_slot,
                align,
                proc,
            } => {
                let len = self.pos.saved_val(*len_slot);
                debug_assert_ne!(len, SAVED_VAL_UNSET);
                self.align_head(*align)?;
                self.emit(Element::DynamicArrayBeginning { len });
                self.push_counted_frame(Arc::clone(proc), len, VmState::ExecArrayInstr);
                Ok(Reaction::Stop)
            }
            Instr::EndReadDynArray => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadDynTextArray { len_slot, align } => {
                let len = self.pos.saved_val(*len_slot);
                debug_assert_ne!(len, SAVED_VAL_UNSET);
                self.align_head(*align)?;
                self.emit(Element::DynamicTextArrayBeginning { len });
                let proc = Arc::clone(&self.empty_proc);
                self.push_counted_frame(proc, len, VmState::ReadSubstr);
                Ok(Reaction::Stop)
            }
            Instr::EndReadDynTextArray => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadStaticBlob { len_bytes, align } => {
                self.align_head(*align)?;
                self.emit(Element::StaticBlobBeginning { len: *len_bytes });
                let proc = Arc::clone(&self.empty_proc);
                self.push_counted_frame(proc, *len_bytes, VmState::ReadBlobSection);
                Ok(Reaction::Stop)
            }
            Instr::EndReadStaticBlob => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadDynBlob { len_slot, align } => {
                let len = self.pos.saved_val(*len_slot);
                debug_assert_ne!(len, SAVED_VAL_UNSET);
                self.align_head(*align)?;
                self.emit(Element::DynamicBlobBeginning { len });
                let proc = Arc::clone(&self.empty_proc);
                self.push_counted_frame(proc, len, VmState::ReadBlobSection);
                Ok(Reaction::Stop)
            }
            Instr::EndReadDynBlob => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::BeginReadVariantUSel {
                sel_slot,
                align,
                opts,
            } => {
                self.align_head(*align)?;
                let sel_val = self.pos.saved_val(*sel_slot);
                debug_assert_ne!(sel_val, SAVED_VAL_UNSET);

                let proc = opts
                    .iter()
                    .find(|opt| opt.ranges.contains(sel_val))
                    .map(|opt| Arc::clone(&opt.proc));
                let Some(proc) = proc else {
                    return Err(DecodeError::InvalidVariantUnsignedSelectorValue {
                        offset_bits: self.pos.head_offset_in_elem_seq(),
                        sel_val,
                    });
                };

                self.emit(Element::VariantWithUnsignedSelectorBeginning { sel_val });
                self.pos.goto_next_instr();
                self.pos.stack_push(proc);
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadVariantSSel {
                sel_slot,
                align,
                opts,
            } => {
                self.align_head(*align)?;
                let sel_val = self.pos.saved_val(*sel_slot) as i64;

                let proc = opts
                    .iter()
                    .find(|opt| opt.ranges.contains(sel_val))
                    .map(|opt| Arc::clone(&opt.proc));
                let Some(proc) = proc else {
                    return Err(DecodeError::InvalidVariantSignedSelectorValue {
                        offset_bits: self.pos.head_offset_in_elem_seq(),
                        sel_val,
                    });
                };

                self.emit(Element::VariantWithSignedSelectorBeginning { sel_val });
                self.pos.goto_next_instr();
                self.pos.stack_push(proc);
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::EndReadVariant => {
                self.emit(Element::End);
                self.pos.set_parent_state_and_pop();
                Ok(Reaction::Stop)
            }

            Instr::BeginReadOptBoolSel {
                sel_slot,
                align,
                proc,
            } => {
                self.align_head(*align)?;
                let sel_val = self.pos.saved_val(*sel_slot);
                debug_assert_ne!(sel_val, SAVED_VAL_UNSET);
                let enabled = sel_val != 0;
                self.emit(Element::OptionalWithBooleanSelectorBeginning { enabled });
                self.begin_opt_data(enabled, proc);
                Ok(Reaction::Stop)
            }
            Instr::BeginReadOptUSel {
                sel_slot,
                align,
                ranges,
                proc,
            } => {
                self.align_head(*align)?;
                let sel_val = self.pos.saved_val(*sel_slot);
                debug_assert_ne!(sel_val, SAVED_VAL_UNSET);
                let enabled = ranges.contains(sel_val);
                self.emit(Element::OptionalWithUnsignedSelectorBeginning { sel_val, enabled });
                self.begin_opt_data(enabled, proc);
                Ok(Reaction::Stop)
            }
            Instr::BeginReadOptSSel {
                sel_slot,
                align,
                ranges,
                proc,
            } => {
                self.align_head(*align)?;
                let sel_val = self.pos.saved_val(*sel_slot) as i64;
                let enabled = ranges.contains(sel_val);
                self.emit(Element::OptionalWithSignedSelectorBeginning { sel_val, enabled });
                self.begin_opt_data(enabled, proc);
                Ok(Reaction::Stop)
            }
            Instr::EndReadOpt => {
                self.emit(Element::End);
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::SaveVal { slot } => {
                self.pos.save_val(*slot);
                Ok(Reaction::ExecNext)
            }

            Instr::SetCurId => {
                self.pos.cur_id = self.pos.last_int_val;
                Ok(Reaction::ExecNext)
            }
            Instr::SetDataStreamType { fixed_id } => {
                let id = fixed_id.unwrap_or(self.pos.cur_id);
                let stream = match self.pkt_proc.stream_proc(id) {
                    Some(stream) => Arc::clone(stream),
                    None => {
                        return Err(DecodeError::UnknownDataStreamType {
                            offset_bits: self.pos.head_offset_in_elem_seq(),
                            id,
                        });
                    }
                };
                self.pos.cur_stream_proc = Some(stream);
                self.pos.pending_ds_info.type_id = Some(id);
                Ok(Reaction::ExecNext)
            }
            Instr::SetEventRecordType { fixed_id } => {
                let id = fixed_id.unwrap_or(self.pos.cur_id);
                let offset_bits = self.pos.head_offset_in_elem_seq();
                let er_proc = {
                    let stream = self
                        .pos
                        .cur_stream_proc
                        .as_ref()
                        .expect("a data stream type is selected");
                    match stream.er_proc(id) {
                        Some(proc) => Arc::clone(proc),
                        None => {
                            return Err(DecodeError::UnknownEventRecordType { offset_bits, id });
                        }
                    }
                };
                self.pos.cur_er_proc = Some(er_proc);
                self.pos.pending_er_info.type_id = Some(id);
                Ok(Reaction::ExecNext)
            }
            Instr::SetDataStreamId => {
                self.pos.pending_ds_info.stream_id = Some(self.pos.last_int_val);
                Ok(Reaction::ExecNext)
            }
            Instr::SetPktOriginIndex => {
                self.pos.pending_pkt_info.origin_index = Some(self.pos.last_int_val);
                Ok(Reaction::ExecNext)
            }
            Instr::SetPktSeqNum => {
                self.pos.pending_pkt_info.seq_num = Some(self.pos.last_int_val);
                Ok(Reaction::ExecNext)
            }
            Instr::SetPktDiscErCounter => {
                self.pos.pending_pkt_info.disc_er_counter = Some(self.pos.last_int_val);
                Ok(Reaction::ExecNext)
            }
            Instr::SetExpectedPktTotalLen => {
                let candidate = self.pos.last_int_val;
                let offset_bits = self.pos.head_offset_in_elem_seq();

                if candidate & 7 != 0 {
                    return Err(DecodeError::ExpectedTotalLenNotMultipleOf8 {
                        offset_bits,
                        len_bits: candidate,
                    });
                }

                if let Some(content) = self.pos.expected_content_len_bits {
                    if candidate < content {
                        return Err(DecodeError::ExpectedTotalLenLtContentLen {
                            offset_bits,
                            total_len_bits: candidate,
                            content_len_bits: content,
                        });
                    }
                }

                if candidate < self.pos.head_offset_bits {
                    return Err(DecodeError::ExpectedTotalLenLtOffsetInPkt {
                        offset_bits,
                        len_bits: candidate,
                        offset_in_pkt_bits: self.pos.head_offset_bits,
                    });
                }

                self.pos.expected_total_len_bits = Some(candidate);

                if self.pos.expected_content_len_bits.is_none() {
                    self.pos.expected_content_len_bits = Some(candidate);
                }

                Ok(Reaction::ExecNext)
            }
            Instr::SetExpectedPktContentLen => {
                let candidate = self.pos.last_int_val;
                let offset_bits = self.pos.head_offset_in_elem_seq();

                if let Some(total) = self.pos.expected_total_len_bits {
                    if total < candidate {
                        return Err(DecodeError::ExpectedTotalLenLtContentLen {
                            offset_bits,
                            total_len_bits: total,
                            content_len_bits: candidate,
                        });
                    }
                }

                if candidate < self.pos.head_offset_bits {
                    return Err(DecodeError::ExpectedContentLenLtOffsetInPkt {
                        offset_bits,
                        len_bits: candidate,
                        offset_in_pkt_bits: self.pos.head_offset_bits,
                    });
                }

                self.pos.expected_content_len_bits = Some(candidate);
                Ok(Reaction::ExecNext)
            }
            Instr::SetPktMagicNumber => {
                self.emit(Element::PacketMagicNumber(self.pos.last_int_val));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::SetPktEndDefClkVal => {
                self.pos.pending_pkt_info.end_def_clk_val = Some(self.pos.last_int_val);
                Ok(Reaction::ExecNext)
            }
            Instr::UpdateDefClkVal { len } => {
                let val = self.pos.update_def_clk_val(*len);
                self.emit(Element::DefaultClockValue(val));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::SetDsInfo => {
                let info = self.pos.pending_ds_info;
                self.emit(Element::DataStreamInfo(info));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::SetPktInfo => {
                self.pos.pending_pkt_info.expected_total_len = self.pos.expected_total_len_bits;
                self.pos.pending_pkt_info.expected_content_len = self.pos.expected_content_len_bits;
                let info = self.pos.pending_pkt_info;
                self.emit(Element::PacketInfo(info));
                Ok(Reaction::FetchNextAndStop)
            }
            Instr::SetErInfo => {
                let info = self.pos.pending_er_info;
                self.emit(Element::EventRecordInfo(info));
                Ok(Reaction::FetchNextAndStop)
            }

            Instr::EndPktPreambleProc => {
                // After the packet header.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());

                match self.pos.cur_stream_proc.clone() {
                    Some(stream) => {
                        self.pos
                            .load_new_proc(Arc::clone(stream.pkt_preamble_proc()));
                        Ok(Reaction::ExecCur)
                    }
                    None => {
                        self.pos.state = VmState::EndPktContent;
                        Ok(Reaction::ChangeState)
                    }
                }
            }
            Instr::EndDsPktPreambleProc => {
                // After the packet context.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                debug_assert!(self.pos.cur_stream_proc.is_some());
                self.pos.state = VmState::BeginEr;
                Ok(Reaction::ChangeState)
            }
            Instr::EndDsErPreambleProc => {
                // After the event record header and common context.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                let er_proc = self
                    .pos
                    .cur_er_proc
                    .clone()
                    .expect("an event record type is selected");
                self.pos.load_new_proc(er_proc);
                Ok(Reaction::ExecCur)
            }
            Instr::EndErProc => {
                // After the event record payload.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                self.pos.state = VmState::EndEr;
                Ok(Reaction::ChangeState)
            }
        }
    }

    /// Arranges execution of an optional's data procedure: when enabled, it
    /// runs once as a single-element array frame, so that the frame pops
    /// back to the `EndReadOpt` instruction which follows the `Begin` one.
    fn begin_opt_data(&mut self, enabled: bool, proc: &Arc<Proc>) {
        if enabled {
            self.push_counted_frame(Arc::clone(proc), 1, VmState::ExecArrayInstr);
        } else {
            self.pos.goto_next_instr();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::source::{ChunkedSource, MemorySource};

    fn u8_payload_proc() -> Arc<PacketProc> {
        // One data stream type (ID 0, implied), one event record type
        // (ID 0, implied) with a single unsigned 8-bit payload field.
        let er_proc = Arc::new(Proc::new(vec![
            Instr::ReadUInt(FixedLenRead {
                len: 8,
                byte_order: ByteOrder::Little,
                align: 8,
            }),
            Instr::EndErProc,
        ]));
        let stream = Arc::new(crate::proc::StreamPacketProc::new(
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

    fn collect_elems<S: DataSource>(vm: &mut Vm<S>) -> Vec<Element> {
        let mut elems = Vec::new();
        loop {
            vm.next_elem().expect("decoding succeeds");
            if vm.is_at_end() {
                return elems;
            }
            elems.push(vm.pos.cur_elem.clone().expect("an element is set"));
        }
    }

    #[test]
    fn empty_source_is_end_of_sequence() {
        let mut vm = Vm::new(u8_payload_proc(), MemorySource::new(Bytes::new()));
        vm.next_elem().unwrap();
        assert!(vm.is_at_end());
        // Advancing an ended VM stays at the end.
        vm.next_elem().unwrap();
        assert!(vm.is_at_end());
    }

    #[test]
    fn single_byte_packet() {
        let mut vm = Vm::new(u8_payload_proc(), MemorySource::new(vec![0x2A]));
        let elems = collect_elems(&mut vm);
        assert_eq!(
            elems,
            vec![
                Element::PacketBeginning,
                Element::PacketContentBeginning,
                Element::EventRecordBeginning,
                Element::UnsignedInteger(42),
                Element::End,
                Element::End,
                Element::End,
            ]
        );
    }

    #[test]
    fn one_byte_windows_still_decode() {
        let mut vm = Vm::new(u8_payload_proc(), ChunkedSource::new(vec![0x2A, 0x07], 1));
        let elems = collect_elems(&mut vm);
        let uints: Vec<_> = elems
            .iter()
            .filter(|e| matches!(e, Element::UnsignedInteger(_)))
            .collect();
        assert_eq!(
            uints,
            vec![&Element::UnsignedInteger(42), &Element::UnsignedInteger(7)]
        );
    }

    #[test]
    fn offsets_never_decrease() {
        let mut vm = Vm::new(u8_payload_proc(), MemorySource::new(vec![1, 2, 3]));
        let mut prev = (0, 0);
        loop {
            vm.next_elem().unwrap();
            if vm.is_at_end() {
                break;
            }
            let cur = (vm.it.offset, vm.it.mark);
            assert!(cur > prev || prev == (0, 0));
            prev = cur;
        }
    }
}
