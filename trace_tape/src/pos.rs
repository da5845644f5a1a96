// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The VM position: the entire decodable state of the VM, excluding
//! everything related to the data source and buffering.
//!
//! A [`VmPos`] is a plain value; cloning one is how iterator checkpoints are
//! taken. The current element lives inside the position as a value, so a
//! clone needs no pointer fixups.

use std::sync::Arc;

use crate::bits::ByteOrder;
use crate::elem::{DataStreamInfo, Element, EventRecordInfo, PacketInfo};
use crate::instr::Proc;
use crate::proc::{StreamPacketProc, TypeId};

/// Sentinel marking a saved value slot which has not been written since the
/// last new-packet reset.
pub(crate) const SAVED_VAL_UNSET: u64 = u64::MAX;

/// Dispatcher states of the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VmState {
    BeginPkt,
    BeginPktContent,
    EndPktContent,
    EndPkt,
    BeginEr,
    EndEr,
    ExecInstr,
    ExecArrayInstr,
    ReadUuidByte,
    SetTraceTypeUuid,
    ReadSubstrUntilNull,
    ReadSubstr,
    ReadBlobSection,
    EndStr,
    ContinueSkipPaddingBits,
    ContinueSkipContentPaddingBits,
}

/// One frame of the VM stack.
#[derive(Clone, Debug)]
pub(crate) struct StackFrame {
    /// Procedure this frame executes.
    pub proc: Arc<Proc>,
    /// Index of the next instruction to execute within `proc`.
    pub pc: usize,
    /// State to restore when this frame pops.
    pub parent_state: VmState,
    /// For array procedures: elements left to read. For text array, BLOB and
    /// UUID frames: bytes left to read.
    pub rem_elems: u64,
}

/// The entire decodable state of the VM.
#[derive(Clone, Debug)]
pub(crate) struct VmPos {
    /// Next dispatcher state to handle.
    pub state: VmState,
    /// Stack of procedure frames.
    pub stack: Vec<StackFrame>,
    /// Offset of the current packet within the element sequence (bits);
    /// always a multiple of 8.
    pub cur_pkt_offset_bits: u64,
    /// Decoding head offset within the current packet (bits).
    pub head_offset_bits: u64,
    /// Expected total length of the current packet (bits), once decoded.
    pub expected_total_len_bits: Option<u64>,
    /// Expected content length of the current packet (bits), once decoded.
    pub expected_content_len_bits: Option<u64>,
    /// The last decoded integer value. The signed view is a
    /// bit-reinterpretation of the same storage.
    pub last_int_val: u64,
    /// Byte order of the most recent fixed-length bit array read, if any.
    pub last_bo: Option<ByteOrder>,
    /// Remaining padding bits to skip.
    pub rem_bits_to_skip: u64,
    /// State to restore once the padding skip completes.
    pub post_skip_state: VmState,
    /// State to restore once a null-terminated string read completes.
    pub post_end_str_state: VmState,
    /// Saved values (dynamic lengths and selectors).
    pub saved_vals: Vec<u64>,
    /// Default clock value accumulator.
    pub def_clk_val: u64,
    /// Scratch for the 16 trace UUID bytes decoded from the packet header.
    pub uuid: [u8; 16],
    /// Current type ID (data stream or event record type).
    pub cur_id: TypeId,
    /// Procedures of the current data stream type, once selected.
    pub cur_stream_proc: Option<Arc<StreamPacketProc>>,
    /// Procedure of the current event record type, once selected.
    pub cur_er_proc: Option<Arc<Proc>>,
    /// Pending data stream info, accumulated by bookkeeping instructions and
    /// emitted by `SetDsInfo`.
    pub pending_ds_info: DataStreamInfo,
    /// Pending packet info, emitted by `SetPktInfo`.
    pub pending_pkt_info: PacketInfo,
    /// Pending event record info, emitted by `SetErInfo`.
    pub pending_er_info: EventRecordInfo,
    /// The element most recently emitted, if any.
    pub cur_elem: Option<Element>,
}

impl VmPos {
    /// Creates an empty position with `saved_vals_count` saved value slots.
    pub fn new(saved_vals_count: usize) -> Self {
        Self {
            state: VmState::BeginPkt,
            stack: Vec::new(),
            cur_pkt_offset_bits: 0,
            head_offset_bits: 0,
            expected_total_len_bits: None,
            expected_content_len_bits: None,
            last_int_val: 0,
            last_bo: None,
            rem_bits_to_skip: 0,
            post_skip_state: VmState::BeginPkt,
            post_end_str_state: VmState::ExecInstr,
            saved_vals: vec![SAVED_VAL_UNSET; saved_vals_count],
            def_clk_val: 0,
            uuid: [0; 16],
            cur_id: 0,
            cur_stream_proc: None,
            cur_er_proc: None,
            pending_ds_info: DataStreamInfo::default(),
            pending_pkt_info: PacketInfo::default(),
            pending_er_info: EventRecordInfo::default(),
            cur_elem: None,
        }
    }

    /// Resets everything packet-local, leaving `cur_pkt_offset_bits` in
    /// place.
    pub fn reset_for_new_pkt(&mut self) {
        self.head_offset_bits = 0;
        self.state = VmState::BeginPkt;
        self.last_bo = None;
        self.cur_stream_proc = None;
        self.cur_er_proc = None;
        self.expected_total_len_bits = None;
        self.expected_content_len_bits = None;
        self.stack.clear();
        self.def_clk_val = 0;
        self.pending_ds_info = DataStreamInfo::default();
        self.pending_pkt_info = PacketInfo::default();
        self.pending_er_info = EventRecordInfo::default();
        self.saved_vals.fill(SAVED_VAL_UNSET);
    }

    /// Returns the head offset from the beginning of the element sequence
    /// (bits).
    pub fn head_offset_in_elem_seq(&self) -> u64 {
        self.cur_pkt_offset_bits + self.head_offset_bits
    }

    /// Returns the number of bits between the head and the expected end of
    /// the packet content, or `u64::MAX` when the content length is still
    /// unknown.
    pub fn rem_content_bits(&self) -> u64 {
        match self.expected_content_len_bits {
            Some(content) => {
                debug_assert!(content >= self.head_offset_bits);
                content - self.head_offset_bits
            }
            None => u64::MAX,
        }
    }

    pub fn stack_push(&mut self, proc: Arc<Proc>) {
        self.stack.push(StackFrame {
            proc,
            pc: 0,
            parent_state: self.state,
            rem_elems: 0,
        });
    }

    pub fn stack_top(&self) -> &StackFrame {
        self.stack.last().expect("VM stack is not empty")
    }

    pub fn stack_top_mut(&mut self) -> &mut StackFrame {
        self.stack.last_mut().expect("VM stack is not empty")
    }

    pub fn stack_pop(&mut self) {
        let popped = self.stack.pop();
        debug_assert!(popped.is_some());
    }

    /// Restores the parent state of the top frame, then pops it.
    pub fn set_parent_state_and_pop(&mut self) {
        self.state = self.stack_top().parent_state;
        self.stack_pop();
    }

    /// Advances the program counter of the top frame.
    pub fn goto_next_instr(&mut self) {
        self.stack_top_mut().pc += 1;
    }

    /// Pushes `proc` as the only frame on an empty stack.
    pub fn load_new_proc(&mut self, proc: Arc<Proc>) {
        debug_assert!(self.stack.is_empty());
        self.stack_push(proc);
    }

    pub fn save_val(&mut self, slot: usize) {
        debug_assert!(slot < self.saved_vals.len());
        self.saved_vals[slot] = self.last_int_val;
    }

    pub fn saved_val(&self, slot: usize) -> u64 {
        debug_assert!(slot < self.saved_vals.len());
        self.saved_vals[slot]
    }

    /// Updates the default clock value from the last decoded integer, which
    /// holds the low `len` bits of the clock.
    ///
    /// When the new low bits are smaller than the current ones, the clock is
    /// assumed to have wrapped exactly once since the previous update;
    /// intervals longer than `2^len` ticks between updates silently
    /// undercount.
    pub fn update_def_clk_val(&mut self, len: u32) -> u64 {
        debug_assert!((1..=64).contains(&len));

        // A 64-bit snapshot is the whole clock value: overwrite directly.
        if len == 64 {
            self.def_clk_val = self.last_int_val;
            return self.def_clk_val;
        }

        let mut cur = self.def_clk_val;
        let new_val_mask = (1u64 << len) - 1;
        let cur_masked = cur & new_val_mask;

        if self.last_int_val < cur_masked {
            cur = cur.wrapping_add(new_val_mask + 1);
        }

        cur &= !new_val_mask;
        cur |= self.last_int_val;
        self.def_clk_val = cur;
        cur
    }
}
