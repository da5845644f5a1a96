// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The VM instruction set.
//!
//! No numeric bytecode is involved: a procedure is a sequence of instruction
//! values, some of which own subprocedures. Subprocedures are shared
//! ([`Arc`]) because the builder reuses them, for example between the option
//! procedures of a variant.
//!
//! Decoding a packet executes, in order: the trace preamble procedure (packet
//! header), the selected data stream type's packet preamble procedure (packet
//! context), then, per event record, the data stream type's event record
//! preamble procedure (header + common context) followed by the selected
//! event record type's procedure (specific context + payload). The
//! `End*Proc` marker instructions bridge those procedures back into the outer
//! state machine.

use std::sync::Arc;

use crate::bits::ByteOrder;
use crate::proc::TypeId;

/// A top-level reading context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Packet header.
    PacketHeader,
    /// Packet context.
    PacketContext,
    /// Event record header.
    EventRecordHeader,
    /// Event record common context.
    EventRecordCommonContext,
    /// Event record specific context.
    EventRecordSpecificContext,
    /// Event record payload.
    EventRecordPayload,
}

/// A set of inclusive integer ranges, as used by variant options and
/// optionals to match selector values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSet<T> {
    ranges: Vec<(T, T)>,
}

impl<T: PartialOrd + Copy> RangeSet<T> {
    /// Creates a range set from `(lower, upper)` inclusive pairs.
    #[must_use]
    pub fn new(ranges: Vec<(T, T)>) -> Self {
        debug_assert!(ranges.iter().all(|(lo, hi)| lo <= hi));
        Self { ranges }
    }

    /// Returns `true` if any range of this set contains `val`.
    #[must_use]
    pub fn contains(&self, val: T) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= val && val <= hi)
    }

    /// Returns the ranges of this set.
    #[must_use]
    pub fn ranges(&self) -> &[(T, T)] {
        &self.ranges
    }
}

/// One option of a "begin reading variant" instruction: the selector ranges
/// which select it and the procedure to execute when selected.
#[derive(Clone, Debug)]
pub struct VariantOpt<T> {
    /// Selector ranges of this option.
    pub ranges: RangeSet<T>,
    /// Procedure decoding this option's data.
    pub proc: Arc<Proc>,
}

/// Parameters common to every fixed-length bit array read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedLenRead {
    /// Length of the read (bits), `1..=64`.
    pub len: u32,
    /// Byte order of the data.
    pub byte_order: ByteOrder,
    /// Alignment of the field (bits, a power of two).
    pub align: u32,
}

/// A procedure instruction.
///
/// Each read instruction starts by aligning the decoding head to its
/// alignment. The handler reactions are documented on the VM.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Instr {
    /// Reads a fixed-length unsigned integer; emits `UnsignedInteger`.
    ReadUInt(FixedLenRead),
    /// Reads a fixed-length signed integer; emits `SignedInteger`.
    ReadSInt(FixedLenRead),
    /// Reads a fixed-length unsigned enumeration; emits
    /// `UnsignedEnumeration`.
    ReadUEnum(FixedLenRead),
    /// Reads a fixed-length signed enumeration; emits `SignedEnumeration`.
    ReadSEnum(FixedLenRead),
    /// Reads a fixed-length boolean; emits `Boolean`.
    ReadBool(FixedLenRead),
    /// Reads a fixed-length bit array; emits `BitArray`.
    ReadBitArray(FixedLenRead),
    /// Reads a fixed-length bit map; emits `BitMap`.
    ReadBitMap(FixedLenRead),
    /// Reads a fixed-length floating point number (32 or 64 bits); emits
    /// `FloatingPointNumber`.
    ReadFloat(FixedLenRead),

    /// Reads a variable-length (LEB128) unsigned integer; emits
    /// `UnsignedInteger`.
    ReadVlUInt {
        /// Alignment (bits).
        align: u32,
    },
    /// Reads a variable-length (LEB128) signed integer; emits
    /// `SignedInteger`.
    ReadVlSInt {
        /// Alignment (bits).
        align: u32,
    },

    /// Begins reading a null-terminated string; the VM transitions into the
    /// substring sub-state machine.
    ReadNtStr {
        /// Alignment (bits).
        align: u32,
    },

    /// Begins reading a whole scope (the root instruction of every preamble
    /// procedure).
    BeginReadScope {
        /// The scope being read.
        scope: Scope,
        /// Alignment (bits).
        align: u32,
        /// Scope procedure.
        proc: Arc<Proc>,
    },
    /// Ends reading a scope.
    EndReadScope {
        /// The scope being ended.
        scope: Scope,
    },

    /// Begins reading a structure.
    BeginReadStruct {
        /// Alignment (bits).
        align: u32,
        /// Member procedure.
        proc: Arc<Proc>,
    },
    /// Ends reading a structure.
    EndReadStruct,

    /// Begins reading a static array: the element procedure executes `len`
    /// times.
    BeginReadStaticArray {
        /// Number of elements.
        len: u64,
        /// Alignment (bits).
        align: u32,
        /// Element procedure.
        proc: Arc<Proc>,
    },
    /// Ends reading a static array.
    EndReadStaticArray,

    /// Begins reading a static text array of `len_bytes` bytes; the VM
    /// transitions into the fixed-length substring sub-state machine.
    BeginReadStaticTextArray {
        /// Number of bytes.
        len_bytes: u64,
        /// Alignment (bits).
        align: u32,
    },
    /// Ends reading a static text array.
    EndReadStaticTextArray,

    /// Begins reading the 16-byte trace UUID; the VM reads the bytes one by
    /// one and then emits `TraceTypeUuid`.
    BeginReadUuidArray {
        /// Alignment (bits).
        align: u32,
    },

    /// Begins reading a dynamic array: the element count comes from a saved
    /// value slot.
    BeginReadDynArray {
        /// Saved value slot holding the length.
        len_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Element procedure.
        proc: Arc<Proc>,
    },
    /// Ends reading a dynamic array.
    EndReadDynArray,

    /// Begins reading a dynamic text array; the byte count comes from a
    /// saved value slot.
    BeginReadDynTextArray {
        /// Saved value slot holding the length (bytes).
        len_slot: usize,
        /// Alignment (bits).
        align: u32,
    },
    /// Ends reading a dynamic text array.
    EndReadDynTextArray,

    /// Begins reading a static BLOB of `len_bytes` raw bytes.
    BeginReadStaticBlob {
        /// Number of bytes.
        len_bytes: u64,
        /// Alignment (bits).
        align: u32,
    },
    /// Ends reading a static BLOB.
    EndReadStaticBlob,

    /// Begins reading a dynamic BLOB; the byte count comes from a saved
    /// value slot.
    BeginReadDynBlob {
        /// Saved value slot holding the length (bytes).
        len_slot: usize,
        /// Alignment (bits).
        align: u32,
    },
    /// Ends reading a dynamic BLOB.
    EndReadDynBlob,

    /// Begins reading a variant with an unsigned integer selector.
    BeginReadVariantUSel {
        /// Saved value slot holding the selector.
        sel_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Options, scanned in order.
        opts: Vec<VariantOpt<u64>>,
    },
    /// Begins reading a variant with a signed integer selector.
    BeginReadVariantSSel {
        /// Saved value slot holding the selector.
        sel_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Options, scanned in order.
        opts: Vec<VariantOpt<i64>>,
    },
    /// Ends reading a variant.
    EndReadVariant,

    /// Begins reading an optional with a boolean selector.
    BeginReadOptBoolSel {
        /// Saved value slot holding the selector.
        sel_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Data procedure, executed when the optional is enabled.
        proc: Arc<Proc>,
    },
    /// Begins reading an optional with an unsigned integer selector.
    BeginReadOptUSel {
        /// Saved value slot holding the selector.
        sel_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Selector ranges enabling the optional.
        ranges: RangeSet<u64>,
        /// Data procedure, executed when the optional is enabled.
        proc: Arc<Proc>,
    },
    /// Begins reading an optional with a signed integer selector.
    BeginReadOptSSel {
        /// Saved value slot holding the selector.
        sel_slot: usize,
        /// Alignment (bits).
        align: u32,
        /// Selector ranges enabling the optional.
        ranges: RangeSet<i64>,
        /// Data procedure, executed when the optional is enabled.
        proc: Arc<Proc>,
    },
    /// Ends reading an optional.
    EndReadOpt,

    /// Saves the last decoded integer value into a saved value slot.
    SaveVal {
        /// Destination slot.
        slot: usize,
    },

    /// Sets the current type ID from the last decoded integer value.
    SetCurId,
    /// Selects the current data stream type from the current ID (or from
    /// `fixed_id` when the trace has a single, implied data stream type).
    SetDataStreamType {
        /// ID to use instead of the current ID.
        fixed_id: Option<TypeId>,
    },
    /// Selects the current event record type from the current ID (or from
    /// `fixed_id` when the data stream type has a single, implied event
    /// record type).
    SetEventRecordType {
        /// ID to use instead of the current ID.
        fixed_id: Option<TypeId>,
    },
    /// Records the data stream ID (instance ID, not type ID) from the last
    /// decoded integer value.
    SetDataStreamId,
    /// Records the packet origin index from the last decoded integer value.
    SetPktOriginIndex,
    /// Records the packet sequence number from the last decoded integer
    /// value.
    SetPktSeqNum,
    /// Records the discarded event record counter snapshot from the last
    /// decoded integer value.
    SetPktDiscErCounter,
    /// Validates and records the expected packet total length (bits) from
    /// the last decoded integer value.
    SetExpectedPktTotalLen,
    /// Validates and records the expected packet content length (bits) from
    /// the last decoded integer value.
    SetExpectedPktContentLen,
    /// Emits `PacketMagicNumber` from the last decoded integer value.
    SetPktMagicNumber,
    /// Records the packet end clock value from the last decoded integer
    /// value.
    SetPktEndDefClkVal,
    /// Updates the default clock from the low `len` bits just decoded; emits
    /// `DefaultClockValue`.
    UpdateDefClkVal {
        /// Length of the decoded clock snapshot (bits).
        len: u32,
    },
    /// Emits the pending `DataStreamInfo` element.
    SetDsInfo,
    /// Emits the pending `PacketInfo` element.
    SetPktInfo,
    /// Emits the pending `EventRecordInfo` element.
    SetErInfo,

    /// Marks the end of the trace preamble procedure.
    EndPktPreambleProc,
    /// Marks the end of a data stream packet preamble procedure.
    EndDsPktPreambleProc,
    /// Marks the end of a data stream event record preamble procedure.
    EndDsErPreambleProc,
    /// Marks the end of an event record type procedure.
    EndErProc,
}

/// A procedure: an ordered sequence of instructions.
#[derive(Clone, Debug, Default)]
pub struct Proc {
    instrs: Vec<Instr>,
}

impl Proc {
    /// Creates a procedure from `instrs`.
    #[must_use]
    pub fn new(instrs: Vec<Instr>) -> Self {
        Self { instrs }
    }

    /// Returns the instructions of this procedure.
    #[must_use]
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Returns `true` if this procedure has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_set_contains() {
        let set = RangeSet::new(vec![(0u64, 5), (6, 10)]);
        assert!(set.contains(0));
        assert!(set.contains(5));
        assert!(set.contains(7));
        assert!(set.contains(10));
        assert!(!set.contains(11));
    }

    #[test]
    fn range_set_signed_bounds() {
        let set = RangeSet::new(vec![(-4i64, -1)]);
        assert!(set.contains(-4));
        assert!(set.contains(-1));
        assert!(!set.contains(0));
        assert!(!set.contains(-5));
    }

    #[test]
    fn shared_subprocedures() {
        let elem = Arc::new(Proc::new(vec![Instr::ReadUInt(FixedLenRead {
            len: 16,
            byte_order: ByteOrder::Little,
            align: 8,
        })]));
        let a = Instr::BeginReadStaticArray {
            len: 4,
            align: 8,
            proc: Arc::clone(&elem),
        };
        let b = Instr::BeginReadDynArray {
            len_slot: 0,
            align: 8,
            proc: Arc::clone(&elem),
        };
        assert_eq!(Arc::strong_count(&elem), 3);
        drop((a, b));
        assert_eq!(Arc::strong_count(&elem), 1);
    }
}
