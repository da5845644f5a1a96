// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The element taxonomy.
//!
//! An element sequence iterator yields one [`Element`] per advance. Compound
//! data (scopes, structures, arrays, variants, optionals, strings, BLOBs) is
//! delimited by a beginning element and a single [`Element::End`] closing the
//! most recently opened scope; everything in between belongs to it.
//!
//! Elements are plain values. Substring and BLOB section payloads are
//! zero-copy [`Bytes`] views into the data source's buffers.

use bytes::Bytes;

use crate::instr::Scope;
use crate::proc::TypeId;

/// Information about the current data stream, emitted once per packet after
/// the packet header is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataStreamInfo {
    /// Data stream type ID, when the packet header carries (or implies) one.
    pub type_id: Option<TypeId>,
    /// Data stream ID (instance ID, not type ID), when the packet header
    /// carries one.
    pub stream_id: Option<u64>,
}

/// Information about the current packet, emitted once per packet after the
/// packet context is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    /// Expected packet total length (bits), when known.
    pub expected_total_len: Option<u64>,
    /// Expected packet content length (bits), when known.
    pub expected_content_len: Option<u64>,
    /// Packet origin index, when the packet context carries one.
    pub origin_index: Option<u64>,
    /// Packet sequence number, when the packet context carries one.
    pub seq_num: Option<u64>,
    /// Discarded event record counter snapshot, when the packet context
    /// carries one.
    pub disc_er_counter: Option<u64>,
    /// Default clock value at the end of the packet, when the packet context
    /// carries one.
    pub end_def_clk_val: Option<u64>,
}

/// Information about the current event record, emitted once per event record
/// after its header is decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventRecordInfo {
    /// Event record type ID, when the header carries (or implies) one.
    pub type_id: Option<TypeId>,
}

/// One element of an element sequence.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Element {
    /// Beginning of a packet.
    PacketBeginning,
    /// Beginning of the content of the current packet.
    PacketContentBeginning,
    /// Beginning of a top-level reading scope.
    ScopeBeginning(Scope),
    /// Beginning of an event record.
    EventRecordBeginning,
    /// Data stream information.
    DataStreamInfo(DataStreamInfo),
    /// Packet information.
    PacketInfo(PacketInfo),
    /// Event record information.
    EventRecordInfo(EventRecordInfo),
    /// The packet magic number.
    PacketMagicNumber(u64),
    /// The trace UUID decoded from the packet header, along with the one the
    /// trace type declares. Comparing them is the consumer's concern.
    TraceTypeUuid {
        /// UUID decoded from the packet header.
        uuid: [u8; 16],
        /// UUID declared by the trace type.
        expected: Option<[u8; 16]>,
    },
    /// The default clock value after an update.
    DefaultClockValue(u64),
    /// A fixed-length or variable-length signed integer.
    SignedInteger(i64),
    /// A fixed-length or variable-length unsigned integer.
    UnsignedInteger(u64),
    /// A fixed-length signed enumeration.
    SignedEnumeration(i64),
    /// A fixed-length unsigned enumeration.
    UnsignedEnumeration(u64),
    /// A fixed-length boolean.
    Boolean(bool),
    /// A fixed-length bit array.
    BitArray(u64),
    /// A fixed-length bit map.
    BitMap(u64),
    /// A fixed-length floating point number.
    FloatingPointNumber(f64),
    /// Beginning of a null-terminated string.
    StringBeginning,
    /// One section of a string or text array, including any terminating null
    /// byte. A single string may span several substrings when it crosses
    /// buffer refills.
    Substring(Bytes),
    /// Beginning of a static array of `len` elements.
    StaticArrayBeginning {
        /// Number of elements.
        len: u64,
    },
    /// Beginning of a dynamic array of `len` elements.
    DynamicArrayBeginning {
        /// Number of elements.
        len: u64,
    },
    /// Beginning of a static text array of `len` bytes.
    StaticTextArrayBeginning {
        /// Number of bytes.
        len: u64,
    },
    /// Beginning of a dynamic text array of `len` bytes.
    DynamicTextArrayBeginning {
        /// Number of bytes.
        len: u64,
    },
    /// Beginning of a static BLOB of `len` bytes.
    StaticBlobBeginning {
        /// Number of bytes.
        len: u64,
    },
    /// Beginning of a dynamic BLOB of `len` bytes.
    DynamicBlobBeginning {
        /// Number of bytes.
        len: u64,
    },
    /// One section of a BLOB. A single BLOB may span several sections when
    /// it crosses buffer refills.
    BlobSection(Bytes),
    /// Beginning of a structure.
    StructureBeginning,
    /// Beginning of a variant with a signed integer selector.
    VariantWithSignedSelectorBeginning {
        /// Selector value which chose the option.
        sel_val: i64,
    },
    /// Beginning of a variant with an unsigned integer selector.
    VariantWithUnsignedSelectorBeginning {
        /// Selector value which chose the option.
        sel_val: u64,
    },
    /// Beginning of an optional with a boolean selector.
    OptionalWithBooleanSelectorBeginning {
        /// Whether the optional data is present.
        enabled: bool,
    },
    /// Beginning of an optional with a signed integer selector.
    OptionalWithSignedSelectorBeginning {
        /// Selector value.
        sel_val: i64,
        /// Whether the optional data is present.
        enabled: bool,
    },
    /// Beginning of an optional with an unsigned integer selector.
    OptionalWithUnsignedSelectorBeginning {
        /// Selector value.
        sel_val: u64,
        /// Whether the optional data is present.
        enabled: bool,
    },
    /// End of the most recently opened packet, packet content, scope, event
    /// record, structure, array, string, BLOB, variant or optional.
    End,
}

impl Element {
    /// Returns `true` if this element ends the most recently opened scope.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}
