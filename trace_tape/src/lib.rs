// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `trace_tape`: a streaming decoder for packetized binary trace data.
//!
//! A trace byte stream (an *element sequence*) is a concatenation of
//! self-describing packets carrying event records. The layout of every field
//! is prescribed by a compiled [`PacketProc`]: a tree of procedures of typed
//! read instructions, lowered from a trace type description by a separate
//! front end. The decoder is a pull-driven virtual machine which executes
//! those procedures over a [`DataSource`] and yields a flat, lazy sequence
//! of [`Element`]s, one per [`ElementSeqIter::next`] call, without ever
//! buffering a whole packet.
//!
//! Substring and BLOB payloads are zero-copy [`bytes::Bytes`] views into the
//! source's buffers. Iterator positions can be saved, compared and restored
//! to replay any region of the sequence.
//!
//! ## Example
//!
//! Decoding a one-field trace whose procedures are assembled by hand (a
//! metadata front end would normally build them):
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use trace_tape::bits::ByteOrder;
//! use trace_tape::elem::Element;
//! use trace_tape::instr::{FixedLenRead, Instr, Proc};
//! use trace_tape::iter::ElementSeqIter;
//! use trace_tape::proc::{PacketProc, StreamPacketProc};
//! use trace_tape::source::MemorySource;
//!
//! let er_proc = Arc::new(Proc::new(vec![
//!     Instr::ReadUInt(FixedLenRead { len: 8, byte_order: ByteOrder::Little, align: 8 }),
//!     Instr::EndErProc,
//! ]));
//! let stream = Arc::new(StreamPacketProc::new(
//!     Proc::new(vec![Instr::EndDsPktPreambleProc]),
//!     Proc::new(vec![
//!         Instr::SetEventRecordType { fixed_id: Some(0) },
//!         Instr::EndDsErPreambleProc,
//!     ]),
//!     8,
//!     HashMap::from([(0, er_proc)]),
//! ));
//! let pkt_proc = Arc::new(PacketProc::new(
//!     Proc::new(vec![
//!         Instr::SetDataStreamType { fixed_id: Some(0) },
//!         Instr::EndPktPreambleProc,
//!     ]),
//!     0,
//!     None,
//!     HashMap::from([(0, stream)]),
//! ));
//!
//! let mut it = ElementSeqIter::new(pkt_proc, MemorySource::new(&[0x2A][..]));
//! let mut values = Vec::new();
//! while let Some(elem) = it.next()? {
//!     if let Element::UnsignedInteger(v) = elem {
//!         values.push(*v);
//!     }
//! }
//! assert_eq!(values, [42]);
//! # Ok::<(), trace_tape::error::DecodeError>(())
//! ```

pub mod bits;
pub mod elem;
pub mod error;
pub mod instr;
pub mod iter;
pub mod proc;
pub mod source;

mod pos;
mod vm;

pub use crate::bits::ByteOrder;
pub use crate::elem::{DataStreamInfo, Element, EventRecordInfo, PacketInfo};
pub use crate::error::DecodeError;
pub use crate::instr::{FixedLenRead, Instr, Proc, RangeSet, Scope, VariantOpt};
pub use crate::iter::{ElementSeqIter, IterPos};
pub use crate::proc::{PacketProc, StreamPacketProc, TypeId};
pub use crate::source::{ChunkedSource, DataSource, MemorySource};
