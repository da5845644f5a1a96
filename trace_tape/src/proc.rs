// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The compiled procedure tree consumed by the VM.
//!
//! A [`PacketProc`] holds everything needed to decode any packet of one
//! trace: the trace preamble procedure (packet header), and one
//! [`StreamPacketProc`] per data stream type, each holding its packet
//! preamble procedure (packet context), its event record preamble procedure
//! (event record header + common context) and one procedure per event record
//! type (specific context + payload).
//!
//! Building a `PacketProc` from a trace type description is the lowering
//! front end's job; the VM treats the tree as read-only.

use std::collections::HashMap;
use std::sync::Arc;

use crate::instr::Proc;

/// A data stream type or event record type ID.
pub type TypeId = u64;

/// The procedures decoding the event records and packet context of one data
/// stream type.
#[derive(Clone, Debug)]
pub struct StreamPacketProc {
    pkt_preamble_proc: Arc<Proc>,
    er_preamble_proc: Arc<Proc>,
    er_align: u32,
    er_procs: HashMap<TypeId, Arc<Proc>>,
}

impl StreamPacketProc {
    /// Creates the procedures of one data stream type.
    ///
    /// `er_align` is the alignment (bits) applied before each event record.
    #[must_use]
    pub fn new(
        pkt_preamble_proc: Proc,
        er_preamble_proc: Proc,
        er_align: u32,
        er_procs: HashMap<TypeId, Arc<Proc>>,
    ) -> Self {
        debug_assert!(er_align.is_power_of_two());
        Self {
            pkt_preamble_proc: Arc::new(pkt_preamble_proc),
            er_preamble_proc: Arc::new(er_preamble_proc),
            er_align,
            er_procs,
        }
    }

    /// Returns the packet preamble procedure (packet context).
    #[must_use]
    pub fn pkt_preamble_proc(&self) -> &Arc<Proc> {
        &self.pkt_preamble_proc
    }

    /// Returns the event record preamble procedure (header + common
    /// context).
    #[must_use]
    pub fn er_preamble_proc(&self) -> &Arc<Proc> {
        &self.er_preamble_proc
    }

    /// Returns the alignment (bits) applied before each event record.
    #[must_use]
    pub fn er_align(&self) -> u32 {
        self.er_align
    }

    /// Returns the procedure of the event record type `id`, if any.
    #[must_use]
    pub fn er_proc(&self, id: TypeId) -> Option<&Arc<Proc>> {
        self.er_procs.get(&id)
    }
}

/// The whole compiled procedure tree for one trace type.
#[derive(Clone, Debug)]
pub struct PacketProc {
    preamble_proc: Arc<Proc>,
    saved_vals_count: usize,
    uuid: Option<[u8; 16]>,
    stream_procs: HashMap<TypeId, Arc<StreamPacketProc>>,
}

impl PacketProc {
    /// Creates a packet procedure.
    ///
    /// `saved_vals_count` is the number of saved value slots the procedures
    /// use (dynamic lengths and selectors); `uuid` is the trace type's
    /// declared UUID, compared by consumers against the one decoded from
    /// packet headers.
    #[must_use]
    pub fn new(
        preamble_proc: Proc,
        saved_vals_count: usize,
        uuid: Option<[u8; 16]>,
        stream_procs: HashMap<TypeId, Arc<StreamPacketProc>>,
    ) -> Self {
        Self {
            preamble_proc: Arc::new(preamble_proc),
            saved_vals_count,
            uuid,
            stream_procs,
        }
    }

    /// Returns the trace preamble procedure (packet header).
    #[must_use]
    pub fn preamble_proc(&self) -> &Arc<Proc> {
        &self.preamble_proc
    }

    /// Returns the number of saved value slots the procedures use.
    #[must_use]
    pub fn saved_vals_count(&self) -> usize {
        self.saved_vals_count
    }

    /// Returns the trace type's declared UUID, if any.
    #[must_use]
    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.uuid
    }

    /// Returns the procedures of the data stream type `id`, if any.
    #[must_use]
    pub fn stream_proc(&self, id: TypeId) -> Option<&Arc<StreamPacketProc>> {
        self.stream_procs.get(&id)
    }

    /// Returns the number of data stream types.
    #[must_use]
    pub fn stream_procs_count(&self) -> usize {
        self.stream_procs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Instr;

    #[test]
    fn lookups() {
        let er_procs: HashMap<TypeId, Arc<Proc>> = [(
            17,
            Arc::new(Proc::new(vec![Instr::EndErProc])),
        )]
        .into_iter()
        .collect();
        let ds = Arc::new(StreamPacketProc::new(
            Proc::new(vec![Instr::EndDsPktPreambleProc]),
            Proc::new(vec![Instr::EndDsErPreambleProc]),
            8,
            er_procs,
        ));
        let pkt = PacketProc::new(
            Proc::new(vec![Instr::EndPktPreambleProc]),
            2,
            None,
            [(1, ds)].into_iter().collect(),
        );

        assert_eq!(pkt.saved_vals_count(), 2);
        assert_eq!(pkt.stream_procs_count(), 1);
        let ds = pkt.stream_proc(1).expect("stream type 1");
        assert_eq!(ds.er_align(), 8);
        assert!(ds.er_proc(17).is_some());
        assert!(ds.er_proc(18).is_none());
        assert!(pkt.stream_proc(2).is_none());
    }
}
