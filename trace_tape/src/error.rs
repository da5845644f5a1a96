// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Decoding errors.
//!
//! Every error carries the bit offset, within the element sequence, at which
//! the decoder was positioned when the error was detected. Decoding errors
//! are terminal: after an iterator returns one, further calls are safe but
//! their results are unspecified.

use thiserror::Error;

use crate::bits::ByteOrder;

/// An error occurring while decoding an element sequence.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The data source was exhausted in the middle of a packet.
    #[error("premature end of data at bit {offset_bits}: {needed_bits} more bit(s) needed")]
    PrematureEndOfData {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Number of bits the decoder needed.
        needed_bits: u64,
    },

    /// A read would cross the expected end of the packet content.
    #[error(
        "cannot decode {needed_bits} bit(s) at bit {offset_bits}: \
         only {remaining_bits} bit(s) of packet content remain"
    )]
    DataBeyondPacketContent {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Number of bits the decoder needed.
        needed_bits: u64,
        /// Number of bits remaining in the packet content.
        remaining_bits: u64,
    },

    /// A decoded expected packet total length is not a multiple of 8.
    #[error("expected packet total length ({len_bits} bits) at bit {offset_bits} is not a multiple of 8")]
    ExpectedTotalLenNotMultipleOf8 {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// The offending total length (bits).
        len_bits: u64,
    },

    /// A decoded expected packet total length is less than the expected
    /// packet content length.
    #[error(
        "expected packet total length ({total_len_bits} bits) at bit {offset_bits} \
         is less than expected packet content length ({content_len_bits} bits)"
    )]
    ExpectedTotalLenLtContentLen {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Expected total length (bits).
        total_len_bits: u64,
        /// Expected content length (bits).
        content_len_bits: u64,
    },

    /// A decoded expected packet total length is less than the current
    /// decoding offset within the packet.
    #[error(
        "expected packet total length ({len_bits} bits) at bit {offset_bits} \
         is less than the current offset in the packet ({offset_in_pkt_bits} bits)"
    )]
    ExpectedTotalLenLtOffsetInPkt {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Expected total length (bits).
        len_bits: u64,
        /// Current offset within the packet (bits).
        offset_in_pkt_bits: u64,
    },

    /// A decoded expected packet content length is less than the current
    /// decoding offset within the packet.
    #[error(
        "expected packet content length ({len_bits} bits) at bit {offset_bits} \
         is less than the current offset in the packet ({offset_in_pkt_bits} bits)"
    )]
    ExpectedContentLenLtOffsetInPkt {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Expected content length (bits).
        len_bits: u64,
        /// Current offset within the packet (bits).
        offset_in_pkt_bits: u64,
    },

    /// A bit array which does not start on a byte boundary has a byte order
    /// which differs from the byte order of the previous bit array.
    #[error("byte order changed from {prev:?} to {next:?} within a byte at bit {offset_bits}")]
    ByteOrderChangeWithinByte {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// Byte order of the previous bit array.
        prev: ByteOrder,
        /// Byte order of the new bit array.
        next: ByteOrder,
    },

    /// The decoded data stream type ID is unknown to the procedure tree.
    #[error("unknown data stream type ID {id} at bit {offset_bits}")]
    UnknownDataStreamType {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// The offending ID.
        id: u64,
    },

    /// The decoded event record type ID is unknown to the current data
    /// stream type.
    #[error("unknown event record type ID {id} at bit {offset_bits}")]
    UnknownEventRecordType {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// The offending ID.
        id: u64,
    },

    /// No option of a variant with a signed selector contains the selector
    /// value.
    #[error("no variant option matches signed selector value {sel_val} at bit {offset_bits}")]
    InvalidVariantSignedSelectorValue {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// The selector value.
        sel_val: i64,
    },

    /// No option of a variant with an unsigned selector contains the
    /// selector value.
    #[error("no variant option matches unsigned selector value {sel_val} at bit {offset_bits}")]
    InvalidVariantUnsignedSelectorValue {
        /// Bit offset within the element sequence.
        offset_bits: u64,
        /// The selector value.
        sel_val: u64,
    },

    /// A variable-length integer encodes more than 64 value bits.
    #[error("variable-length integer at bit {offset_bits} is longer than 64 bits")]
    UnsupportedVariableLengthIntegerLength {
        /// Bit offset within the element sequence (start of the integer).
        offset_bits: u64,
    },
}

impl DecodeError {
    /// Returns the bit offset, within the element sequence, at which this
    /// error was detected.
    #[must_use]
    pub fn offset_bits(&self) -> u64 {
        match self {
            Self::PrematureEndOfData { offset_bits, .. }
            | Self::DataBeyondPacketContent { offset_bits, .. }
            | Self::ExpectedTotalLenNotMultipleOf8 { offset_bits, .. }
            | Self::ExpectedTotalLenLtContentLen { offset_bits, .. }
            | Self::ExpectedTotalLenLtOffsetInPkt { offset_bits, .. }
            | Self::ExpectedContentLenLtOffsetInPkt { offset_bits, .. }
            | Self::ByteOrderChangeWithinByte { offset_bits, .. }
            | Self::UnknownDataStreamType { offset_bits, .. }
            | Self::UnknownEventRecordType { offset_bits, .. }
            | Self::InvalidVariantSignedSelectorValue { offset_bits, .. }
            | Self::InvalidVariantUnsignedSelectorValue { offset_bits, .. }
            | Self::UnsupportedVariableLengthIntegerLength { offset_bits } => *offset_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_offset() {
        let e = DecodeError::PrematureEndOfData {
            offset_bits: 96,
            needed_bits: 16,
        };
        assert_eq!(
            e.to_string(),
            "premature end of data at bit 96: 16 more bit(s) needed"
        );
        assert_eq!(e.offset_bits(), 96);
    }

    #[test]
    fn byte_order_change_display() {
        let e = DecodeError::ByteOrderChangeWithinByte {
            offset_bits: 13,
            prev: ByteOrder::Little,
            next: ByteOrder::Big,
        };
        assert!(e.to_string().contains("within a byte at bit 13"));
    }
}
