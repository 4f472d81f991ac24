//! Shared framing rules for both directions of the link.
//!
//! A frame is `[length][type][payload...]` where `length` counts every byte
//! after itself. Each frame type declares which lengths it can carry; the
//! [`StreamParser`](crate::StreamParser) uses that table to reject
//! implausible headers before waiting for a body that may never come.

use bytes::{BufMut, BytesMut};
use telemetrix_core::FrameErrorKind;

/// Lengths a frame type may legally declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// Exactly this length.
    Exact(u8),
    /// Any of these lengths.
    OneOf(&'static [u8]),
    /// Any length in `min..=max`.
    Range { min: u8, max: u8 },
}

impl LengthRule {
    /// Returns true if `length` satisfies the rule.
    #[must_use]
    pub fn accepts(&self, length: u8) -> bool {
        match *self {
            Self::Exact(expected) => length == expected,
            Self::OneOf(allowed) => allowed.contains(&length),
            Self::Range { min, max } => (min..=max).contains(&length),
        }
    }

    /// Largest length the rule accepts.
    #[must_use]
    pub fn max(&self) -> u8 {
        match *self {
            Self::Exact(expected) => expected,
            Self::OneOf(allowed) => allowed.iter().copied().max().unwrap_or(0),
            Self::Range { max, .. } => max,
        }
    }
}

/// A frame type that can be reassembled from a byte stream.
///
/// Implemented by [`ReportFrame`](crate::ReportFrame) (what the host reads)
/// and [`Command`](crate::Command) (what the board reads), so the same
/// parser serves both ends of the link.
pub trait WireFrame: Sized {
    /// Check a header before its body has arrived.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason if no frame of `type_byte` can have this
    /// `length`.
    fn check_header(type_byte: u8, length: u8) -> Result<(), FrameErrorKind>;

    /// Build the frame from a complete body.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason if the payload does not decode.
    fn from_wire(type_byte: u8, payload: &[u8]) -> Result<Self, FrameErrorKind>;
}

/// Validate a header against a length rule, rejecting zero lengths and
/// unknown types on the way.
pub(crate) fn check_length(
    type_byte: u8,
    length: u8,
    rule: Option<LengthRule>,
) -> Result<(), FrameErrorKind> {
    if length == 0 {
        return Err(FrameErrorKind::BadLength(length));
    }
    let rule = rule.ok_or(FrameErrorKind::UnknownReportType(type_byte))?;
    if rule.accepts(length) {
        Ok(())
    } else {
        Err(FrameErrorKind::LengthMismatch {
            report_type: type_byte,
            length,
        })
    }
}

/// Write `[length][type][payload]` into `dst`.
pub(crate) fn put_frame(dst: &mut BytesMut, type_byte: u8, payload: &[u8]) {
    dst.reserve(payload.len() + 2);
    // Callers bound payloads well below 255 bytes.
    dst.put_u8((payload.len() + 1) as u8);
    dst.put_u8(type_byte);
    dst.put_slice(payload);
}
