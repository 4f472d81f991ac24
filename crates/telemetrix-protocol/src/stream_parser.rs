//! Stream parser for length-prefixed Telemetrix frames.
//!
//! This module provides a stateful parser that reassembles frames from a byte
//! stream delivered in arbitrary chunks. Serial and TCP links give no
//! message boundaries, so a single read may hold part of a frame, several
//! frames, or garbage left behind by a glitch.
//!
//! # Resynchronization
//!
//! The wire format has no start marker and no checksum. The parser instead
//! checks every header against the frame type's length table as soon as the
//! two header bytes are buffered:
//!
//! - an unknown type, a zero length, or a length the type cannot carry means
//!   the first byte is not a frame start: drop one byte and look again
//! - a plausible header whose body fails to decode is treated the same way
//!
//! A run of consecutive drops is reported once, as a single [`FrameError`]
//! carrying the first rejection reason and the total byte count. The error is
//! queued immediately before the frame that ended the run, so callers see
//! errors and frames in stream order.
//!
//! ## Truncated frames
//!
//! Recovery only works for bytes that cannot start a frame. A frame cut
//! short on the wire leaves a plausible header behind, and the parser takes
//! its body from whatever follows: `[4, 3, 2]` followed by a digital report
//! `[3, 2, 7, 0]` decodes as an analog reading of pin 2 with value 770, and
//! the leftover `[7, 0]` is discarded. Without a checksum this cannot be
//! detected here; a consumer that needs to rule it out must validate values
//! against what the pin can produce.
//!
//! # Usage
//!
//! ```
//! use telemetrix_protocol::{Report, StreamParser};
//!
//! let mut parser: StreamParser = StreamParser::new();
//!
//! // An analog report split across two reads
//! parser.feed(&[4, 3, 2]);
//! assert!(parser.next_item().is_none());
//! parser.feed(&[0x01, 0x00]);
//!
//! let frame = parser.next_item().unwrap().unwrap();
//! assert_eq!(frame.report().unwrap(), Report::Analog { pin: 2, value: 256 });
//! ```

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::marker::PhantomData;
use telemetrix_core::constants::MAX_REPORT_LENGTH;
use telemetrix_core::{FrameError, FrameErrorKind};

use crate::frame::WireFrame;
use crate::reports::ReportFrame;

/// Initial buffer capacity; a few maximum-size frames.
const INITIAL_BUFFER_CAPACITY: usize = 4 * (MAX_REPORT_LENGTH + 1);

/// Recommended initial capacity for the output queue.
const INITIAL_QUEUE_CAPACITY: usize = 8;

/// State machine states for frame reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Fewer than two bytes buffered; the next frame's header is incomplete.
    WaitingHeader,

    /// Header accepted, waiting for the rest of the frame.
    ReadingBody {
        /// Frame type byte from the header.
        frame_type: u8,
        /// Declared length (type + payload).
        length: u8,
    },
}

/// Output of the parser: a frame, or a coalesced run of discarded bytes.
pub type ParsedItem<F> = Result<F, FrameError>;

/// Stateful stream parser for length-prefixed frames.
///
/// Generic over the frame type so the same state machine decodes reports on
/// the host side and commands on a simulated board. Defaults to
/// [`ReportFrame`].
///
/// # State Machine
///
/// ```text
/// ┌──────────────┐ header plausible ┌─────────────┐ body complete ┌──────────────┐
/// │WaitingHeader │─────────────────>│ ReadingBody │──────────────>│ Frame queued │
/// └──────────────┘                  └─────────────┘               └──────────────┘
///    ^   │  header rejected                │ body rejected                │
///    │   │  (drop 1 byte)                  │ (drop 1 byte)                │
///    │   └─────────────────────────────────┘                              │
///    └────────────────────────────────────────────────────────────────────┘
/// ```
///
/// The parser never holds more than one unfinished frame: once a header is
/// accepted it waits for at most the declared length, which is bounded by
/// the frame type's length table.
#[derive(Debug)]
pub struct StreamParser<F: WireFrame = ReportFrame> {
    /// Bytes not yet consumed by a frame or a discard.
    buffer: BytesMut,

    /// Current state of the parser state machine.
    state: ParserState,

    /// Resynchronization run in progress, reported before the next frame.
    pending_error: Option<FrameError>,

    /// Items ready for extraction, in stream order.
    items: VecDeque<ParsedItem<F>>,

    _frame: PhantomData<fn() -> F>,
}

impl<F: WireFrame> StreamParser<F> {
    /// Create a new stream parser.
    ///
    /// # Example
    ///
    /// ```
    /// use telemetrix_protocol::{ParserState, StreamParser};
    ///
    /// let parser: StreamParser = StreamParser::new();
    /// assert_eq!(parser.state(), ParserState::WaitingHeader);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            state: ParserState::WaitingHeader,
            pending_error: None,
            items: VecDeque::with_capacity(INITIAL_QUEUE_CAPACITY),
            _frame: PhantomData,
        }
    }

    /// Feed bytes from the transport into the parser.
    ///
    /// Every complete frame in the buffered bytes is extracted, so a single
    /// call may queue several items. Chunk boundaries never change the
    /// result: feeding a stream in one call or byte by byte yields the same
    /// items.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while self.try_extract_frame() {
            // Keep extracting while complete frames remain
        }
    }

    /// Next frame or frame error, if one is ready.
    pub fn next_item(&mut self) -> Option<ParsedItem<F>> {
        self.items.pop_front()
    }

    /// Returns current parser state.
    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of items ready for extraction.
    #[must_use]
    pub fn items_available(&self) -> usize {
        self.items.len()
    }

    /// Bytes buffered but not yet part of an emitted item.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes dropped so far in a resynchronization run that has not yet
    /// been reported.
    #[must_use]
    pub fn pending_discards(&self) -> usize {
        self.pending_error.as_ref().map_or(0, |e| e.discarded)
    }

    /// Flush state at end of stream.
    ///
    /// Any unfinished frame is counted as discarded, and an unreported
    /// resynchronization run is queued as an error. Call this when the
    /// transport reaches EOF so trailing garbage is not silently lost.
    pub fn finish(&mut self) {
        let remainder = self.buffer.len();
        if remainder > 0 {
            let kind = match self.state {
                ParserState::ReadingBody { frame_type, length } => FrameErrorKind::LengthMismatch {
                    report_type: frame_type,
                    length,
                },
                ParserState::WaitingHeader => FrameErrorKind::BadLength(self.buffer[0]),
            };
            self.record_discard(kind, remainder);
            self.buffer.clear();
        }
        if let Some(error) = self.pending_error.take() {
            self.items.push_back(Err(error));
        }
        self.state = ParserState::WaitingHeader;
    }

    /// Discard buffered bytes, queued items and any resynchronization run.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.items.clear();
        self.pending_error = None;
        self.state = ParserState::WaitingHeader;
    }

    /// Returns an iterator that drains all currently available items.
    ///
    /// This does not parse more data; call [`feed()`](StreamParser::feed)
    /// first.
    pub fn drain(&mut self) -> Drain<'_, F> {
        Drain { parser: self }
    }

    /// Try to extract one frame from the buffer.
    ///
    /// Returns `true` if a frame was queued, `false` if more data is needed.
    fn try_extract_frame(&mut self) -> bool {
        loop {
            if self.buffer.len() < 2 {
                self.state = ParserState::WaitingHeader;
                return false;
            }

            let length = self.buffer[0];
            let frame_type = self.buffer[1];

            if let Err(kind) = F::check_header(frame_type, length) {
                self.discard_one(kind);
                continue;
            }

            let frame_len = usize::from(length) + 1;
            if self.buffer.len() < frame_len {
                self.state = ParserState::ReadingBody { frame_type, length };
                return false;
            }

            match F::from_wire(frame_type, &self.buffer[2..frame_len]) {
                Ok(frame) => {
                    self.buffer.advance(frame_len);
                    if let Some(error) = self.pending_error.take() {
                        self.items.push_back(Err(error));
                    }
                    self.items.push_back(Ok(frame));
                    self.state = ParserState::WaitingHeader;
                    return true;
                }
                Err(kind) => self.discard_one(kind),
            }
        }
    }

    /// Drop the first buffered byte as part of a resynchronization run.
    fn discard_one(&mut self, kind: FrameErrorKind) {
        self.buffer.advance(1);
        self.record_discard(kind, 1);
    }

    fn record_discard(&mut self, kind: FrameErrorKind, count: usize) {
        match &mut self.pending_error {
            Some(error) => error.discarded += count,
            None => self.pending_error = Some(FrameError::new(kind, count)),
        }
    }
}

impl<F: WireFrame> Default for StreamParser<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator that drains items from a [`StreamParser`].
pub struct Drain<'a, F: WireFrame> {
    parser: &'a mut StreamParser<F>,
}

impl<F: WireFrame> Iterator for Drain<'_, F> {
    type Item = ParsedItem<F>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_item()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.parser.items_available();
        (len, Some(len))
    }
}

impl<F: WireFrame> ExactSizeIterator for Drain<'_, F> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::{Report, ReportType};
    use crate::Command;
    use telemetrix_core::constants::{REPORT_ANALOG, REPORT_DIGITAL};

    fn reports(parser: &mut StreamParser) -> Vec<ParsedItem<Report>> {
        parser
            .drain()
            .map(|item| item.map(|frame| frame.report().unwrap()))
            .collect()
    }

    #[test]
    fn test_new_parser_state() {
        let parser: StreamParser = StreamParser::new();
        assert_eq!(parser.state(), ParserState::WaitingHeader);
        assert_eq!(parser.items_available(), 0);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_complete_frame() {
        let mut parser = StreamParser::new();
        parser.feed(&[3, REPORT_DIGITAL, 7, 1]);

        assert_eq!(reports(&mut parser), vec![Ok(Report::Digital { pin: 7, value: 1 })]);
    }

    #[test]
    fn test_partial_frame_waits_for_body() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[4, REPORT_ANALOG, 2]);

        assert!(parser.next_item().is_none());
        assert_eq!(
            parser.state(),
            ParserState::ReadingBody {
                frame_type: REPORT_ANALOG,
                length: 4
            }
        );

        parser.feed(&[0x03, 0xFF]);
        let frame = parser.next_item().unwrap().unwrap();
        assert_eq!(frame.report_type(), ReportType::Analog);
        assert_eq!(parser.state(), ParserState::WaitingHeader);
    }

    #[test]
    fn test_single_byte_waits_for_header() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[3]);
        assert!(parser.next_item().is_none());
        assert_eq!(parser.state(), ParserState::WaitingHeader);
        assert_eq!(parser.buffered_len(), 1);
    }

    #[test]
    fn test_multiple_frames_in_one_feed() {
        let mut parser = StreamParser::new();
        parser.feed(&[3, REPORT_DIGITAL, 7, 1, 4, REPORT_ANALOG, 0, 0, 9, 2, 6, 1]);

        assert_eq!(
            reports(&mut parser),
            vec![
                Ok(Report::Digital { pin: 7, value: 1 }),
                Ok(Report::Analog { pin: 0, value: 9 }),
                Ok(Report::IAmHere { instance_id: 1 }),
            ]
        );
    }

    #[test]
    fn test_garbage_between_frames_is_one_error() {
        let mut parser = StreamParser::new();
        parser.feed(&[3, REPORT_DIGITAL, 7, 1]);
        parser.feed(&[0xEE, 0xEE, 0xEE]);
        parser.feed(&[3, REPORT_DIGITAL, 7, 0]);

        assert_eq!(
            reports(&mut parser),
            vec![
                Ok(Report::Digital { pin: 7, value: 1 }),
                Err(FrameError::new(FrameErrorKind::UnknownReportType(0xEE), 3)),
                Ok(Report::Digital { pin: 7, value: 0 }),
            ]
        );
    }

    #[test]
    fn test_length_mismatch_is_discarded() {
        let mut parser = StreamParser::new();
        // An analog header claiming 9 bytes cannot be a frame start
        parser.feed(&[9, REPORT_ANALOG, 3, REPORT_DIGITAL, 4, 0]);

        let items = reports(&mut parser);
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            Err(FrameError {
                kind: FrameErrorKind::LengthMismatch { length: 9, .. },
                discarded: 2
            })
        ));
        assert_eq!(items[1], Ok(Report::Digital { pin: 4, value: 0 }));
    }

    #[test]
    fn test_undecodable_body_is_discarded() {
        let mut parser = StreamParser::new();
        // Digital level 5 is not a valid body
        parser.feed(&[3, REPORT_DIGITAL, 9, 5, 3, REPORT_DIGITAL, 7, 1]);

        let items = reports(&mut parser);
        assert!(matches!(
            &items[0],
            Err(FrameError {
                kind: FrameErrorKind::MalformedPayload { .. },
                discarded: 4
            })
        ));
        assert_eq!(items[1], Ok(Report::Digital { pin: 7, value: 1 }));
    }

    #[test]
    fn test_zero_length_byte() {
        let mut parser = StreamParser::new();
        parser.feed(&[0, 3, REPORT_DIGITAL, 1, 1]);

        let items = reports(&mut parser);
        assert_eq!(
            items,
            vec![
                Err(FrameError::new(FrameErrorKind::BadLength(0), 1)),
                Ok(Report::Digital { pin: 1, value: 1 }),
            ]
        );
    }

    #[test]
    fn test_errors_held_until_next_frame() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[0xEE, 0xEE]);

        assert!(parser.next_item().is_none());
        assert_eq!(parser.pending_discards(), 1);
    }

    #[test]
    fn test_finish_flushes_trailing_garbage() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[0xEE, 0xEE, 4, REPORT_ANALOG]);
        parser.finish();

        let error = parser.next_item().unwrap().unwrap_err();
        assert_eq!(error.kind, FrameErrorKind::UnknownReportType(0xEE));
        assert_eq!(error.discarded, 4);
        assert!(parser.next_item().is_none());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_truncated_frame_absorbs_next_frame() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[3, REPORT_DIGITAL, 7, 1]);
        // Analog report missing its last byte
        parser.feed(&[4, REPORT_ANALOG, 2]);
        parser.feed(&[3, REPORT_DIGITAL, 7, 0]);
        parser.finish();

        assert_eq!(
            reports(&mut parser),
            vec![
                Ok(Report::Digital { pin: 7, value: 1 }),
                Ok(Report::Analog { pin: 2, value: 770 }),
                Err(FrameError::new(
                    FrameErrorKind::LengthMismatch {
                        report_type: 0,
                        length: 7
                    },
                    2
                )),
            ]
        );
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_clear() {
        let mut parser: StreamParser = StreamParser::new();
        parser.feed(&[0xEE, 4, REPORT_ANALOG, 1]);
        parser.clear();

        assert_eq!(parser.state(), ParserState::WaitingHeader);
        assert_eq!(parser.items_available(), 0);
        assert_eq!(parser.pending_discards(), 0);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_byte_by_byte_matches_bulk() {
        let stream = [
            3, REPORT_DIGITAL, 7, 1, 0xEE, 4, REPORT_ANALOG, 0, 0x02, 0x00, 3, 1, 2, 9,
        ];

        let mut bulk = StreamParser::new();
        bulk.feed(&stream);

        let mut trickle = StreamParser::new();
        for byte in stream {
            trickle.feed(&[byte]);
        }

        assert_eq!(reports(&mut bulk), reports(&mut trickle));
    }

    #[test]
    fn test_parses_commands() {
        let mut parser: StreamParser<Command> = StreamParser::new();
        parser.feed(&Command::digital_write(13, true).to_bytes());
        parser.feed(&Command::get_firmware_version().to_bytes());

        let commands: Vec<_> = parser.drain().map(Result::unwrap).collect();
        assert_eq!(
            commands,
            vec![Command::digital_write(13, true), Command::get_firmware_version()]
        );
    }
}
