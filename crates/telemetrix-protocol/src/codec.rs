//! Tokio codecs for Telemetrix framing.
//!
//! [`TelemetrixCodec`] is the host side of the link: it decodes reports and
//! encodes commands. [`BoardCodec`] is the mirror image, decoding commands
//! and encoding reports, for simulated boards in tests and tooling.
//!
//! Both wrap a [`StreamParser`] and yield `Result<Frame, FrameError>` items
//! rather than failing the stream on corrupt input. A `FramedRead` stops at
//! the first decoder error, so malformed bytes are reported in-band and the
//! decoder error type is reserved for I/O failures.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//! use telemetrix_protocol::{Command, TelemetrixCodec};
//!
//! # async fn example() -> telemetrix_core::Result<()> {
//! let stream = TcpStream::connect("192.168.2.220:31335").await?;
//! let mut framed = Framed::new(stream, TelemetrixCodec::new());
//!
//! framed.send(Command::get_firmware_version()).await?;
//!
//! while let Some(item) = framed.next().await {
//!     match item? {
//!         Ok(frame) => println!("report: {:?}", frame.report()),
//!         Err(e) => eprintln!("discarded input: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::commands::Command;
use crate::reports::{Report, ReportFrame};
use crate::stream_parser::{ParsedItem, StreamParser};
use crate::WireFrame;
use telemetrix_core::{Error, Result};

/// Feed `src` into the parser and pop the next item.
fn decode_with<F: WireFrame>(
    parser: &mut StreamParser<F>,
    src: &mut BytesMut,
) -> Option<ParsedItem<F>> {
    if !src.is_empty() {
        // The parser keeps its own copy of any unfinished frame
        parser.feed(src);
        src.clear();
    }
    parser.next_item()
}

fn decode_eof_with<F: WireFrame>(
    parser: &mut StreamParser<F>,
    src: &mut BytesMut,
) -> Option<ParsedItem<F>> {
    if let Some(item) = decode_with(parser, src) {
        return Some(item);
    }
    parser.finish();
    parser.next_item()
}

/// Host-side codec: reports in, commands out.
#[derive(Debug, Default)]
pub struct TelemetrixCodec {
    parser: StreamParser<ReportFrame>,
}

impl TelemetrixCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered in an unfinished frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.parser.buffered_len()
    }
}

impl Decoder for TelemetrixCodec {
    type Item = ParsedItem<ReportFrame>;
    type Error = Error;

    /// Decode the next report or frame error.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use tokio_util::codec::Decoder;
    /// use telemetrix_core::FirmwareVersion;
    /// use telemetrix_protocol::{Report, TelemetrixCodec};
    ///
    /// let mut codec = TelemetrixCodec::new();
    /// let mut buffer = BytesMut::from(&[3u8, 1, 2, 9][..]);
    ///
    /// let frame = codec.decode(&mut buffer).unwrap().unwrap().unwrap();
    /// assert_eq!(
    ///     frame.report().unwrap(),
    ///     Report::FirmwareVersion(FirmwareVersion::new(2, 9))
    /// );
    /// ```
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(decode_with(&mut self.parser, src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(decode_eof_with(&mut self.parser, src))
    }
}

impl Encoder<Command> for TelemetrixCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

/// Board-side codec: commands in, reports out.
#[derive(Debug, Default)]
pub struct BoardCodec {
    parser: StreamParser<Command>,
}

impl BoardCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BoardCodec {
    type Item = ParsedItem<Command>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(decode_with(&mut self.parser, src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(decode_eof_with(&mut self.parser, src))
    }
}

impl Encoder<ReportFrame> for BoardCodec {
    type Error = Error;

    fn encode(&mut self, item: ReportFrame, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<Report> for BoardCodec {
    type Error = Error;

    fn encode(&mut self, item: Report, dst: &mut BytesMut) -> Result<()> {
        let frame = item
            .to_frame()
            .map_err(|kind| Error::InvalidArgument(kind.to_string()))?;
        frame.encode(dst);
        Ok(())
    }
}
