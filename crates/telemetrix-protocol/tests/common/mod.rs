//! Common test utilities for protocol integration tests.
//!
//! Helpers build the byte streams a board would emit so tests can focus on
//! what the decoder makes of them.

#![allow(dead_code)]

use bytes::BytesMut;
use telemetrix_core::FirmwareVersion;
use telemetrix_protocol::{DhtReading, Report, ReportFrame, StreamParser};

/// Encode a sequence of reports as one contiguous byte stream.
pub fn encode_reports(reports: &[Report]) -> Vec<u8> {
    let mut wire = BytesMut::new();
    for report in reports {
        report
            .to_frame()
            .expect("test reports must be encodable")
            .encode(&mut wire);
    }
    wire.to_vec()
}

/// A representative mix of every report kind the host consumes.
pub fn sample_reports() -> Vec<Report> {
    vec![
        Report::FirmwareVersion(FirmwareVersion::new(2, 9)),
        Report::IAmHere { instance_id: 1 },
        Report::Digital { pin: 12, value: 1 },
        Report::Analog { pin: 0, value: 1023 },
        Report::SonarDistance {
            trigger_pin: 9,
            distance_cm: 42,
        },
        Report::Dht {
            pin: 8,
            reading: DhtReading::Data {
                humidity: 40.0,
                temperature: 22.5,
            },
        },
        Report::I2cRead {
            port: 0,
            address: 0x53,
            register: 0x32,
            data: vec![1, 2, 3, 4, 5, 6],
        },
        Report::LoopBack(b'x'),
        Report::DebugPrint { id: 3, value: 777 },
    ]
}

/// Feed `wire` in chunks of `chunk` bytes and collect every item as a typed
/// report or the frame error's discard count.
pub fn parse_in_chunks(wire: &[u8], chunk: usize) -> Vec<Result<Report, usize>> {
    let mut parser: StreamParser<ReportFrame> = StreamParser::new();
    let mut out = Vec::new();
    for piece in wire.chunks(chunk.max(1)) {
        parser.feed(piece);
        out.extend(parser.drain().map(to_report));
    }
    parser.finish();
    out.extend(parser.drain().map(to_report));
    out
}

fn to_report(item: Result<ReportFrame, telemetrix_core::FrameError>) -> Result<Report, usize> {
    item.map(|frame| frame.report().expect("emitted frames decode"))
        .map_err(|e| e.discarded)
}
