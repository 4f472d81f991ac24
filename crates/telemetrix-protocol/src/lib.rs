pub mod codec;
pub mod commands;
pub mod frame;
pub mod reports;
pub mod stream_parser;

pub use codec::{BoardCodec, TelemetrixCodec};
pub use commands::{Command, CommandCode, ReportingAction};
pub use frame::{LengthRule, WireFrame};
pub use reports::{DhtReading, Report, ReportFrame, ReportType};
pub use stream_parser::{Drain, ParsedItem, ParserState, StreamParser};
