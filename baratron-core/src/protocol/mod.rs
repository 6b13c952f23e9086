mod command;
mod error;
mod reply;

pub use command::{Command, Operation, encode, parse_command};
pub use error::{ParseResult, ProtocolError};
pub use reply::{decode, encode_fault, encode_reply, parse_value};

// line grammar: <TAG> <value>[ <unit>] or <TAG> ERR <code>, terminated by \n

/// Byte that ends every frame in both directions.
pub const DELIMITER: u8 = b'\n';
/// Line ending written after each outgoing line.
pub const LINE_ENDING: &[u8] = b"\r\n";
/// Longest frame accepted before the stream is considered out of step.
pub const MAX_FRAME_LEN: usize = 256;
/// Token that marks an in-band device fault.
pub const FAULT_MARKER: &str = "ERR";

/// Strips leading and trailing whitespace and control bytes (`\r`, `\0`, ...).
pub fn trim_frame(raw: &[u8]) -> &[u8] {
    let noise = |b: &u8| b.is_ascii_whitespace() || b.is_ascii_control();
    let start = raw.iter().position(|b| !noise(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !noise(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}
