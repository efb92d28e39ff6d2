//! RESP protocol implementation
//!
//! Request encoding and reply parsing for the destination connection.

mod encoder;
mod frame;
mod parser;

pub use encoder::{encode_command, encode_frame};
pub use frame::Frame;
pub use parser::{parse_frame, ParseError};
