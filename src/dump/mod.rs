//! `DUMP`-compatible payloads
//!
//! [`ValueEncoder`] re-encodes one snapshot value for a target format
//! version and [`PayloadFramer`] seals it with the version and checksum
//! trailer that `RESTORE` verifies.

pub mod encoder;
pub mod framer;

pub use encoder::{EncodeError, ValueEncoder};
pub use framer::{FrameError, Payload, PayloadFramer};
