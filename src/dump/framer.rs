//! Payload framing
//!
//! A payload is what `DUMP` returns and `RESTORE` accepts:
//! `[type tag][value body][u16 LE version][u64 LE CRC-64]`, with the checksum
//! computed over everything before it.

use bytes::Bytes;
use crc::{Crc, Digest, CRC_64_REDIS};
use std::io::{self, Write};

/// CRC-64/Jones as used by the RDB trailer and `DUMP` payloads
pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Version plus checksum
const TRAILER_LEN: usize = 10;

/// Trailer validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Too short to hold a tag and a trailer
    #[error("payload too short: {0} bytes")]
    TooShort(usize),
    /// Trailer checksum does not match the content
    #[error("payload checksum mismatch: trailer {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch {
        /// Checksum stored in the trailer
        expected: u64,
        /// Checksum of the bytes before it
        actual: u64,
    },
}

/// Incremental payload builder.
///
/// Bytes written through [`Write`] are appended to the body and fed to the
/// checksum. [`finish`](Self::finish) consumes the framer, so a payload is
/// sealed at most once; dropping it unfinished produces nothing.
pub struct PayloadFramer {
    buf: Vec<u8>,
    digest: Digest<'static, u64>,
    type_code: u8,
    version: u16,
}

impl PayloadFramer {
    /// Start a payload declaring `type_code`, to be sealed as `version`.
    pub fn new(type_code: u8, version: u16) -> Self {
        Self::with_capacity(type_code, version, 256)
    }

    /// Like [`new`](Self::new) with a body size hint.
    pub fn with_capacity(type_code: u8, version: u16, capacity: usize) -> Self {
        let mut framer = Self {
            buf: Vec::with_capacity(capacity + 1 + TRAILER_LEN),
            digest: CRC64.digest(),
            type_code,
            version,
        };
        framer.append(&[type_code]);
        framer
    }

    /// Declared type tag
    pub fn type_code(&self) -> u8 {
        self.type_code
    }

    /// Bytes written so far, including the tag
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always false: the tag is written on construction
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.digest.update(data);
    }

    /// Append the version and checksum trailer.
    pub fn finish(mut self) -> Payload {
        let version = self.version.to_le_bytes();
        self.append(&version);
        let checksum = self.digest.finalize();
        self.buf.extend_from_slice(&checksum.to_le_bytes());
        Payload {
            bytes: Bytes::from(self.buf),
            type_code: self.type_code,
            version: self.version,
            checksum,
        }
    }
}

impl Write for PayloadFramer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sealed, self-describing value ready for `RESTORE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Bytes,
    type_code: u8,
    version: u16,
    checksum: u64,
}

impl Payload {
    /// Check the trailer of a serialized payload and wrap it.
    pub fn verify(bytes: impl Into<Bytes>) -> Result<Self, FrameError> {
        let bytes = bytes.into();
        if bytes.len() < 1 + TRAILER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let split = bytes.len() - 8;
        let mut stored = [0u8; 8];
        stored.copy_from_slice(&bytes[split..]);
        let expected = u64::from_le_bytes(stored);
        let actual = CRC64.checksum(&bytes[..split]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
        let version = u16::from_le_bytes([bytes[split - 2], bytes[split - 1]]);
        Ok(Self {
            type_code: bytes[0],
            version,
            checksum: expected,
            bytes,
        })
    }

    /// Full serialized payload
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume into the serialized payload
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Declared type tag
    pub fn type_code(&self) -> u8 {
        self.type_code
    }

    /// Format version in the trailer
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Trailer checksum
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Value body between the tag and the trailer
    pub fn body(&self) -> &[u8] {
        &self.bytes[1..self.bytes.len() - TRAILER_LEN]
    }

    /// Serialized size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// A payload always holds at least its tag and trailer
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
