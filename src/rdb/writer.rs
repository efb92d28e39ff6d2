//! RDB encoding writers
//!
//! The `save_*` functions emit single values into any `Write` (the payload
//! encoder writes into a [`PayloadFramer`](crate::dump::PayloadFramer)).
//! [`RdbWriter`] assembles whole snapshot files from the same encodings.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Write};

use super::{
    RDB_MAGIC, RDB_OPCODE_AUX, RDB_OPCODE_EOF, RDB_OPCODE_EXPIRETIME_MS, RDB_OPCODE_RESIZEDB,
    RDB_OPCODE_SELECTDB,
};
use crate::dump::framer::CRC64;

/// Longest textual double the legacy encoding can carry; 253-255 are markers.
const MAX_DOUBLE_TEXT: usize = 252;

fn encode_len(len: u64, out: &mut [u8; 9]) -> usize {
    if len < 64 {
        // 6-bit length (00xxxxxx)
        out[0] = len as u8;
        1
    } else if len < 16384 {
        // 14-bit length (01xxxxxx xxxxxxxx)
        out[0] = 0x40 | ((len >> 8) as u8 & 0x3F);
        out[1] = (len & 0xFF) as u8;
        2
    } else if len <= u32::MAX as u64 {
        out[0] = 0x80;
        out[1..5].copy_from_slice(&(len as u32).to_be_bytes());
        5
    } else {
        out[0] = 0x81;
        out[1..9].copy_from_slice(&len.to_be_bytes());
        9
    }
}

/// Textual form of a finite double, short enough for the legacy encoding.
fn double_text(value: f64) -> String {
    let text = format!("{}", value);
    if text.len() <= MAX_DOUBLE_TEXT {
        text
    } else {
        format!("{:e}", value)
    }
}

/// Write a length prefix
pub fn save_len<W: Write + ?Sized>(w: &mut W, len: u64) -> io::Result<()> {
    let mut buf = [0u8; 9];
    let n = encode_len(len, &mut buf);
    w.write_all(&buf[..n])
}

/// Write a length-prefixed raw string
pub fn save_string<W: Write + ?Sized>(w: &mut W, s: &[u8]) -> io::Result<()> {
    save_len(w, s.len() as u64)?;
    w.write_all(s)
}

/// Write a double in the legacy textual encoding (sorted sets before RDB 8)
pub fn save_double<W: Write + ?Sized>(w: &mut W, value: f64) -> io::Result<()> {
    if value.is_nan() {
        w.write_all(&[253])
    } else if value == f64::INFINITY {
        w.write_all(&[254])
    } else if value == f64::NEG_INFINITY {
        w.write_all(&[255])
    } else {
        let text = double_text(value);
        w.write_all(&[text.len() as u8])?;
        w.write_all(text.as_bytes())
    }
}

/// Write a double as 8 little-endian bytes (sorted sets from RDB 8)
pub fn save_binary_double<W: Write + ?Sized>(w: &mut W, value: f64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

/// Builder for whole snapshot files.
pub struct RdbWriter {
    buffer: BytesMut,
}

impl RdbWriter {
    /// Create a new RDB writer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Write the magic and a four-digit version
    pub fn write_header(&mut self, version: u16) {
        self.buffer.extend_from_slice(RDB_MAGIC);
        self.buffer
            .extend_from_slice(format!("{:04}", version).as_bytes());
    }

    /// Write auxiliary field
    pub fn write_aux(&mut self, key: &str, value: &str) {
        self.buffer.put_u8(RDB_OPCODE_AUX);
        self.write_string(key.as_bytes());
        self.write_string(value.as_bytes());
    }

    /// Write database selector
    pub fn write_select_db(&mut self, db: u32) {
        self.buffer.put_u8(RDB_OPCODE_SELECTDB);
        self.write_length(db as u64);
    }

    /// Write resize db info
    pub fn write_resize_db(&mut self, db_size: u64, expires_size: u64) {
        self.buffer.put_u8(RDB_OPCODE_RESIZEDB);
        self.write_length(db_size);
        self.write_length(expires_size);
    }

    /// Write expiry time in milliseconds
    pub fn write_expiry_ms(&mut self, expire_ms: u64) {
        self.buffer.put_u8(RDB_OPCODE_EXPIRETIME_MS);
        self.buffer.put_u64_le(expire_ms);
    }

    /// Start an entry: type byte and key. The value body follows.
    pub fn write_key(&mut self, type_code: u8, key: &[u8]) {
        self.buffer.put_u8(type_code);
        self.write_string(key);
    }

    /// Write a length-encoded integer
    pub fn write_length(&mut self, len: u64) {
        let mut buf = [0u8; 9];
        let n = encode_len(len, &mut buf);
        self.buffer.extend_from_slice(&buf[..n]);
    }

    /// Write a length-prefixed string
    pub fn write_string(&mut self, s: &[u8]) {
        self.write_length(s.len() as u64);
        self.buffer.extend_from_slice(s);
    }

    /// Write a legacy textual double
    pub fn write_double(&mut self, value: f64) {
        // BytesMut writes are infallible
        let _ = save_double(&mut (&mut self.buffer).writer(), value);
    }

    /// Write a binary double
    pub fn write_binary_double(&mut self, value: f64) {
        self.buffer.put_f64_le(value);
    }

    /// Write bytes exactly as given
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write EOF marker and checksum
    pub fn write_eof(&mut self) {
        self.buffer.put_u8(RDB_OPCODE_EOF);
        let checksum = CRC64.checksum(&self.buffer);
        self.buffer.put_u64_le(checksum);
    }

    /// Get the serialized RDB data
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

impl Default for RdbWriter {
    fn default() -> Self {
        Self::new()
    }
}
