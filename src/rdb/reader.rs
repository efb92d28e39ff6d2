//! Primitive readers for the RDB encoding
//!
//! Everything here works on any `Read`, so the same helpers decode a file,
//! an in-memory segment or a [`TeeReader`] that mirrors bytes into a payload.

use std::io::{self, Read, Write};

use super::lzf;

// Length encoding
const RDB_6BITLEN: u8 = 0;
const RDB_14BITLEN: u8 = 1;
const RDB_32BITLEN: u8 = 0x80;
const RDB_64BITLEN: u8 = 0x81;
const RDB_ENCVAL: u8 = 3;
const RDB_ENC_INT8: u8 = 0;
const RDB_ENC_INT16: u8 = 1;
const RDB_ENC_INT32: u8 = 2;
const RDB_ENC_LZF: u8 = 3;

// Module serialization opcodes
const RDB_MODULE_OPCODE_EOF: u64 = 0;
const RDB_MODULE_OPCODE_SINT: u64 = 1;
const RDB_MODULE_OPCODE_UINT: u64 = 2;
const RDB_MODULE_OPCODE_FLOAT: u64 = 3;
const RDB_MODULE_OPCODE_DOUBLE: u64 = 4;
const RDB_MODULE_OPCODE_STRING: u64 = 5;

/// Errors raised while reading the snapshot encoding
#[derive(Debug, thiserror::Error)]
pub enum RdbError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Stream ended in the middle of a value
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// File does not start with the REDIS magic
    #[error("invalid magic: expected REDIS header")]
    InvalidMagic,
    /// Format version outside the supported range
    #[error("unsupported RDB version: {0}")]
    UnsupportedVersion(u16),
    /// Length prefix with an unknown encoding
    #[error("invalid length encoding: {0:#04x}")]
    InvalidLength(u8),
    /// Special string encoding with an unknown sub-type
    #[error("invalid string encoding: {0}")]
    InvalidStringEncoding(u64),
    /// Compressed string does not inflate to its declared length
    #[error("LZF decompression error")]
    Lzf,
    /// Textual double that does not parse
    #[error("invalid double: {0:?}")]
    InvalidDouble(String),
    /// Module value carries an unknown opcode
    #[error("invalid module opcode: {0}")]
    InvalidModuleOpcode(u64),
    /// Opcode that this reader cannot walk past
    #[error("unsupported opcode: {0:#04x}")]
    UnsupportedOpcode(u8),
}

impl From<io::Error> for RdbError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RdbError::UnexpectedEof
        } else {
            RdbError::Io(e)
        }
    }
}

/// Result type for RDB operations.
pub type Result<T> = std::result::Result<T, RdbError>;

// ---------------------------------------------------------------------------
// Fixed-width reads
// ---------------------------------------------------------------------------

/// Read one byte
pub fn read_u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_array<R: Read + ?Sized, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a little-endian u32
pub fn read_u32_le<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

/// Read a little-endian u64
pub fn read_u64_le<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

/// Read a big-endian u32
pub fn read_u32_be<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(read_array(r)?))
}

/// Read a big-endian u64
pub fn read_u64_be<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    Ok(u64::from_be_bytes(read_array(r)?))
}

/// Read a little-endian IEEE-754 double (sorted-set v2 scores)
pub fn read_binary_double<R: Read + ?Sized>(r: &mut R) -> Result<f64> {
    Ok(f64::from_le_bytes(read_array(r)?))
}

/// Read exactly `n` bytes without trusting `n` for the allocation size.
pub fn read_bytes<R: Read + ?Sized>(r: &mut R, n: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(n.min(64 * 1024) as usize);
    Read::take(&mut *r, n).read_to_end(&mut buf)?;
    if (buf.len() as u64) != n {
        return Err(RdbError::UnexpectedEof);
    }
    Ok(buf)
}

/// Consume exactly `n` bytes.
pub fn skip_bytes<R: Read + ?Sized>(r: &mut R, n: u64) -> Result<()> {
    let copied = io::copy(&mut Read::take(&mut *r, n), &mut io::sink())?;
    if copied != n {
        return Err(RdbError::UnexpectedEof);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lengths and strings
// ---------------------------------------------------------------------------

/// Decode RDB length encoding, returning `(length, is_special_encoding)`.
pub fn read_length_with_encoding<R: Read + ?Sized>(r: &mut R) -> Result<(u64, bool)> {
    let byte = read_u8(r)?;
    let enc_type = (byte & 0xC0) >> 6;

    match enc_type {
        RDB_6BITLEN => Ok(((byte & 0x3F) as u64, false)),
        RDB_14BITLEN => {
            let next = read_u8(r)?;
            Ok(((((byte & 0x3F) as u64) << 8) | next as u64, false))
        }
        RDB_ENCVAL => Ok(((byte & 0x3F) as u64, true)),
        _ if byte == RDB_32BITLEN => Ok((read_u32_be(r)? as u64, false)),
        _ if byte == RDB_64BITLEN => Ok((read_u64_be(r)?, false)),
        _ => Err(RdbError::InvalidLength(byte)),
    }
}

/// Decode a plain length; a special encoding here is malformed.
pub fn read_length<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    match read_length_with_encoding(r)? {
        (len, false) => Ok(len),
        (enc, true) => Err(RdbError::InvalidLength(0xC0 | enc as u8)),
    }
}

/// Decode an RDB string (length-prefixed, integer-encoded, or LZF-compressed).
///
/// Integer encodings come back as their decimal text.
pub fn read_string<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>> {
    let (len, is_encoded) = read_length_with_encoding(r)?;

    if !is_encoded {
        return read_bytes(r, len);
    }

    match len as u8 {
        RDB_ENC_INT8 => Ok((read_u8(r)? as i8).to_string().into_bytes()),
        RDB_ENC_INT16 => Ok(i16::from_le_bytes(read_array(r)?).to_string().into_bytes()),
        RDB_ENC_INT32 => Ok(i32::from_le_bytes(read_array(r)?).to_string().into_bytes()),
        RDB_ENC_LZF => {
            let compressed_len = read_length(r)?;
            let uncompressed_len = read_length(r)?;
            let compressed = read_bytes(r, compressed_len)?;
            let uncompressed_len = usize::try_from(uncompressed_len).map_err(|_| RdbError::Lzf)?;
            lzf::decompress(&compressed, uncompressed_len)
        }
        _ => Err(RdbError::InvalidStringEncoding(len)),
    }
}

/// Consume an RDB string without decoding it.
pub fn skip_string<R: Read + ?Sized>(r: &mut R) -> Result<()> {
    let (len, is_encoded) = read_length_with_encoding(r)?;

    if !is_encoded {
        return skip_bytes(r, len);
    }

    match len as u8 {
        RDB_ENC_INT8 => skip_bytes(r, 1),
        RDB_ENC_INT16 => skip_bytes(r, 2),
        RDB_ENC_INT32 => skip_bytes(r, 4),
        RDB_ENC_LZF => {
            let compressed_len = read_length(r)?;
            read_length(r)?;
            skip_bytes(r, compressed_len)
        }
        _ => Err(RdbError::InvalidStringEncoding(len)),
    }
}

/// Read an RDB-encoded textual double (used in ZSET v1).
pub fn read_double<R: Read + ?Sized>(r: &mut R) -> Result<f64> {
    match read_u8(r)? {
        253 => Ok(f64::NAN),
        254 => Ok(f64::INFINITY),
        255 => Ok(f64::NEG_INFINITY),
        len => {
            let buf = read_bytes(r, len as u64)?;
            let text = String::from_utf8_lossy(&buf);
            match text.parse::<f64>() {
                Ok(v) => Ok(v),
                Err(_) => Err(RdbError::InvalidDouble(text.into_owned())),
            }
        }
    }
}

/// Consume a textual double.
pub fn skip_double<R: Read + ?Sized>(r: &mut R) -> Result<()> {
    match read_u8(r)? {
        253..=255 => Ok(()),
        len => skip_bytes(r, len as u64),
    }
}

/// Consume a module id followed by its opcode-tagged body up to the EOF
/// opcode. Used for both module v2 values and module aux fields.
pub fn skip_module_body<R: Read + ?Sized>(r: &mut R) -> Result<()> {
    let _module_id = read_length(r)?;
    loop {
        match read_length(r)? {
            RDB_MODULE_OPCODE_EOF => return Ok(()),
            RDB_MODULE_OPCODE_SINT | RDB_MODULE_OPCODE_UINT => {
                read_length(r)?;
            }
            RDB_MODULE_OPCODE_FLOAT => skip_bytes(r, 4)?,
            RDB_MODULE_OPCODE_DOUBLE => skip_bytes(r, 8)?,
            RDB_MODULE_OPCODE_STRING => skip_string(r)?,
            other => return Err(RdbError::InvalidModuleOpcode(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// TeeReader
// ---------------------------------------------------------------------------

/// Reader adapter that copies every byte it yields into a sink.
///
/// Wrapping the source in a `TeeReader` lets the structure walkers above
/// re-emit a value verbatim while they validate it.
pub struct TeeReader<'a, R: ?Sized, W: ?Sized> {
    inner: &'a mut R,
    sink: &'a mut W,
}

impl<'a, R: Read + ?Sized, W: Write + ?Sized> TeeReader<'a, R, W> {
    /// Mirror everything read from `inner` into `sink`
    pub fn new(inner: &'a mut R, sink: &'a mut W) -> Self {
        Self { inner, sink }
    }
}

impl<R: Read + ?Sized, W: Write + ?Sized> Read for TeeReader<'_, R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sink.write_all(&buf[..n])?;
        Ok(n)
    }
}
