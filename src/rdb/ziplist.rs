//! Ziplist codec
//!
//! Layout: `[zlbytes u32le][zltail u32le][zllen u16le] entries... [0xFF]`.
//! Each entry is `[prevlen][encoding][payload]`.

use bytes::{BufMut, Bytes};

const ZIP_END: u8 = 0xFF;
const ZIP_BIG_PREVLEN: u8 = 0xFE;
const ZIP_HEADER_SIZE: usize = 10;
/// `zllen` saturates here; the real count is only known by walking.
const ZIP_UNKNOWN_LEN: u16 = u16::MAX;

const ZIP_STR_06B: u8 = 0x00;
const ZIP_STR_14B: u8 = 0x40;
const ZIP_STR_32B: u8 = 0x80;
const ZIP_INT_16B: u8 = 0xC0;
const ZIP_INT_32B: u8 = 0xD0;
const ZIP_INT_64B: u8 = 0xE0;
const ZIP_INT_24B: u8 = 0xF0;
const ZIP_INT_8B: u8 = 0xFE;
const ZIP_INT_IMM_MIN: u8 = 0xF1;
const ZIP_INT_IMM_MAX: u8 = 0xFD;

/// Ziplist decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZiplistError {
    /// Buffer ends before the structure does
    #[error("ziplist truncated at offset {0}")]
    Truncated(usize),
    /// Entry header with an unknown encoding byte
    #[error("invalid ziplist entry encoding {encoding:#04x} at offset {offset}")]
    InvalidEncoding {
        /// Offending byte
        encoding: u8,
        /// Position in the ziplist
        offset: usize,
    },
    /// The byte after the last entry is not the end marker
    #[error("ziplist terminator is {0:#04x}, expected 0xff")]
    BadTerminator(u8),
}

/// One ziplist element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZiplistEntry {
    /// Byte string
    Bytes(Bytes),
    /// Integer stored in packed form
    Int(i64),
}

impl ZiplistEntry {
    /// String form of the element; integers become their decimal text.
    pub fn into_bytes(self) -> Bytes {
        match self {
            ZiplistEntry::Bytes(b) => b,
            ZiplistEntry::Int(n) => Bytes::from(n.to_string()),
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ZiplistError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ZiplistError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ZiplistError> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Result<u8, ZiplistError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(ZiplistError::Truncated(self.pos))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ZiplistError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Decode every element of a ziplist and check its end marker.
pub fn decode(buf: &[u8]) -> Result<Vec<ZiplistEntry>, ZiplistError> {
    let mut cur = Cursor { buf, pos: 0 };
    let _zlbytes = u32::from_le_bytes(cur.array()?);
    let _zltail = u32::from_le_bytes(cur.array()?);
    let zllen = u16::from_le_bytes(cur.array()?);

    let mut entries = Vec::with_capacity(zllen.min(1024) as usize);
    if zllen == ZIP_UNKNOWN_LEN {
        while cur.peek()? != ZIP_END {
            entries.push(decode_entry(&mut cur)?);
        }
    } else {
        for _ in 0..zllen {
            entries.push(decode_entry(&mut cur)?);
        }
    }

    match cur.u8()? {
        ZIP_END => Ok(entries),
        other => Err(ZiplistError::BadTerminator(other)),
    }
}

fn decode_entry(cur: &mut Cursor<'_>) -> Result<ZiplistEntry, ZiplistError> {
    if cur.u8()? == ZIP_BIG_PREVLEN {
        cur.take(4)?;
    }

    let offset = cur.pos;
    let encoding = cur.u8()?;
    let entry = match encoding >> 6 {
        0 => {
            let len = (encoding & 0x3F) as usize;
            ZiplistEntry::Bytes(Bytes::copy_from_slice(cur.take(len)?))
        }
        1 => {
            let len = (((encoding & 0x3F) as usize) << 8) | cur.u8()? as usize;
            ZiplistEntry::Bytes(Bytes::copy_from_slice(cur.take(len)?))
        }
        2 if encoding == ZIP_STR_32B => {
            let len = u32::from_be_bytes(cur.array()?) as usize;
            ZiplistEntry::Bytes(Bytes::copy_from_slice(cur.take(len)?))
        }
        _ => match encoding {
            ZIP_INT_8B => ZiplistEntry::Int(cur.u8()? as i8 as i64),
            ZIP_INT_16B => ZiplistEntry::Int(i16::from_le_bytes(cur.array()?) as i64),
            ZIP_INT_24B => {
                let b: [u8; 3] = cur.array()?;
                // place in the high bytes so the shift sign-extends
                ZiplistEntry::Int((i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as i64)
            }
            ZIP_INT_32B => ZiplistEntry::Int(i32::from_le_bytes(cur.array()?) as i64),
            ZIP_INT_64B => ZiplistEntry::Int(i64::from_le_bytes(cur.array()?)),
            ZIP_INT_IMM_MIN..=ZIP_INT_IMM_MAX => ZiplistEntry::Int((encoding & 0x0F) as i64 - 1),
            _ => return Err(ZiplistError::InvalidEncoding { encoding, offset }),
        },
    };
    Ok(entry)
}

/// Build a ziplist holding `entries`, using the smallest encoding for each.
pub fn encode(entries: &[ZiplistEntry]) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    let mut prev_len = 0usize;
    let mut tail = ZIP_HEADER_SIZE;

    for entry in entries {
        let start = body.len();
        tail = ZIP_HEADER_SIZE + start;
        if prev_len < ZIP_BIG_PREVLEN as usize {
            body.put_u8(prev_len as u8);
        } else {
            body.put_u8(ZIP_BIG_PREVLEN);
            body.put_u32_le(prev_len as u32);
        }
        encode_entry(entry, &mut body);
        prev_len = body.len() - start;
    }

    let mut out = Vec::with_capacity(ZIP_HEADER_SIZE + body.len() + 1);
    out.put_u32_le((ZIP_HEADER_SIZE + body.len() + 1) as u32);
    out.put_u32_le(tail as u32);
    out.put_u16_le(entries.len().min(ZIP_UNKNOWN_LEN as usize) as u16);
    out.extend_from_slice(&body);
    out.put_u8(ZIP_END);
    out
}

fn encode_entry(entry: &ZiplistEntry, out: &mut Vec<u8>) {
    match entry {
        ZiplistEntry::Bytes(b) => {
            let len = b.len();
            if len <= 0x3F {
                out.put_u8(ZIP_STR_06B | len as u8);
            } else if len <= 0x3FFF {
                out.put_u8(ZIP_STR_14B | (len >> 8) as u8);
                out.put_u8(len as u8);
            } else {
                out.put_u8(ZIP_STR_32B);
                out.put_u32(len as u32);
            }
            out.extend_from_slice(b);
        }
        ZiplistEntry::Int(n) => {
            let n = *n;
            if (0..=12).contains(&n) {
                out.put_u8(ZIP_INT_IMM_MIN + n as u8);
            } else if let Ok(v) = i8::try_from(n) {
                out.put_u8(ZIP_INT_8B);
                out.put_i8(v);
            } else if let Ok(v) = i16::try_from(n) {
                out.put_u8(ZIP_INT_16B);
                out.put_i16_le(v);
            } else if (-(1 << 23)..(1 << 23)).contains(&n) {
                out.put_u8(ZIP_INT_24B);
                out.extend_from_slice(&(n as i32).to_le_bytes()[..3]);
            } else if let Ok(v) = i32::try_from(n) {
                out.put_u8(ZIP_INT_32B);
                out.put_i32_le(v);
            } else {
                out.put_u8(ZIP_INT_64B);
                out.put_i64_le(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn b(s: &str) -> ZiplistEntry {
        ZiplistEntry::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_decode_handwritten_ziplist() {
        // two entries: "ab" and immediate 5
        let raw = [
            0x11, 0, 0, 0, // zlbytes = 17
            0x0E, 0, 0, 0, // zltail
            0x02, 0, // zllen
            0x00, 0x02, b'a', b'b', // prevlen 0, str len 2
            0x04, 0xF6, // prevlen 4, imm 5
            0xFF,
        ];
        let entries = decode(&raw).unwrap();
        assert_eq!(entries, vec![b("ab"), ZiplistEntry::Int(5)]);
    }

    #[test]
    fn test_integer_widths() {
        let values = [
            0,
            12,
            13,
            -1,
            127,
            -128,
            300,
            -30000,
            1 << 20,
            -(1 << 23),
            1 << 30,
            i64::MAX,
            i64::MIN,
        ];
        let entries: Vec<_> = values.iter().map(|&n| ZiplistEntry::Int(n)).collect();
        assert_eq!(decode(&encode(&entries)).unwrap(), entries);
    }

    #[test]
    fn test_long_strings_and_big_prevlen() {
        let long = "x".repeat(300);
        let huge = "y".repeat(20_000);
        let entries = vec![b(&long), b("tail"), b(&huge), b("end")];
        let decoded = decode(&encode(&entries)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_bad_terminator() {
        let mut raw = encode(&[b("a")]);
        let last = raw.len() - 1;
        raw[last] = 0x00;
        assert_eq!(decode(&raw), Err(ZiplistError::BadTerminator(0x00)));
    }

    #[test]
    fn test_truncated() {
        let raw = encode(&[b("hello")]);
        assert!(matches!(
            decode(&raw[..raw.len() - 3]),
            Err(ZiplistError::Truncated(_))
        ));
    }

    #[test]
    fn test_unknown_length_walks_to_end() {
        let mut raw = encode(&[b("a"), b("b"), b("c")]);
        raw[8] = 0xFF;
        raw[9] = 0xFF;
        assert_eq!(decode(&raw).unwrap().len(), 3);
    }

    #[test]
    fn test_int_into_bytes() {
        assert_eq!(ZiplistEntry::Int(-42).into_bytes(), Bytes::from("-42"));
    }
}
