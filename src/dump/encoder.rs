//! Format downgrade encoder
//!
//! Turns one value body from the snapshot into a [`Payload`] declaring a
//! target format version. Encodings the target predates are transcoded:
//!
//! | Source                    | Target  | Emitted as                        |
//! |---------------------------|---------|-----------------------------------|
//! | sorted set, binary scores | `V < 8` | sorted set with textual scores    |
//! | quicklist of ziplists     | `V < 7` | plain list of every element       |
//!
//! Every other encoding is walked for structure and mirrored byte for byte.

use std::io::{self, Read, Write};

use tracing::trace;

use super::framer::{Payload, PayloadFramer};
use crate::rdb::reader::{
    read_binary_double, read_length, read_string, skip_bytes, skip_double, skip_module_body,
    skip_string,
};
use crate::rdb::writer::{save_double, save_len, save_string};
use crate::rdb::ziplist::{self, ZiplistError};
use crate::rdb::{
    RdbError, TeeReader, RDB_TYPE_HASH, RDB_TYPE_HASH_LISTPACK, RDB_TYPE_HASH_ZIPLIST,
    RDB_TYPE_HASH_ZIPMAP, RDB_TYPE_LIST, RDB_TYPE_LIST_QUICKLIST, RDB_TYPE_LIST_QUICKLIST_2,
    RDB_TYPE_LIST_ZIPLIST, RDB_TYPE_MODULE, RDB_TYPE_MODULE_2, RDB_TYPE_SET, RDB_TYPE_SET_INTSET,
    RDB_TYPE_SET_LISTPACK, RDB_TYPE_STREAM_LISTPACKS, RDB_TYPE_STREAM_LISTPACKS_2,
    RDB_TYPE_STREAM_LISTPACKS_3, RDB_TYPE_STRING, RDB_TYPE_ZSET, RDB_TYPE_ZSET_2,
    RDB_TYPE_ZSET_LISTPACK, RDB_TYPE_ZSET_ZIPLIST,
};

/// First version that understands binary sorted set scores
const ZSET_2_SINCE: u16 = 8;
/// First version that understands quicklists
const QUICKLIST_SINCE: u16 = 7;

/// Quicklist v2 node holding a single unpacked element
const QUICKLIST_NODE_PLAIN: u64 = 1;
/// Quicklist v2 node holding a listpack
const QUICKLIST_NODE_PACKED: u64 = 2;

/// Stream IDs and PEL entries are raw 128-bit values
const STREAM_ID_LEN: u64 = 16;
/// Millisecond timestamps inside stream metadata
const STREAM_TIME_LEN: u64 = 8;

/// Errors raised while re-encoding a value
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The source stream is malformed or ended early
    #[error(transparent)]
    Rdb(#[from] RdbError),
    /// A quicklist segment does not end with the ziplist terminator
    #[error("corrupt quicklist segment {index}: terminator {found:#04x}, expected 0xff")]
    CorruptSegment {
        /// Zero-based segment position in the list
        index: u64,
        /// Byte found where the terminator belongs
        found: u8,
    },
    /// A quicklist segment could not be decoded
    #[error("quicklist segment {index}: {source}")]
    Ziplist {
        /// Zero-based segment position in the list
        index: u64,
        /// Decoder failure
        #[source]
        source: ZiplistError,
    },
    /// Pre-GA module values cannot be walked without the module itself
    #[error("module values with the pre-GA serialization are not supported")]
    UnsupportedModule,
    /// Type code this encoder does not know
    #[error("unknown value type {0}")]
    UnknownType(u8),
    /// Quicklist v2 node with an unknown container
    #[error("unknown quicklist node container {0}")]
    UnknownContainer(u64),
}

impl From<io::Error> for EncodeError {
    fn from(e: io::Error) -> Self {
        EncodeError::Rdb(e.into())
    }
}

impl EncodeError {
    /// Whether the source stream is still positioned at the next record.
    ///
    /// Segment failures are raised only after the remaining segments have
    /// been consumed, so the reader can move on. Anything else leaves the
    /// stream at an unknown offset.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EncodeError::CorruptSegment { .. } | EncodeError::Ziplist { .. }
        )
    }
}

/// Re-encodes values for one target version.
#[derive(Debug, Clone, Copy)]
pub struct ValueEncoder {
    version: u16,
}

impl ValueEncoder {
    /// `target` of `None` keeps the snapshot's own version.
    pub fn new(source_version: u16, target: Option<u16>) -> Self {
        Self {
            version: target.unwrap_or(source_version),
        }
    }

    /// Version every payload declares
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Consume one value body and seal it as a payload.
    ///
    /// On error nothing is produced; the partially built framer is dropped.
    pub fn encode(&self, type_code: u8, value: &mut dyn Read) -> Result<Payload, EncodeError> {
        match type_code {
            RDB_TYPE_ZSET_2 if self.version < ZSET_2_SINCE => self.downgrade_zset(value),
            RDB_TYPE_LIST_QUICKLIST if self.version < QUICKLIST_SINCE => {
                self.downgrade_quicklist(value)
            }
            _ => self.passthrough(type_code, value),
        }
    }

    /// Consume one value body without producing anything.
    pub fn skip(&self, type_code: u8, value: &mut dyn Read) -> Result<(), EncodeError> {
        walk_value(type_code, value)
    }

    fn passthrough(&self, type_code: u8, value: &mut dyn Read) -> Result<Payload, EncodeError> {
        let mut framer = PayloadFramer::new(type_code, self.version);
        {
            let mut tee = TeeReader::new(value, &mut framer);
            walk_value(type_code, &mut tee)?;
        }
        trace!(type_code, len = framer.len(), "value mirrored");
        Ok(framer.finish())
    }

    fn downgrade_zset(&self, value: &mut dyn Read) -> Result<Payload, EncodeError> {
        let count = read_length(value)?;
        let mut framer = PayloadFramer::new(RDB_TYPE_ZSET, self.version);
        save_len(&mut framer, count)?;
        for _ in 0..count {
            let member = read_string(value)?;
            let score = read_binary_double(value)?;
            save_string(&mut framer, &member)?;
            save_double(&mut framer, score)?;
        }
        trace!(count, "sorted set scores rewritten as text");
        Ok(framer.finish())
    }

    fn downgrade_quicklist(&self, value: &mut dyn Read) -> Result<Payload, EncodeError> {
        let segments = read_length(value)?;
        let mut body = Vec::new();
        let mut total: u64 = 0;

        for index in 0..segments {
            let raw = read_string(value)?;
            let entries = match ziplist::decode(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    // keep the stream aligned for the next record
                    for _ in index + 1..segments {
                        skip_string(value)?;
                    }
                    return Err(match e {
                        ZiplistError::BadTerminator(found) => {
                            EncodeError::CorruptSegment { index, found }
                        }
                        source => EncodeError::Ziplist { index, source },
                    });
                }
            };
            total += entries.len() as u64;
            for entry in entries {
                save_string(&mut body, &entry.into_bytes())?;
            }
        }

        let mut framer = PayloadFramer::with_capacity(RDB_TYPE_LIST, self.version, body.len() + 9);
        save_len(&mut framer, total)?;
        framer.write_all(&body)?;
        trace!(segments, total, "quicklist flattened");
        Ok(framer.finish())
    }
}

/// Consume exactly one value body of `type_code`, checking its structure.
fn walk_value<R: Read + ?Sized>(type_code: u8, r: &mut R) -> Result<(), EncodeError> {
    match type_code {
        RDB_TYPE_STRING
        | RDB_TYPE_HASH_ZIPMAP
        | RDB_TYPE_LIST_ZIPLIST
        | RDB_TYPE_SET_INTSET
        | RDB_TYPE_ZSET_ZIPLIST
        | RDB_TYPE_HASH_ZIPLIST
        | RDB_TYPE_HASH_LISTPACK
        | RDB_TYPE_ZSET_LISTPACK
        | RDB_TYPE_SET_LISTPACK => skip_string(r)?,
        RDB_TYPE_LIST | RDB_TYPE_SET | RDB_TYPE_LIST_QUICKLIST => {
            for _ in 0..read_length(r)? {
                skip_string(r)?;
            }
        }
        RDB_TYPE_ZSET => {
            for _ in 0..read_length(r)? {
                skip_string(r)?;
                skip_double(r)?;
            }
        }
        RDB_TYPE_ZSET_2 => {
            for _ in 0..read_length(r)? {
                skip_string(r)?;
                skip_bytes(r, 8)?;
            }
        }
        RDB_TYPE_HASH => {
            for _ in 0..read_length(r)? {
                skip_string(r)?;
                skip_string(r)?;
            }
        }
        RDB_TYPE_LIST_QUICKLIST_2 => {
            for _ in 0..read_length(r)? {
                match read_length(r)? {
                    QUICKLIST_NODE_PLAIN | QUICKLIST_NODE_PACKED => skip_string(r)?,
                    other => return Err(EncodeError::UnknownContainer(other)),
                }
            }
        }
        RDB_TYPE_MODULE => return Err(EncodeError::UnsupportedModule),
        RDB_TYPE_MODULE_2 => skip_module_body(r)?,
        RDB_TYPE_STREAM_LISTPACKS | RDB_TYPE_STREAM_LISTPACKS_2 | RDB_TYPE_STREAM_LISTPACKS_3 => {
            walk_stream(type_code, r)?
        }
        other => return Err(EncodeError::UnknownType(other)),
    }
    Ok(())
}

fn walk_stream<R: Read + ?Sized>(type_code: u8, r: &mut R) -> Result<(), EncodeError> {
    let since_v2 = type_code != RDB_TYPE_STREAM_LISTPACKS;
    let since_v3 = type_code == RDB_TYPE_STREAM_LISTPACKS_3;

    // listpacks: master id node key, then the listpack
    for _ in 0..read_length(r)? {
        skip_string(r)?;
        skip_string(r)?;
    }

    // length, last id
    for _ in 0..3 {
        read_length(r)?;
    }
    if since_v2 {
        // first id, max deleted id, entries added
        for _ in 0..5 {
            read_length(r)?;
        }
    }

    for _ in 0..read_length(r)? {
        skip_string(r)?;
        read_length(r)?;
        read_length(r)?;
        if since_v2 {
            // entries read
            read_length(r)?;
        }

        // global PEL: id, delivery time, delivery count
        for _ in 0..read_length(r)? {
            skip_bytes(r, STREAM_ID_LEN)?;
            skip_bytes(r, STREAM_TIME_LEN)?;
            read_length(r)?;
        }

        for _ in 0..read_length(r)? {
            skip_string(r)?;
            // seen time
            skip_bytes(r, STREAM_TIME_LEN)?;
            if since_v3 {
                // active time
                skip_bytes(r, STREAM_TIME_LEN)?;
            }
            // consumer PEL holds ids only
            let pending = read_length(r)?;
            skip_bytes(r, pending.saturating_mul(STREAM_ID_LEN))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::rdb::reader::read_double;
    use crate::rdb::writer::RdbWriter;
    use crate::rdb::ziplist::ZiplistEntry;
    use bytes::Bytes;

    fn zset2_body(pairs: &[(&str, f64)]) -> Vec<u8> {
        let mut w = RdbWriter::new();
        w.write_length(pairs.len() as u64);
        for (member, score) in pairs {
            w.write_string(member.as_bytes());
            w.write_binary_double(*score);
        }
        w.into_bytes().to_vec()
    }

    fn zl(items: &[&str]) -> Vec<u8> {
        let entries: Vec<_> = items
            .iter()
            .map(|s| match s.parse::<i64>() {
                Ok(n) => ZiplistEntry::Int(n),
                Err(_) => ZiplistEntry::Bytes(Bytes::copy_from_slice(s.as_bytes())),
            })
            .collect();
        ziplist::encode(&entries)
    }

    fn quicklist_body(segments: &[Vec<u8>]) -> Vec<u8> {
        let mut w = RdbWriter::new();
        w.write_length(segments.len() as u64);
        for seg in segments {
            w.write_string(seg);
        }
        w.into_bytes().to_vec()
    }

    #[test]
    fn test_zset2_downgraded_to_text_scores() {
        let body = zset2_body(&[("a", 1.5), ("b", 2.0)]);
        let encoder = ValueEncoder::new(9, Some(6));
        let payload = encoder
            .encode(RDB_TYPE_ZSET_2, &mut body.as_slice())
            .unwrap();

        assert_eq!(payload.type_code(), RDB_TYPE_ZSET);
        assert_eq!(payload.version(), 6);
        assert_eq!(payload.body(), b"\x02\x01a\x031.5\x01b\x012");
        assert!(Payload::verify(payload.as_bytes().clone()).is_ok());
    }

    #[test]
    fn test_zset2_special_scores() {
        let body = zset2_body(&[("n", f64::NEG_INFINITY), ("p", f64::INFINITY)]);
        let payload = ValueEncoder::new(9, Some(7))
            .encode(RDB_TYPE_ZSET_2, &mut body.as_slice())
            .unwrap();
        let mut rest = payload.body();
        assert_eq!(read_length(&mut rest).unwrap(), 2);
        assert_eq!(read_string(&mut rest).unwrap(), b"n");
        assert_eq!(read_double(&mut rest).unwrap(), f64::NEG_INFINITY);
        assert_eq!(read_string(&mut rest).unwrap(), b"p");
        assert_eq!(read_double(&mut rest).unwrap(), f64::INFINITY);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_zset2_kept_when_target_supports_it() {
        let body = zset2_body(&[("a", 1.5)]);
        let payload = ValueEncoder::new(9, None)
            .encode(RDB_TYPE_ZSET_2, &mut body.as_slice())
            .unwrap();
        assert_eq!(payload.type_code(), RDB_TYPE_ZSET_2);
        assert_eq!(payload.version(), 9);
        assert_eq!(payload.body(), body.as_slice());
    }

    #[test]
    fn test_quicklist_flattened() {
        let body = quicklist_body(&[zl(&["a", "b"]), zl(&["42", "c", "-7"])]);
        let payload = ValueEncoder::new(8, Some(6))
            .encode(RDB_TYPE_LIST_QUICKLIST, &mut body.as_slice())
            .unwrap();

        assert_eq!(payload.type_code(), RDB_TYPE_LIST);
        let mut rest = payload.body();
        assert_eq!(read_length(&mut rest).unwrap(), 5);
        let items: Vec<Vec<u8>> = (0..5).map(|_| read_string(&mut rest).unwrap()).collect();
        let expected: Vec<Vec<u8>> = ["a", "b", "42", "c", "-7"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(items, expected);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_quicklist_corrupt_segment_keeps_alignment() {
        let mut bad = zl(&["x"]);
        let last = bad.len() - 1;
        bad[last] = 0xAB;
        let mut body = quicklist_body(&[zl(&["a"]), bad, zl(&["b"])]);
        body.extend_from_slice(b"NEXT");

        let mut input = body.as_slice();
        let err = ValueEncoder::new(8, Some(6))
            .encode(RDB_TYPE_LIST_QUICKLIST, &mut input)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::CorruptSegment {
                index: 1,
                found: 0xAB
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(input, b"NEXT");
    }

    #[test]
    fn test_quicklist_passthrough_when_supported() {
        let body = quicklist_body(&[zl(&["a"])]);
        let payload = ValueEncoder::new(8, Some(7))
            .encode(RDB_TYPE_LIST_QUICKLIST, &mut body.as_slice())
            .unwrap();
        assert_eq!(payload.type_code(), RDB_TYPE_LIST_QUICKLIST);
        assert_eq!(payload.body(), body.as_slice());
    }

    #[test]
    fn test_passthrough_consumes_exactly_one_value() {
        let mut w = RdbWriter::new();
        w.write_length(2);
        w.write_string(b"f1");
        w.write_string(b"v1");
        w.write_string(b"f2");
        w.write_string(b"v2");
        let value = w.into_bytes();
        let mut data = value.to_vec();
        data.extend_from_slice(b"\xFF");

        let mut input = data.as_slice();
        let payload = ValueEncoder::new(9, None)
            .encode(RDB_TYPE_HASH, &mut input)
            .unwrap();
        assert_eq!(payload.body(), &value[..]);
        assert_eq!(input, b"\xFF");
    }

    #[test]
    fn test_passthrough_zset_text_scores() {
        let mut w = RdbWriter::new();
        w.write_length(1);
        w.write_string(b"m");
        w.write_double(3.25);
        let value = w.into_bytes();
        let payload = ValueEncoder::new(6, None)
            .encode(RDB_TYPE_ZSET, &mut &value[..])
            .unwrap();
        assert_eq!(payload.body(), &value[..]);
    }

    #[test]
    fn test_quicklist2_nodes() {
        let mut w = RdbWriter::new();
        w.write_length(2);
        w.write_length(QUICKLIST_NODE_PACKED);
        w.write_string(b"listpack-bytes");
        w.write_length(QUICKLIST_NODE_PLAIN);
        w.write_string(b"big-element");
        let value = w.into_bytes();
        let payload = ValueEncoder::new(11, None)
            .encode(RDB_TYPE_LIST_QUICKLIST_2, &mut &value[..])
            .unwrap();
        assert_eq!(payload.body(), &value[..]);

        let mut w = RdbWriter::new();
        w.write_length(1);
        w.write_length(9);
        let value = w.into_bytes();
        assert!(matches!(
            ValueEncoder::new(11, None).encode(RDB_TYPE_LIST_QUICKLIST_2, &mut &value[..]),
            Err(EncodeError::UnknownContainer(9))
        ));
    }

    fn stream_body(type_code: u8) -> Vec<u8> {
        let mut w = RdbWriter::new();
        // one listpack
        w.write_length(1);
        w.write_string(&[0u8; 16]);
        w.write_string(b"listpack");
        // length, last id
        w.write_length(3);
        w.write_length(1_700_000_000_000);
        w.write_length(2);
        if type_code != RDB_TYPE_STREAM_LISTPACKS {
            for n in [1_700_000_000_000, 0, 0, 0, 3] {
                w.write_length(n);
            }
        }
        // one group
        w.write_length(1);
        w.write_string(b"group");
        w.write_length(1_700_000_000_000);
        w.write_length(1);
        if type_code != RDB_TYPE_STREAM_LISTPACKS {
            w.write_length(2);
        }
        // PEL with one entry
        w.write_length(1);
        w.write_raw(&[7u8; 16]);
        w.write_raw(&1_700_000_000_123u64.to_le_bytes());
        w.write_length(1);
        // one consumer owning that entry
        w.write_length(1);
        w.write_string(b"alice");
        w.write_raw(&1_700_000_000_456u64.to_le_bytes());
        if type_code == RDB_TYPE_STREAM_LISTPACKS_3 {
            w.write_raw(&1_700_000_000_789u64.to_le_bytes());
        }
        w.write_length(1);
        w.write_raw(&[7u8; 16]);
        w.into_bytes().to_vec()
    }

    #[test]
    fn test_stream_versions_walked() {
        for type_code in [
            RDB_TYPE_STREAM_LISTPACKS,
            RDB_TYPE_STREAM_LISTPACKS_2,
            RDB_TYPE_STREAM_LISTPACKS_3,
        ] {
            let mut data = stream_body(type_code);
            let value_len = data.len();
            data.push(0xFF);
            let mut input = data.as_slice();
            let payload = ValueEncoder::new(11, None)
                .encode(type_code, &mut input)
                .unwrap();
            assert_eq!(payload.body(), &data[..value_len], "type {}", type_code);
            assert_eq!(input, b"\xFF");
        }
    }

    #[test]
    fn test_module2_walked() {
        // module id, UINT 5, STRING "x", EOF
        let value = [0x01, 0x02, 0x05, 0x05, 0x01, b'x', 0x00];
        let payload = ValueEncoder::new(9, None)
            .encode(RDB_TYPE_MODULE_2, &mut &value[..])
            .unwrap();
        assert_eq!(payload.body(), &value[..]);
    }

    #[test]
    fn test_unsupported_and_unknown_types() {
        let empty: &[u8] = &[];
        let encoder = ValueEncoder::new(9, None);
        assert!(matches!(
            encoder.encode(RDB_TYPE_MODULE, &mut &empty[..]),
            Err(EncodeError::UnsupportedModule)
        ));
        let err = encoder.encode(42, &mut &empty[..]).unwrap_err();
        assert!(matches!(err, EncodeError::UnknownType(42)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_truncated_value_is_not_recoverable() {
        let body = zset2_body(&[("a", 1.0)]);
        let err = ValueEncoder::new(9, Some(6))
            .encode(RDB_TYPE_ZSET_2, &mut &body[..body.len() - 3])
            .unwrap_err();
        assert!(matches!(err, EncodeError::Rdb(RdbError::UnexpectedEof)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_skip_consumes_value() {
        let body = quicklist_body(&[zl(&["a"]), zl(&["b"])]);
        let mut data = body.clone();
        data.push(0x00);
        let mut input = data.as_slice();
        ValueEncoder::new(9, None)
            .skip(RDB_TYPE_LIST_QUICKLIST, &mut input)
            .unwrap();
        assert_eq!(input, &[0x00]);
    }

    #[test]
    fn test_int_encoded_member_downgraded_as_text() {
        // member stored as INT8 7
        let mut w = RdbWriter::new();
        w.write_length(1);
        w.write_raw(&[0xC0, 0x07]);
        w.write_binary_double(0.5);
        let body = w.into_bytes();
        let payload = ValueEncoder::new(9, Some(6))
            .encode(RDB_TYPE_ZSET_2, &mut &body[..])
            .unwrap();
        assert_eq!(payload.body(), b"\x01\x017\x030.5");
    }
}
