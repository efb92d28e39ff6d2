//! Streaming snapshot reader
//!
//! Walks an RDB file one key at a time. Each [`Entry`] borrows the reader
//! positioned at the start of its value body; the caller must consume the
//! value completely (encode or skip it) before asking for the next entry.

use bytes::Bytes;
use std::io::Read;
use tracing::{debug, trace};

use super::reader::{
    read_length, read_string, read_u32_le, read_u64_le, read_u8, skip_bytes, skip_module_body,
    skip_string, RdbError, Result,
};
use super::{
    RDB_MAGIC, RDB_OPCODE_AUX, RDB_OPCODE_EOF, RDB_OPCODE_EXPIRETIME, RDB_OPCODE_EXPIRETIME_MS,
    RDB_OPCODE_FREQ, RDB_OPCODE_FUNCTION2, RDB_OPCODE_FUNCTION_PRE_GA, RDB_OPCODE_IDLE,
    RDB_OPCODE_MODULE_AUX, RDB_OPCODE_RESIZEDB, RDB_OPCODE_SELECTDB, RDB_OPCODE_SLOT_INFO,
};
use ferrite_rmt_core::config::{MAX_RDB_VERSION, MIN_RDB_VERSION};

/// First version that ends the file with an 8-byte checksum
const RDB_VERSION_CHECKSUM: u16 = 5;

/// One key read from the snapshot.
pub struct Entry<'a> {
    /// Key bytes
    pub key: Bytes,
    /// Value type code
    pub type_code: u8,
    /// Logical database the key lives in
    pub db: u32,
    /// Absolute expiry, milliseconds since the Unix epoch
    pub expire_at_ms: Option<i64>,
    /// Value body, positioned right after the key
    pub value: &'a mut dyn Read,
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("type_code", &self.type_code)
            .field("db", &self.db)
            .field("expire_at_ms", &self.expire_at_ms)
            .finish_non_exhaustive()
    }
}

/// Forward-only reader over a snapshot file.
pub struct SnapshotReader<R> {
    inner: R,
    version: u16,
    db: u32,
    aux: Vec<(String, String)>,
    finished: bool,
}

impl<R: Read> SnapshotReader<R> {
    /// Read the header and position the reader at the first record.
    pub fn open(mut inner: R) -> Result<Self> {
        let version = read_header(&mut inner)?;
        debug!(version, "opened snapshot");
        Ok(Self {
            inner,
            version,
            db: 0,
            aux: Vec::new(),
            finished: false,
        })
    }

    /// Format version declared in the header
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Auxiliary fields seen so far
    pub fn aux(&self) -> &[(String, String)] {
        &self.aux
    }

    /// Whether the EOF marker has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance to the next key. Returns `None` after the EOF opcode.
    pub fn next_entry(&mut self) -> Result<Option<Entry<'_>>> {
        if self.finished {
            return Ok(None);
        }

        let mut expire_at_ms: Option<i64> = None;

        loop {
            let opcode = match read_u8(&mut self.inner) {
                Ok(op) => op,
                // pre-checksum files may simply end without an EOF opcode
                Err(RdbError::UnexpectedEof) if self.version < RDB_VERSION_CHECKSUM => {
                    self.finished = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match opcode {
                RDB_OPCODE_EOF => {
                    if self.version >= RDB_VERSION_CHECKSUM {
                        let checksum = read_u64_le(&mut self.inner)?;
                        trace!(checksum, "snapshot trailer");
                    }
                    self.finished = true;
                    return Ok(None);
                }
                RDB_OPCODE_SELECTDB => {
                    self.db = read_length(&mut self.inner)? as u32;
                    debug!(db = self.db, "selecting database");
                }
                RDB_OPCODE_RESIZEDB => {
                    let db_size = read_length(&mut self.inner)?;
                    let expires_size = read_length(&mut self.inner)?;
                    trace!(db_size, expires_size, "resize db");
                }
                RDB_OPCODE_AUX => {
                    let key = String::from_utf8_lossy(&read_string(&mut self.inner)?).into_owned();
                    let value =
                        String::from_utf8_lossy(&read_string(&mut self.inner)?).into_owned();
                    debug!(key = %key, value = %value, "aux field");
                    self.aux.push((key, value));
                }
                RDB_OPCODE_EXPIRETIME_MS => {
                    expire_at_ms = Some(read_u64_le(&mut self.inner)? as i64);
                }
                RDB_OPCODE_EXPIRETIME => {
                    expire_at_ms = Some(read_u32_le(&mut self.inner)? as i64 * 1000);
                }
                RDB_OPCODE_IDLE => {
                    read_length(&mut self.inner)?;
                }
                RDB_OPCODE_FREQ => {
                    skip_bytes(&mut self.inner, 1)?;
                }
                RDB_OPCODE_SLOT_INFO => {
                    // slot id, slot size, expires slot size
                    let slot = read_length(&mut self.inner)?;
                    read_length(&mut self.inner)?;
                    read_length(&mut self.inner)?;
                    trace!(slot, "skipped slot info");
                }
                RDB_OPCODE_MODULE_AUX => {
                    skip_module_body(&mut self.inner)?;
                }
                RDB_OPCODE_FUNCTION2 => {
                    skip_string(&mut self.inner)?;
                }
                RDB_OPCODE_FUNCTION_PRE_GA => {
                    return Err(RdbError::UnsupportedOpcode(opcode));
                }
                type_code => {
                    let key = Bytes::from(read_string(&mut self.inner)?);
                    return Ok(Some(Entry {
                        key,
                        type_code,
                        db: self.db,
                        expire_at_ms,
                        value: &mut self.inner,
                    }));
                }
            }
        }
    }
}

/// Parse the 9-byte RDB header: "REDIS" magic + 4-digit ASCII version.
fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<u16> {
    let mut header = [0u8; 9];
    r.read_exact(&mut header)?;
    if &header[..5] != RDB_MAGIC {
        return Err(RdbError::InvalidMagic);
    }
    let version: u16 = std::str::from_utf8(&header[5..9])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RdbError::InvalidMagic)?;
    if !(MIN_RDB_VERSION..=MAX_RDB_VERSION).contains(&version) {
        return Err(RdbError::UnsupportedVersion(version));
    }
    Ok(version)
}
