//! Redis RDB snapshot format
//!
//! Low-level codecs shared by the snapshot reader and the payload encoder,
//! plus a streaming reader over a whole snapshot file.
//!
//! RDB format: [REDIS magic] [version] [aux / database sections] [EOF] [checksum]

pub mod lzf;
pub mod reader;
pub mod snapshot;
pub mod writer;
pub mod ziplist;

pub use reader::{RdbError, TeeReader};
pub use snapshot::{Entry, SnapshotReader};

use ferrite_rmt_core::config::ValueKind;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub(crate) const RDB_MAGIC: &[u8] = b"REDIS";

pub(crate) const RDB_OPCODE_SLOT_INFO: u8 = 0xF4;
pub(crate) const RDB_OPCODE_FUNCTION2: u8 = 0xF5;
pub(crate) const RDB_OPCODE_FUNCTION_PRE_GA: u8 = 0xF6;
pub(crate) const RDB_OPCODE_MODULE_AUX: u8 = 0xF7;
pub(crate) const RDB_OPCODE_IDLE: u8 = 0xF8;
pub(crate) const RDB_OPCODE_FREQ: u8 = 0xF9;
pub(crate) const RDB_OPCODE_AUX: u8 = 0xFA;
pub(crate) const RDB_OPCODE_RESIZEDB: u8 = 0xFB;
pub(crate) const RDB_OPCODE_EXPIRETIME_MS: u8 = 0xFC;
pub(crate) const RDB_OPCODE_EXPIRETIME: u8 = 0xFD;
pub(crate) const RDB_OPCODE_SELECTDB: u8 = 0xFE;
pub(crate) const RDB_OPCODE_EOF: u8 = 0xFF;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Plain string
pub const RDB_TYPE_STRING: u8 = 0;
/// Linked list of strings
pub const RDB_TYPE_LIST: u8 = 1;
/// Set of strings
pub const RDB_TYPE_SET: u8 = 2;
/// Sorted set with textual scores
pub const RDB_TYPE_ZSET: u8 = 3;
/// Hash of string pairs
pub const RDB_TYPE_HASH: u8 = 4;
/// Sorted set with binary scores (RDB 8+)
pub const RDB_TYPE_ZSET_2: u8 = 5;
/// Module value, pre-GA serialization
pub const RDB_TYPE_MODULE: u8 = 6;
/// Module value with opcode-tagged serialization
pub const RDB_TYPE_MODULE_2: u8 = 7;
/// Hash as zipmap blob
pub const RDB_TYPE_HASH_ZIPMAP: u8 = 9;
/// List as ziplist blob
pub const RDB_TYPE_LIST_ZIPLIST: u8 = 10;
/// Set as intset blob
pub const RDB_TYPE_SET_INTSET: u8 = 11;
/// Sorted set as ziplist blob
pub const RDB_TYPE_ZSET_ZIPLIST: u8 = 12;
/// Hash as ziplist blob
pub const RDB_TYPE_HASH_ZIPLIST: u8 = 13;
/// List as a sequence of ziplist segments (RDB 7+)
pub const RDB_TYPE_LIST_QUICKLIST: u8 = 14;
/// Stream of listpacks
pub const RDB_TYPE_STREAM_LISTPACKS: u8 = 15;
/// Hash as listpack blob
pub const RDB_TYPE_HASH_LISTPACK: u8 = 16;
/// Sorted set as listpack blob
pub const RDB_TYPE_ZSET_LISTPACK: u8 = 17;
/// List as a sequence of listpack (or plain) nodes
pub const RDB_TYPE_LIST_QUICKLIST_2: u8 = 18;
/// Stream with first id, max deleted id and entries added
pub const RDB_TYPE_STREAM_LISTPACKS_2: u8 = 19;
/// Set as listpack blob
pub const RDB_TYPE_SET_LISTPACK: u8 = 20;
/// Stream with consumer active time
pub const RDB_TYPE_STREAM_LISTPACKS_3: u8 = 21;

/// Logical kind of a value type code, if the code is known
pub fn value_kind(type_code: u8) -> Option<ValueKind> {
    match type_code {
        RDB_TYPE_STRING => Some(ValueKind::String),
        RDB_TYPE_LIST
        | RDB_TYPE_LIST_ZIPLIST
        | RDB_TYPE_LIST_QUICKLIST
        | RDB_TYPE_LIST_QUICKLIST_2 => Some(ValueKind::List),
        RDB_TYPE_SET | RDB_TYPE_SET_INTSET | RDB_TYPE_SET_LISTPACK => Some(ValueKind::Set),
        RDB_TYPE_ZSET | RDB_TYPE_ZSET_2 | RDB_TYPE_ZSET_ZIPLIST | RDB_TYPE_ZSET_LISTPACK => {
            Some(ValueKind::Zset)
        }
        RDB_TYPE_HASH | RDB_TYPE_HASH_ZIPMAP | RDB_TYPE_HASH_ZIPLIST | RDB_TYPE_HASH_LISTPACK => {
            Some(ValueKind::Hash)
        }
        RDB_TYPE_MODULE | RDB_TYPE_MODULE_2 => Some(ValueKind::Module),
        RDB_TYPE_STREAM_LISTPACKS | RDB_TYPE_STREAM_LISTPACKS_2 | RDB_TYPE_STREAM_LISTPACKS_3 => {
            Some(ValueKind::Stream)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_mapping() {
        assert_eq!(value_kind(RDB_TYPE_STRING), Some(ValueKind::String));
        assert_eq!(value_kind(RDB_TYPE_LIST_QUICKLIST), Some(ValueKind::List));
        assert_eq!(value_kind(RDB_TYPE_ZSET_2), Some(ValueKind::Zset));
        assert_eq!(value_kind(RDB_TYPE_HASH_ZIPMAP), Some(ValueKind::Hash));
        assert_eq!(value_kind(RDB_TYPE_STREAM_LISTPACKS_3), Some(ValueKind::Stream));
        assert_eq!(value_kind(8), None);
        assert_eq!(value_kind(RDB_OPCODE_AUX), None);
    }
}
