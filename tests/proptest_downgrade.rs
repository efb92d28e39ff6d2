//! Property-based tests for payload generation
//!
//! Sorted sets and quicklists re-encoded for an older destination must
//! carry the same elements, and every payload's trailer must verify.

use proptest::prelude::*;
use std::io::Write;

use ferrite_rmt::dump::{Payload, PayloadFramer, ValueEncoder};
use ferrite_rmt::rdb::reader::{read_double, read_length, read_string, read_u8};
use ferrite_rmt::rdb::writer::{save_binary_double, save_len, save_string};
use ferrite_rmt::rdb::ziplist::{self, ZiplistEntry};
use ferrite_rmt::rdb::{RDB_TYPE_LIST, RDB_TYPE_LIST_QUICKLIST, RDB_TYPE_ZSET, RDB_TYPE_ZSET_2};

// ============================================================================
// Test Strategies
// ============================================================================

fn member_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..48)
}

fn score_strategy() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan())
}

fn zset_strategy() -> impl Strategy<Value = Vec<(Vec<u8>, f64)>> {
    prop::collection::vec((member_strategy(), score_strategy()), 0..32)
}

fn ziplist_entry_strategy() -> impl Strategy<Value = ZiplistEntry> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..80).prop_map(|b| ZiplistEntry::Bytes(b.into())),
        any::<i64>().prop_map(ZiplistEntry::Int),
        (-20i64..20).prop_map(ZiplistEntry::Int),
    ]
}

fn quicklist_strategy() -> impl Strategy<Value = Vec<Vec<ZiplistEntry>>> {
    prop::collection::vec(prop::collection::vec(ziplist_entry_strategy(), 1..16), 0..6)
}

fn zset2_body(members: &[(Vec<u8>, f64)]) -> Vec<u8> {
    let mut body = Vec::new();
    save_len(&mut body, members.len() as u64).unwrap();
    for (member, score) in members {
        save_string(&mut body, member).unwrap();
        save_binary_double(&mut body, *score).unwrap();
    }
    body
}

fn quicklist_body(segments: &[Vec<ZiplistEntry>]) -> Vec<u8> {
    let mut body = Vec::new();
    save_len(&mut body, segments.len() as u64).unwrap();
    for segment in segments {
        save_string(&mut body, &ziplist::encode(segment)).unwrap();
    }
    body
}

// ============================================================================
// Downgrade Properties
// ============================================================================

proptest! {
    /// Property: a sorted set downgraded to the textual encoding keeps every
    /// member and score, in order
    #[test]
    fn prop_zset_downgrade_preserves_members(members in zset_strategy(), target in 1u16..8) {
        let encoder = ValueEncoder::new(9, Some(target));
        let body = zset2_body(&members);
        let payload = encoder.encode(RDB_TYPE_ZSET_2, &mut &body[..]).unwrap();

        prop_assert_eq!(payload.type_code(), RDB_TYPE_ZSET);
        prop_assert_eq!(payload.version(), target);

        let mut r = payload.body();
        let count = read_length(&mut r).unwrap();
        prop_assert_eq!(count, members.len() as u64);
        for (member, score) in &members {
            prop_assert_eq!(&read_string(&mut r).unwrap(), member);
            let decoded = read_double(&mut r).unwrap();
            prop_assert_eq!(decoded, *score);
        }
        prop_assert!(r.is_empty());
    }

    /// Property: a flattened quicklist holds every segment's elements, in
    /// order, as strings
    #[test]
    fn prop_quicklist_flatten_preserves_elements(segments in quicklist_strategy(), target in 1u16..7) {
        let encoder = ValueEncoder::new(8, Some(target));
        let body = quicklist_body(&segments);
        let payload = encoder.encode(RDB_TYPE_LIST_QUICKLIST, &mut &body[..]).unwrap();

        prop_assert_eq!(payload.type_code(), RDB_TYPE_LIST);

        let expected: Vec<Vec<u8>> = segments
            .iter()
            .flatten()
            .map(|e| e.clone().into_bytes().to_vec())
            .collect();
        let mut r = payload.body();
        let count = read_length(&mut r).unwrap();
        prop_assert_eq!(count, expected.len() as u64);
        for element in &expected {
            prop_assert_eq!(&read_string(&mut r).unwrap(), element);
        }
        prop_assert!(r.is_empty());
    }

    /// Property: passthrough keeps the value bytes untouched
    #[test]
    fn prop_supported_versions_pass_through(members in zset_strategy()) {
        let encoder = ValueEncoder::new(9, Some(8));
        let body = zset2_body(&members);
        let payload = encoder.encode(RDB_TYPE_ZSET_2, &mut &body[..]).unwrap();
        prop_assert_eq!(payload.type_code(), RDB_TYPE_ZSET_2);
        prop_assert_eq!(payload.body(), &body[..]);
    }
}

// ============================================================================
// Special Scores
// ============================================================================

/// Downgrade a one-member sorted set and return the score's leading byte
fn downgraded_score_marker(score: f64) -> u8 {
    let encoder = ValueEncoder::new(9, Some(6));
    let body = zset2_body(&[(b"m".to_vec(), score)]);
    let payload = encoder.encode(RDB_TYPE_ZSET_2, &mut &body[..]).unwrap();
    assert_eq!(payload.type_code(), RDB_TYPE_ZSET);

    let mut r = payload.body();
    assert_eq!(read_length(&mut r).unwrap(), 1);
    assert_eq!(read_string(&mut r).unwrap(), b"m".to_vec());
    let marker = read_u8(&mut r).unwrap();
    assert!(r.is_empty());
    marker
}

#[test]
fn test_nan_score_downgrades_to_marker() {
    assert_eq!(downgraded_score_marker(f64::NAN), 253);
}

#[test]
fn test_positive_infinity_score_downgrades_to_marker() {
    assert_eq!(downgraded_score_marker(f64::INFINITY), 254);
}

#[test]
fn test_negative_infinity_score_downgrades_to_marker() {
    assert_eq!(downgraded_score_marker(f64::NEG_INFINITY), 255);
}

// ============================================================================
// Checksum Properties
// ============================================================================

proptest! {
    /// Property: every sealed payload verifies against its own trailer
    #[test]
    fn prop_trailer_matches_content(
        type_code in 0u8..22,
        version in 1u16..13,
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut framer = PayloadFramer::new(type_code, version);
        framer.write_all(&body).unwrap();
        let payload = framer.finish();

        let verified = Payload::verify(payload.as_bytes().clone()).unwrap();
        prop_assert_eq!(verified.type_code(), type_code);
        prop_assert_eq!(verified.version(), version);
        prop_assert_eq!(verified.checksum(), payload.checksum());
        prop_assert_eq!(verified.body(), &body[..]);
    }

    /// Property: flipping any byte before the checksum is detected
    #[test]
    fn prop_corruption_detected(
        body in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut framer = PayloadFramer::new(0, 9);
        framer.write_all(&body).unwrap();
        let mut bytes = framer.finish().into_bytes().to_vec();
        let at = index.index(bytes.len() - 8);
        bytes[at] ^= flip;
        prop_assert!(Payload::verify(bytes).is_err());
    }
}
