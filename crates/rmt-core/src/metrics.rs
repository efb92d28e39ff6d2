//! Migration counters
//!
//! [`MigrationMetrics`] keeps its own atomic totals for the end-of-run
//! summary and mirrors every increment to the `metrics` facade, so an
//! installed recorder sees the same numbers.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a key did not reach the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Its TTL had already elapsed
    Expired,
    /// The destination rejected it or could not be reached
    Failed,
    /// The value could not be re-encoded
    Encode,
}

impl FailureReason {
    /// Label value used for `rmt_keys_failed_total`
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Expired => "expired",
            FailureReason::Failed => "failed",
            FailureReason::Encode => "encode",
        }
    }
}

/// Shared counters for one migration run
#[derive(Debug, Default)]
pub struct MigrationMetrics {
    restored: AtomicU64,
    expired: AtomicU64,
    failed: AtomicU64,
    encode_failed: AtomicU64,
    filtered: AtomicU64,
    retries: AtomicU64,
    reconnects: AtomicU64,
    bytes_sent: AtomicU64,
}

impl MigrationMetrics {
    /// Create a zeroed counter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key accepted by the destination
    pub fn record_restored(&self, payload_bytes: u64) {
        self.restored.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_bytes, Ordering::Relaxed);
        counter!("rmt_keys_restored_total").increment(1);
        counter!("rmt_bytes_sent_total").increment(payload_bytes);
    }

    /// Record a key that was not written
    pub fn record_failure(&self, reason: FailureReason) {
        let slot = match reason {
            FailureReason::Expired => &self.expired,
            FailureReason::Failed => &self.failed,
            FailureReason::Encode => &self.encode_failed,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!("rmt_keys_failed_total", "reason" => reason.as_str()).increment(1);
    }

    /// Record a key skipped by the entry filter
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
        counter!("rmt_keys_filtered_total").increment(1);
    }

    /// Record a repeated delivery attempt
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        counter!("rmt_retries_total").increment(1);
    }

    /// Record a successful reconnection
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        counter!("rmt_reconnects_total").increment(1);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MigrationSummary {
        MigrationSummary {
            restored: self.restored.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            encode_failed: self.encode_failed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Final counter values, as printed by the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    /// Keys accepted by the destination
    pub restored: u64,
    /// Keys skipped because their TTL had elapsed
    pub expired: u64,
    /// Keys that exhausted their attempts
    pub failed: u64,
    /// Keys whose value could not be re-encoded
    pub encode_failed: u64,
    /// Keys excluded by the entry filter
    pub filtered: u64,
    /// Repeated delivery attempts
    pub retries: u64,
    /// Reconnections to the destination
    pub reconnects: u64,
    /// Payload bytes accepted by the destination
    pub bytes_sent: u64,
}

impl MigrationSummary {
    /// Keys that were read from the snapshot and not filtered out
    pub fn processed(&self) -> u64 {
        self.restored + self.expired + self.failed + self.encode_failed
    }

    /// Whether any key failed to migrate (expiry is not a failure)
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.encode_failed > 0
    }
}
