//! Entry dispatcher
//!
//! Pulls entries from the snapshot, re-encodes each selected one and sends
//! a [`MigrationEvent::KeyPayload`] down the pipeline. Runs on a blocking
//! thread; a full channel blocks the reader, which is the pipeline's
//! backpressure.

use std::io::Read;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use super::filter::EntryFilter;
use super::{KeyPayload, MigrateError, MigrationEvent, Result};
use crate::dump::ValueEncoder;
use crate::rdb::SnapshotReader;
use ferrite_rmt_core::{FailureReason, MigrationMetrics};

/// Turns snapshot entries into migration events.
pub struct Dispatcher {
    encoder: ValueEncoder,
    filter: EntryFilter,
    metrics: Arc<MigrationMetrics>,
    events: mpsc::Sender<MigrationEvent>,
}

impl Dispatcher {
    /// Dispatcher sending into `events`
    pub fn new(
        encoder: ValueEncoder,
        filter: EntryFilter,
        metrics: Arc<MigrationMetrics>,
        events: mpsc::Sender<MigrationEvent>,
    ) -> Self {
        Self {
            encoder,
            filter,
            metrics,
            events,
        }
    }

    /// Dispatch the whole snapshot, framed by `ConnectionOpen` and
    /// `StreamClosed`. Returns the number of keys sent.
    ///
    /// Must not be called from an async context.
    pub fn run<R: Read>(&self, reader: &mut SnapshotReader<R>) -> Result<u64> {
        self.emit(MigrationEvent::ConnectionOpen)?;
        let dispatched = self.dispatch_entries(reader);
        let closed = self.emit(MigrationEvent::StreamClosed);
        let dispatched = dispatched?;
        closed?;
        debug!(dispatched, "snapshot dispatched");
        Ok(dispatched)
    }

    fn dispatch_entries<R: Read>(&self, reader: &mut SnapshotReader<R>) -> Result<u64> {
        let mut dispatched = 0u64;
        let mut current_db: Option<u32> = None;

        while let Some(entry) = reader.next_entry()? {
            if current_db.is_some_and(|db| db != entry.db) {
                self.emit(MigrationEvent::StreamFlush)?;
            }
            current_db = Some(entry.db);

            if !self.filter.matches(entry.db, &entry.key, entry.type_code) {
                self.encoder.skip(entry.type_code, entry.value)?;
                self.metrics.record_filtered();
                trace!(key = %String::from_utf8_lossy(&entry.key), "filtered");
                continue;
            }

            match self.encoder.encode(entry.type_code, entry.value) {
                Ok(payload) => {
                    trace!(
                        key = %String::from_utf8_lossy(&entry.key),
                        db = entry.db,
                        type_code = payload.type_code(),
                        len = payload.len(),
                        "dispatching"
                    );
                    self.emit(MigrationEvent::KeyPayload(KeyPayload {
                        key: entry.key,
                        db: entry.db,
                        expire_at_ms: entry.expire_at_ms,
                        payload,
                    }))?;
                    dispatched += 1;
                }
                Err(e) => {
                    self.metrics.record_failure(FailureReason::Encode);
                    error!(
                        key = %String::from_utf8_lossy(&entry.key),
                        type_code = entry.type_code,
                        reason = %e,
                        "failure[encode]"
                    );
                    if !e.is_recoverable() {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(dispatched)
    }

    fn emit(&self, event: MigrationEvent) -> Result<()> {
        self.events
            .blocking_send(event)
            .map_err(|_| MigrateError::ChannelClosed)
    }
}
