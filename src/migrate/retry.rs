//! Per-key delivery with bounded retry
//!
//! [`RetryEngine::deliver`] writes one key through the worker's connection:
//!
//! 1. `SELECT` the key's database if the connection is elsewhere.
//! 2. Drop the key if its expiry has already passed.
//! 3. `RESTORE key ttl payload [REPLACE]`, or `EVALSHA` of the legacy
//!    delete-then-restore script for destinations without `REPLACE`.
//! 4. On failure, reconnect and start over while attempts remain and the
//!    pipeline runs in flush-per-command mode.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::endpoint::{Connector, Endpoint, EndpointError};
use super::{KeyPayload, MigrateError, Result};
use ferrite_rmt_core::config::MigrateConfig;
use ferrite_rmt_core::protocol::Frame;
use ferrite_rmt_core::{FailureReason, MigrationMetrics};

/// Emulates `RESTORE ... REPLACE` on servers that lack the flag
pub const LEGACY_RESTORE_SCRIPT: &[u8] =
    b"redis.call('del',KEYS[1]);return redis.call('restore',KEYS[1],ARGV[1],ARGV[2]);";

const SELECT: &[u8] = b"SELECT";
const RESTORE: &[u8] = b"RESTORE";
const REPLACE: &[u8] = b"REPLACE";
const SCRIPT: &[u8] = b"SCRIPT";
const LOAD: &[u8] = b"LOAD";
const EVALSHA: &[u8] = b"EVALSHA";
const ONE: &[u8] = b"1";
const NOSCRIPT: &str = "NOSCRIPT";

/// Process-wide hash of the loaded legacy script.
///
/// Workers may race to load it; the first stored hash is the one everybody
/// uses afterwards.
#[derive(Debug, Default)]
pub struct ScriptCache {
    sha: Mutex<Option<Bytes>>,
}

impl ScriptCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached hash, if any
    pub fn get(&self) -> Option<Bytes> {
        self.sha.lock().clone()
    }

    /// Keep `sha` unless a hash is already cached; returns the retained one.
    pub fn store(&self, sha: Bytes) -> Bytes {
        self.sha.lock().get_or_insert(sha).clone()
    }

    /// Forget `stale` so the next user reloads. A newer hash is kept.
    pub fn invalidate(&self, stale: &Bytes) {
        let mut sha = self.sha.lock();
        if sha.as_ref() == Some(stale) {
            *sha = None;
        }
    }
}

/// A restore written to the pipeline whose reply has not been read yet
#[derive(Debug)]
struct PendingRestore {
    key: Bytes,
    bytes: u64,
    script: Option<Bytes>,
}

/// Connection state owned by one worker.
pub struct WorkerContext {
    id: usize,
    endpoint: Option<Box<dyn Endpoint>>,
    db: u32,
    in_flight: VecDeque<PendingRestore>,
}

impl WorkerContext {
    /// Context for worker `id`, not yet connected
    pub fn new(id: usize) -> Self {
        Self {
            id,
            endpoint: None,
            db: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Worker id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Database last selected on the current connection
    pub fn db(&self) -> u32 {
        self.db
    }

    /// Whether a connection is held
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Restores waiting for their reply
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// How keys are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Attempts per key, including the first
    pub max_attempts: u32,
    /// Flush after every command; retries need this
    pub flush: bool,
    /// Overwrite existing keys
    pub replace: bool,
    /// Destination lacks `RESTORE ... REPLACE`
    pub legacy: bool,
}

impl DeliveryPolicy {
    /// Policy described by the `[migrate]` section
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            flush: config.flush,
            replace: config.replace,
            legacy: config.legacy,
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_config(&MigrateConfig::default())
    }
}

/// Writes keys and accounts for their outcome.
pub struct RetryEngine {
    connector: Arc<dyn Connector>,
    scripts: Arc<ScriptCache>,
    metrics: Arc<MigrationMetrics>,
    policy: DeliveryPolicy,
}

impl RetryEngine {
    /// Engine writing through connections from `connector`
    pub fn new(
        connector: Arc<dyn Connector>,
        scripts: Arc<ScriptCache>,
        metrics: Arc<MigrationMetrics>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            connector,
            scripts,
            metrics,
            policy,
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Replace the worker's connection with a fresh one.
    pub async fn open(&self, ctx: &mut WorkerContext) -> std::result::Result<(), EndpointError> {
        self.discard(ctx).await;
        let endpoint = self.connector.connect().await?;
        ctx.endpoint = Some(endpoint);
        ctx.db = 0;
        debug!(worker = ctx.id, addr = %self.connector.addr(), "worker connected");
        Ok(())
    }

    /// Flush the pipeline and account for the replies. Never fails.
    pub async fn flush(&self, ctx: &mut WorkerContext) {
        let Some(endpoint) = ctx.endpoint.as_mut() else {
            return;
        };
        match endpoint.flush().await {
            Ok(replies) => self.settle_earlier(ctx, replies),
            Err(e) => {
                warn!(worker = ctx.id, error = %e, "pipeline flush failed");
                self.discard(ctx).await;
            }
        }
    }

    /// Flush, then release the connection. Never fails.
    pub async fn close(&self, ctx: &mut WorkerContext) {
        self.flush(ctx).await;
        if let Some(mut endpoint) = ctx.endpoint.take() {
            endpoint.close().await;
            debug!(worker = ctx.id, "worker disconnected");
        }
    }

    async fn connect(&self, ctx: &mut WorkerContext) -> Result<()> {
        let endpoint = self
            .connector
            .connect()
            .await
            .map_err(|source| MigrateError::ConnectFailed {
                addr: self.connector.addr(),
                source,
            })?;
        ctx.endpoint = Some(endpoint);
        ctx.db = 0;
        Ok(())
    }

    /// Close the connection; restores still in its pipeline are lost.
    async fn discard(&self, ctx: &mut WorkerContext) {
        for lost in ctx.in_flight.drain(..) {
            self.metrics.record_failure(FailureReason::Failed);
            error!(
                worker = ctx.id,
                key = %String::from_utf8_lossy(&lost.key),
                "failure[failed]: connection lost before the reply"
            );
        }
        if let Some(mut endpoint) = ctx.endpoint.take() {
            endpoint.close().await;
        }
    }

    /// New connection to the same destination, back on the last database.
    async fn reconnect(&self, ctx: &mut WorkerContext) {
        let last_db = ctx.db;
        self.discard(ctx).await;
        if let Err(e) = self.connect(ctx).await {
            warn!(worker = ctx.id, error = %e, "reconnect failed");
            return;
        }
        self.metrics.record_reconnect();
        if last_db != 0 {
            if let Err(e) = self.select(ctx, last_db).await {
                warn!(worker = ctx.id, db = last_db, error = %e, "reselect after reconnect failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Write one key, retrying per the policy. Failures are counted and
    /// logged here and never returned.
    pub async fn deliver(&self, ctx: &mut WorkerContext, item: &KeyPayload) {
        let mut attempts_left = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            trace!(worker = ctx.id, key = %String::from_utf8_lossy(&item.key), attempt, "delivering");
            let err = match self.attempt(ctx, item).await {
                Ok(()) => return,
                Err(e) => e,
            };
            attempts_left -= 1;
            if attempts_left > 0 && self.policy.flush {
                self.metrics.record_retry();
                warn!(
                    worker = ctx.id,
                    key = %String::from_utf8_lossy(&item.key),
                    attempt,
                    error = %err,
                    "write failed, reconnecting"
                );
                self.reconnect(ctx).await;
                attempt += 1;
            } else {
                self.metrics.record_failure(FailureReason::Failed);
                error!(
                    worker = ctx.id,
                    key = %String::from_utf8_lossy(&item.key),
                    attempts = attempt,
                    reason = %err,
                    "failure[failed]"
                );
                return;
            }
        }
    }

    async fn attempt(&self, ctx: &mut WorkerContext, item: &KeyPayload) -> Result<()> {
        if ctx.endpoint.is_none() {
            self.connect(ctx).await?;
        }
        if item.db != ctx.db {
            self.select(ctx, item.db).await?;
        }

        let ttl = match item.expire_at_ms {
            Some(at) => {
                let remaining = at.saturating_sub(now_ms());
                if remaining <= 0 {
                    self.metrics.record_failure(FailureReason::Expired);
                    debug!(
                        worker = ctx.id,
                        key = %String::from_utf8_lossy(&item.key),
                        "failure[expired]"
                    );
                    return Ok(());
                }
                remaining
            }
            None => 0,
        };
        let ttl = Bytes::from(ttl.to_string());
        let payload = item.payload.as_bytes().clone();
        let key = item.key.clone();

        let (args, script) = if !self.policy.replace {
            (vec![Bytes::from_static(RESTORE), key, ttl, payload], None)
        } else if self.policy.legacy {
            let sha = self.script_sha(ctx).await?;
            let args = vec![
                Bytes::from_static(EVALSHA),
                sha.clone(),
                Bytes::from_static(ONE),
                key,
                ttl,
                payload,
            ];
            (args, Some(sha))
        } else {
            let args = vec![
                Bytes::from_static(RESTORE),
                key,
                ttl,
                payload,
                Bytes::from_static(REPLACE),
            ];
            (args, None)
        };

        let restore = PendingRestore {
            key: item.key.clone(),
            bytes: item.payload.len() as u64,
            script,
        };
        self.submit(ctx, restore, &args).await
    }

    /// `SELECT db`, waiting for the acknowledgement before caching it.
    async fn select(&self, ctx: &mut WorkerContext, db: u32) -> Result<()> {
        let args = [Bytes::from_static(SELECT), Bytes::from(db.to_string())];
        let reply = self.round_trip(ctx, &args).await?;
        if let Some(msg) = reply.error_message() {
            return Err(MigrateError::WriteFailed(format!("SELECT {}: {}", db, msg)));
        }
        ctx.db = db;
        debug!(worker = ctx.id, db, "selected database");
        Ok(())
    }

    async fn script_sha(&self, ctx: &mut WorkerContext) -> Result<Bytes> {
        if let Some(sha) = self.scripts.get() {
            return Ok(sha);
        }
        let args = [
            Bytes::from_static(SCRIPT),
            Bytes::from_static(LOAD),
            Bytes::from_static(LEGACY_RESTORE_SCRIPT),
        ];
        let reply = self.round_trip(ctx, &args).await?;
        if let Some(msg) = reply.error_message() {
            return Err(MigrateError::ScriptLoadFailed(msg));
        }
        match reply.into_bytes() {
            Some(sha) if !sha.is_empty() => {
                let sha = self.scripts.store(sha);
                debug!(worker = ctx.id, sha = %String::from_utf8_lossy(&sha), "legacy script loaded");
                Ok(sha)
            }
            _ => Err(MigrateError::ScriptLoadFailed(
                "destination returned no script hash".to_string(),
            )),
        }
    }

    /// Send one command immediately and return its reply. Replies to
    /// earlier pipelined restores are accounted for on the way.
    async fn round_trip(&self, ctx: &mut WorkerContext, args: &[Bytes]) -> Result<Frame> {
        let endpoint = ctx.endpoint.as_mut().ok_or(EndpointError::Broken)?;
        let mut replies = match endpoint.send(args).await {
            Ok(replies) => replies,
            Err(e) => {
                self.discard(ctx).await;
                return Err(e.into());
            }
        };
        let own = replies.pop().ok_or(EndpointError::Closed)?;
        self.settle_earlier(ctx, replies);
        Ok(own)
    }

    /// Pipeline one restore. With flush-per-command its own reply decides
    /// the outcome; otherwise it is settled when a later flush reads it.
    async fn submit(
        &self,
        ctx: &mut WorkerContext,
        restore: PendingRestore,
        args: &[Bytes],
    ) -> Result<()> {
        let endpoint = ctx.endpoint.as_mut().ok_or(EndpointError::Broken)?;
        let mut replies = match endpoint.batch(self.policy.flush, args).await {
            Ok(replies) => replies,
            Err(e) => {
                self.discard(ctx).await;
                return Err(e.into());
            }
        };
        match replies.pop() {
            Some(own) => {
                self.settle_earlier(ctx, replies);
                self.settle_own(&restore, own)
            }
            None => {
                ctx.in_flight.push_back(restore);
                Ok(())
            }
        }
    }

    fn settle_own(&self, restore: &PendingRestore, reply: Frame) -> Result<()> {
        match reply.error_message() {
            Some(msg) => {
                self.forget_script_on_noscript(restore, &msg);
                Err(MigrateError::WriteFailed(msg))
            }
            None => {
                self.metrics.record_restored(restore.bytes);
                Ok(())
            }
        }
    }

    /// Replies to pipelined restores, oldest first.
    fn settle_earlier(&self, ctx: &mut WorkerContext, replies: Vec<Frame>) {
        for reply in replies {
            let Some(restore) = ctx.in_flight.pop_front() else {
                warn!(worker = ctx.id, "reply without a pending command");
                break;
            };
            if let Err(e) = self.settle_own(&restore, reply) {
                self.metrics.record_failure(FailureReason::Failed);
                error!(
                    worker = ctx.id,
                    key = %String::from_utf8_lossy(&restore.key),
                    reason = %e,
                    "failure[failed]"
                );
            }
        }
    }

    fn forget_script_on_noscript(&self, restore: &PendingRestore, msg: &str) {
        if let Some(sha) = &restore.script {
            if msg.starts_with(NOSCRIPT) {
                self.scripts.invalidate(sha);
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
