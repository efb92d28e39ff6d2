//! Migration orchestrator
//!
//! A fixed pool of worker tasks, each with its own bounded queue and its
//! own [`WorkerContext`]. The router reads [`MigrationEvent`]s and:
//!
//! - `ConnectionOpen`: asks every worker to connect and waits for all of
//!   them. A single failure aborts the migration.
//! - `KeyPayload`: hands the key to the next worker, round-robin.
//! - `StreamFlush` / `StreamClosed`: broadcast to every worker.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::dispatcher::Dispatcher;
use super::endpoint::{Connector, EndpointError};
use super::filter::EntryFilter;
use super::retry::{DeliveryPolicy, RetryEngine, ScriptCache, WorkerContext};
use super::{KeyPayload, MigrateError, MigrationEvent, Result};
use crate::dump::ValueEncoder;
use crate::rdb::{RdbError, SnapshotReader};
use ferrite_rmt_core::config::{Config, MigrateConfig};
use ferrite_rmt_core::{MigrationMetrics, MigrationSummary};

enum WorkerMessage {
    Open(oneshot::Sender<std::result::Result<(), EndpointError>>),
    Key(KeyPayload),
    Flush,
    Close,
}

/// Drives the worker pool for one snapshot stream.
pub struct Orchestrator {
    connector: Arc<dyn Connector>,
    metrics: Arc<MigrationMetrics>,
    scripts: Arc<ScriptCache>,
    policy: DeliveryPolicy,
    threads: usize,
    queue_capacity: usize,
}

impl Orchestrator {
    /// Pool sized and configured by `config`, reporting into `metrics`
    pub fn new(
        connector: Arc<dyn Connector>,
        metrics: Arc<MigrationMetrics>,
        config: &MigrateConfig,
    ) -> Self {
        Self {
            connector,
            metrics,
            scripts: Arc::new(ScriptCache::new()),
            policy: DeliveryPolicy::from_config(config),
            threads: config.threads.max(1),
            queue_capacity: config.queue_capacity.max(1),
        }
    }

    /// Consume events until the sender side closes, then shut the pool
    /// down and return the final counters.
    pub async fn run(self, mut events: mpsc::Receiver<MigrationEvent>) -> Result<MigrationSummary> {
        let engine = Arc::new(RetryEngine::new(
            self.connector.clone(),
            self.scripts.clone(),
            self.metrics.clone(),
            self.policy,
        ));

        let mut workers = Vec::with_capacity(self.threads);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.threads);
        for id in 0..self.threads {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            handles.push(tokio::spawn(worker(id, engine.clone(), rx)));
            workers.push(tx);
        }
        debug!(threads = self.threads, "worker pool started");

        let routed = self.route(&mut events, &workers).await;

        // unblock the producer, then let every worker drain, flush and close
        drop(events);
        drop(workers);
        let mut fault = None;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker terminated abnormally");
                fault.get_or_insert(MigrateError::InternalFault(format!("worker failed: {}", e)));
            }
        }

        routed?;
        if let Some(fault) = fault {
            return Err(fault);
        }
        Ok(self.metrics.snapshot())
    }

    async fn route(
        &self,
        events: &mut mpsc::Receiver<MigrationEvent>,
        workers: &[mpsc::Sender<WorkerMessage>],
    ) -> Result<()> {
        let mut next = 0usize;
        while let Some(event) = events.recv().await {
            match event {
                MigrationEvent::ConnectionOpen => self.open_all(workers).await?,
                MigrationEvent::KeyPayload(item) => {
                    let worker = &workers[next % workers.len()];
                    next = next.wrapping_add(1);
                    worker
                        .send(WorkerMessage::Key(item))
                        .await
                        .map_err(|_| worker_gone())?;
                }
                MigrationEvent::StreamFlush => broadcast(workers, || WorkerMessage::Flush).await?,
                MigrationEvent::StreamClosed => broadcast(workers, || WorkerMessage::Close).await?,
            }
        }
        Ok(())
    }

    async fn open_all(&self, workers: &[mpsc::Sender<WorkerMessage>]) -> Result<()> {
        let mut acks = Vec::with_capacity(workers.len());
        for worker in workers {
            let (ack, done) = oneshot::channel();
            worker
                .send(WorkerMessage::Open(ack))
                .await
                .map_err(|_| worker_gone())?;
            acks.push(done);
        }

        let mut first_failure = None;
        for done in acks {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    first_failure.get_or_insert(MigrateError::ConnectFailed {
                        addr: self.connector.addr(),
                        source,
                    });
                }
                Err(_) => {
                    first_failure.get_or_insert_with(worker_gone);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => {
                info!(
                    addr = %self.connector.addr(),
                    connections = workers.len(),
                    "connected to destination"
                );
                Ok(())
            }
        }
    }
}

async fn broadcast<F>(workers: &[mpsc::Sender<WorkerMessage>], message: F) -> Result<()>
where
    F: Fn() -> WorkerMessage,
{
    for worker in workers {
        worker.send(message()).await.map_err(|_| worker_gone())?;
    }
    Ok(())
}

fn worker_gone() -> MigrateError {
    MigrateError::InternalFault("worker exited unexpectedly".to_string())
}

async fn worker(id: usize, engine: Arc<RetryEngine>, mut inbox: mpsc::Receiver<WorkerMessage>) {
    let mut ctx = WorkerContext::new(id);
    while let Some(message) = inbox.recv().await {
        match message {
            WorkerMessage::Open(ack) => {
                let opened = engine.open(&mut ctx).await;
                if let Err(e) = &opened {
                    error!(worker = id, error = %e, "connect failed");
                }
                let _ = ack.send(opened);
            }
            WorkerMessage::Key(item) => engine.deliver(&mut ctx, &item).await,
            WorkerMessage::Flush => engine.flush(&mut ctx).await,
            WorkerMessage::Close => engine.close(&mut ctx).await,
        }
    }
    engine.close(&mut ctx).await;
    debug!(worker = id, "worker stopped");
}

/// Migrate the snapshot at `source` into the destination behind `connector`.
///
/// The snapshot is read on a blocking thread while the worker pool writes.
/// A destination failure is reported in preference to the reader error it
/// caused.
pub async fn migrate(
    config: &Config,
    source: impl AsRef<Path>,
    connector: Arc<dyn Connector>,
) -> Result<MigrationSummary> {
    config.validate()?;
    let filter = EntryFilter::from_config(&config.filter)?;
    let metrics = Arc::new(MigrationMetrics::new());
    let (events, inbox) = mpsc::channel(config.migrate.queue_capacity.max(1));

    let path = source.as_ref().to_path_buf();
    let target = config.dump.rdb_version;
    let buffer_size = config.dump.buffer_size;
    let reader_metrics = metrics.clone();
    let reader = tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = File::open(&path).map_err(RdbError::from)?;
        let mut snapshot = SnapshotReader::open(BufReader::with_capacity(buffer_size, file))?;
        info!(
            path = %path.display(),
            version = snapshot.version(),
            target = ?target,
            "reading snapshot"
        );
        let encoder = ValueEncoder::new(snapshot.version(), target);
        Dispatcher::new(encoder, filter, reader_metrics, events).run(&mut snapshot)
    });

    let outcome = Orchestrator::new(connector, metrics, &config.migrate)
        .run(inbox)
        .await;
    let read = reader.await;

    let summary = outcome?;
    match read {
        Ok(Ok(dispatched)) => {
            info!(dispatched, restored = summary.restored, "migration finished");
            Ok(summary)
        }
        Ok(Err(e)) => {
            error!(
                restored = summary.restored,
                failed = summary.failed,
                "migration stopped early"
            );
            Err(e)
        }
        Err(e) => Err(MigrateError::InternalFault(format!(
            "snapshot reader failed: {}",
            e
        ))),
    }
}
