//! Scripted in-memory destination for pipeline tests

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::endpoint::{Connector, Endpoint, EndpointError, Result};
use ferrite_rmt_core::protocol::Frame;

/// What the fake destination does with one command
pub(crate) enum MockReply {
    Frame(Frame),
    /// Drop the connection instead of answering
    Hangup,
}

type Responder = dyn Fn(usize, &[Bytes]) -> MockReply + Send + Sync;

/// Shared record of everything the fake destination saw.
pub(crate) struct MockState {
    commands: Mutex<Vec<Vec<Bytes>>>,
    connects: AtomicUsize,
    refuse_connects: AtomicUsize,
    responder: Box<Responder>,
}

impl MockState {
    /// Commands received, rendered as strings
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .iter()
            .map(|cmd| {
                cmd.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect()
            })
            .collect()
    }

    /// Command names only
    pub(crate) fn names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|cmd| cmd.into_iter().next().unwrap_or_default())
            .collect()
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connection attempts
    pub(crate) fn refuse_connects(&self, n: usize) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }
}

pub(crate) struct MockConnector {
    state: Arc<MockState>,
    batch_size: usize,
}

impl MockConnector {
    /// Destination answering every command through `responder`, which also
    /// receives the zero-based index of the command across all connections.
    pub(crate) fn new<F>(batch_size: usize, responder: F) -> (Arc<Self>, Arc<MockState>)
    where
        F: Fn(usize, &[Bytes]) -> MockReply + Send + Sync + 'static,
    {
        let state = Arc::new(MockState {
            commands: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            refuse_connects: AtomicUsize::new(0),
            responder: Box::new(responder),
        });
        let connector = Arc::new(Self {
            state: state.clone(),
            batch_size,
        });
        (connector, state)
    }

    /// Destination that accepts everything, answering `SCRIPT LOAD` with a
    /// fixed hash and everything else with `+OK`
    pub(crate) fn accepting(batch_size: usize) -> (Arc<Self>, Arc<MockState>) {
        Self::new(batch_size, |_, args| {
            if args[0].as_ref() == b"SCRIPT" {
                MockReply::Frame(Frame::bulk("deadbeef"))
            } else {
                MockReply::Frame(Frame::simple("OK"))
            }
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Endpoint>> {
        let refused = self
            .state
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(EndpointError::Closed);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEndpoint {
            state: self.state.clone(),
            buffered: Vec::new(),
            batch_size: self.batch_size,
            broken: false,
        }))
    }

    fn addr(&self) -> String {
        "mock:6379".to_string()
    }
}

struct MockEndpoint {
    state: Arc<MockState>,
    buffered: Vec<Vec<Bytes>>,
    batch_size: usize,
    broken: bool,
}

impl MockEndpoint {
    fn flush_buffered(&mut self) -> Result<Vec<Frame>> {
        let mut replies = Vec::with_capacity(self.buffered.len());
        for cmd in std::mem::take(&mut self.buffered) {
            let index = {
                let mut commands = self.state.commands.lock();
                commands.push(cmd.clone());
                commands.len() - 1
            };
            match (self.state.responder)(index, &cmd) {
                MockReply::Frame(frame) => replies.push(frame),
                MockReply::Hangup => {
                    self.broken = true;
                    return Err(EndpointError::Closed);
                }
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn batch(&mut self, flush_now: bool, args: &[Bytes]) -> Result<Vec<Frame>> {
        if self.broken {
            return Err(EndpointError::Broken);
        }
        self.buffered.push(args.to_vec());
        if flush_now || self.buffered.len() >= self.batch_size {
            self.flush_buffered()
        } else {
            Ok(Vec::new())
        }
    }

    async fn flush(&mut self) -> Result<Vec<Frame>> {
        if self.broken {
            return Ok(Vec::new());
        }
        self.flush_buffered()
    }

    async fn close(&mut self) {
        self.broken = true;
        self.buffered.clear();
    }

    fn pending(&self) -> usize {
        self.buffered.len()
    }
}
