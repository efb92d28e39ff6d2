//! Destination connections
//!
//! An [`Endpoint`] is one pipelined RESP connection. Commands are buffered
//! until a flush point; a flush writes everything and then reads one reply
//! per buffered command, oldest first. [`Connector`] opens endpoints to a
//! fixed destination so the retry engine can replace a broken one.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use ferrite_rmt_core::protocol::{encode_command, parse_frame, Frame, ParseError};

/// Default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// Default read/write buffer size (64 KB).
const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Connection-level errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Reply that is not valid RESP
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    /// Connect, write or reply took too long
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,
    /// An earlier operation failed; the connection must be replaced
    #[error("connection is broken")]
    Broken,
    /// Destination string that cannot be used
    #[error("invalid destination address: {0}")]
    InvalidAddress(String),
}

/// Result type for endpoint operations
pub type Result<T> = std::result::Result<T, EndpointError>;

/// A pipelined command connection to the destination.
#[async_trait]
pub trait Endpoint: Send {
    /// Buffer one command. When `flush_now` is set, or the pipeline reaches
    /// its batch size, everything buffered is flushed.
    ///
    /// Returns the replies to every command flushed during this call, in
    /// submission order; empty when the command was only buffered.
    async fn batch(&mut self, flush_now: bool, args: &[Bytes]) -> Result<Vec<Frame>>;

    /// Flush buffered commands and wait for their replies. A broken
    /// connection has nothing left to flush and returns no replies.
    async fn flush(&mut self) -> Result<Vec<Frame>>;

    /// Release the connection. Never fails.
    async fn close(&mut self);

    /// Commands buffered but not yet acknowledged
    fn pending(&self) -> usize;

    /// Flush buffered commands, then send one command and wait for it.
    /// The last reply belongs to `args`.
    async fn send(&mut self, args: &[Bytes]) -> Result<Vec<Frame>> {
        self.batch(true, args).await
    }
}

/// Opens endpoints to one destination.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh connection
    async fn connect(&self) -> Result<Box<dyn Endpoint>>;

    /// Destination, for diagnostics
    fn addr(&self) -> String;
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationAddr {
    /// Host name or IP literal, without brackets
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl DestinationAddr {
    /// Parse `redis://host:port`, `host:port`, `[v6]:port` or a bare host.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |why: &str| EndpointError::InvalidAddress(format!("{}: {}", input, why));

        if input.starts_with("rediss://") {
            return Err(invalid("TLS destinations are not supported"));
        }
        let rest = input.strip_prefix("redis://").unwrap_or(input);
        if rest.contains('@') {
            return Err(invalid("credentials in the address are not supported"));
        }
        let rest = match rest.split_once('/') {
            Some((authority, "")) => authority,
            Some(_) => return Err(invalid("database paths are not supported, use --db")),
            None => rest,
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("unexpected text after IPv6 literal")),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for DestinationAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Plain TCP endpoint with buffered RESP I/O.
pub struct TcpEndpoint {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pending: usize,
    batch_size: usize,
    timeout: Duration,
    broken: bool,
}

impl TcpEndpoint {
    /// Connect to `addr`, bounding the handshake by `timeout`.
    pub async fn connect(
        addr: &DestinationAddr,
        batch_size: usize,
        op_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(op_timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
            .await
            .map_err(|_| EndpointError::Timeout(op_timeout))??;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "connected to destination");

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            pending: 0,
            batch_size: batch_size.max(1),
            timeout: op_timeout,
            broken: false,
        })
    }

    async fn flush_pending(&mut self) -> Result<Vec<Frame>> {
        if self.pending == 0 {
            return Ok(Vec::new());
        }
        match self.exchange().await {
            Ok(replies) => Ok(replies),
            Err(e) => {
                self.broken = true;
                self.pending = 0;
                self.write_buf.clear();
                Err(e)
            }
        }
    }

    async fn exchange(&mut self) -> Result<Vec<Frame>> {
        let op_timeout = self.timeout;
        timeout(op_timeout, self.stream.write_all(&self.write_buf))
            .await
            .map_err(|_| EndpointError::Timeout(op_timeout))??;
        self.write_buf.clear();

        let expected = self.pending;
        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            replies.push(self.read_reply().await?);
        }
        self.pending = 0;
        trace!(replies = replies.len(), "pipeline flushed");
        Ok(replies)
    }

    async fn read_reply(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = parse_frame(&mut self.read_buf)? {
                return Ok(frame);
            }
            let n = timeout(self.timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| EndpointError::Timeout(self.timeout))??;
            if n == 0 {
                return Err(EndpointError::Closed);
            }
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn batch(&mut self, flush_now: bool, args: &[Bytes]) -> Result<Vec<Frame>> {
        if self.broken {
            return Err(EndpointError::Broken);
        }
        encode_command(args, &mut self.write_buf);
        self.pending += 1;
        if flush_now || self.pending >= self.batch_size {
            self.flush_pending().await
        } else {
            Ok(Vec::new())
        }
    }

    async fn flush(&mut self) -> Result<Vec<Frame>> {
        if self.broken {
            return Ok(Vec::new());
        }
        self.flush_pending().await
    }

    async fn close(&mut self) {
        if !self.broken {
            let _ = self.stream.shutdown().await;
        }
        self.broken = true;
        self.pending = 0;
        self.write_buf.clear();
    }

    fn pending(&self) -> usize {
        self.pending
    }
}

/// Opens [`TcpEndpoint`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: DestinationAddr,
    batch_size: usize,
    timeout: Duration,
}

impl TcpConnector {
    /// Connector for `addr` with the given pipeline size and timeout
    pub fn new(addr: DestinationAddr, batch_size: usize, timeout: Duration) -> Self {
        Self {
            addr,
            batch_size,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Endpoint>> {
        let endpoint = TcpEndpoint::connect(&self.addr, self.batch_size, self.timeout).await?;
        Ok(Box::new(endpoint))
    }

    fn addr(&self) -> String {
        self.addr.to_string()
    }
}
