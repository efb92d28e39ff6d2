//! Migration pipeline
//!
//! ```text
//! SnapshotReader ──► Dispatcher ──► mpsc ──► Orchestrator ─┬─► worker 0 ──► Endpoint
//!   (blocking)       (encode)               (router)       ├─► worker 1 ──► Endpoint
//!                                                          └─► worker N ──► Endpoint
//! ```
//!
//! The dispatcher runs on a blocking thread and turns snapshot entries into
//! [`MigrationEvent`]s. The orchestrator fans them out to a fixed pool of
//! workers, each owning one destination connection, and every worker hands
//! its keys to the [`RetryEngine`](retry::RetryEngine).

pub mod dispatcher;
pub mod endpoint;
pub mod filter;
pub mod orchestrator;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;

use bytes::Bytes;

use crate::dump::{EncodeError, Payload};
use crate::rdb::RdbError;
use endpoint::EndpointError;
use ferrite_rmt_core::ConfigError;

pub use dispatcher::Dispatcher;
pub use endpoint::{Connector, DestinationAddr, Endpoint, TcpConnector};
pub use filter::EntryFilter;
pub use orchestrator::{migrate, Orchestrator};
pub use retry::{DeliveryPolicy, RetryEngine, ScriptCache, WorkerContext};

/// One unit flowing from the dispatcher to the workers, in stream order.
#[derive(Debug, Clone)]
pub enum MigrationEvent {
    /// The snapshot stream starts; every worker connects
    ConnectionOpen,
    /// One key ready to be written
    KeyPayload(KeyPayload),
    /// A checkpoint (database boundary); workers flush their pipelines
    StreamFlush,
    /// The snapshot stream ended; workers flush and disconnect
    StreamClosed,
}

/// A re-encoded key and where it goes.
#[derive(Debug, Clone)]
pub struct KeyPayload {
    /// Key bytes
    pub key: Bytes,
    /// Logical database
    pub db: u32,
    /// Absolute expiry, milliseconds since the Unix epoch
    pub expire_at_ms: Option<i64>,
    /// `RESTORE` payload
    pub payload: Payload,
}

/// Migration errors
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// No destination connection could be established at stream start
    #[error("failed to connect {addr}: {source}")]
    ConnectFailed {
        /// Destination address
        addr: String,
        /// Underlying connection error
        #[source]
        source: EndpointError,
    },

    /// The destination rejected a command
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The legacy restore script could not be loaded
    #[error("script load failed: {0}")]
    ScriptLoadFailed(String),

    /// Connection-level failure
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// A value could not be re-encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The snapshot could not be read
    #[error("snapshot error: {0}")]
    Rdb(#[from] RdbError),

    /// Invalid settings
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A failure nothing anticipates (worker panic and the like)
    #[error("internal fault: {0}")]
    InternalFault(String),

    /// The event pipeline shut down while events were still being produced
    #[error("event pipeline closed")]
    ChannelClosed,
}

impl MigrateError {
    /// Whether this stops the whole migration rather than a single key.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MigrateError::WriteFailed(_)
                | MigrateError::ScriptLoadFailed(_)
                | MigrateError::Endpoint(_)
        )
    }

    /// Unexpected faults the operator should report
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            MigrateError::InternalFault(_) | MigrateError::ChannelClosed
        )
    }
}

/// Result type for migration operations
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_fatal() {
        assert!(MigrateError::InternalFault("panic".into()).is_fatal());
        assert!(MigrateError::ConnectFailed {
            addr: "127.0.0.1:6379".into(),
            source: EndpointError::Closed,
        }
        .is_fatal());
        assert!(MigrateError::Rdb(RdbError::InvalidMagic).is_fatal());
        assert!(!MigrateError::WriteFailed("ERR".into()).is_fatal());
        assert!(!MigrateError::ScriptLoadFailed("no sha".into()).is_fatal());
        assert!(!MigrateError::Endpoint(EndpointError::Closed).is_fatal());
    }

    #[test]
    fn test_error_is_internal() {
        assert!(MigrateError::InternalFault("x".into()).is_internal());
        assert!(MigrateError::ChannelClosed.is_internal());
        assert!(!MigrateError::Rdb(RdbError::UnexpectedEof).is_internal());
    }

    #[test]
    fn test_connect_failed_display() {
        let err = MigrateError::ConnectFailed {
            addr: "10.0.0.1:6379".into(),
            source: EndpointError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "failed to connect 10.0.0.1:6379: connection closed by peer"
        );
    }
}
