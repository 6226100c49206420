//! Error types for the transport layer.

use std::{io, net::SocketAddr};
use thiserror::Error;

use crate::net::codec::FrameError;

/// Errors surfaced by the transport.
///
/// Setup failures ([`PollInit`](NetworkError::PollInit), [`Bind`](NetworkError::Bind),
/// [`Listen`](NetworkError::Listen), [`Spawn`](NetworkError::Spawn),
/// [`Configuration`](NetworkError::Configuration)) are fatal to `init`/`start` and
/// never retried. Everything else is local to one connection and is normally
/// logged on the loop thread rather than returned to a caller.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The OS polling handle or its waker could not be created.
    #[error("failed to create poll handle: {0}")]
    PollInit(#[source] io::Error),

    /// The listening socket could not be created or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The bound socket could not be put into listening mode.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An outbound connect failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The peer sent a frame with a malformed or oversized length prefix.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A destination host could not be parsed as an IP address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The payload cannot be framed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A per-connection outbound queue limit was hit.
    #[error("outbound queue full for {addr}: {reason}")]
    QueueFull { addr: SocketAddr, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The operation needs an initialized event loop or engine.
    #[error("not initialized")]
    NotInitialized,

    /// The target event loop has been stopped.
    #[error("event loop is gone")]
    EventLoopGone,
}

impl NetworkError {
    /// Numeric error code for callers that speak integer status codes.
    ///
    /// `0` is reserved for success and never returned.
    pub fn code(&self) -> i32 {
        match self {
            NetworkError::PollInit(_) => -1,
            NetworkError::Bind { .. } => -2,
            NetworkError::Listen { .. } => -3,
            NetworkError::Spawn { .. } => -4,
            NetworkError::Configuration(_) => -5,
            NetworkError::NotInitialized => -6,
            NetworkError::Connect { .. } => -10,
            NetworkError::Frame(_) => -11,
            NetworkError::Io(_) => -12,
            NetworkError::InvalidAddress(_) => -20,
            NetworkError::InvalidPayload(_) => -21,
            NetworkError::QueueFull { .. } => -22,
            NetworkError::EventLoopGone => -23,
        }
    }

    /// True for failures that abort engine setup.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            NetworkError::PollInit(_)
                | NetworkError::Bind { .. }
                | NetworkError::Listen { .. }
                | NetworkError::Spawn { .. }
                | NetworkError::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
