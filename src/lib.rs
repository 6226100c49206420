//! # quorum-io
//! Multi-threaded TCP transport for replicated state machines, built directly
//! on [`mio`] without an async runtime.
//!
//! Peers exchange opaque, length-prefixed messages. One acceptor thread
//! spreads inbound connections across N reader loops; N writer loops own the
//! outbound connections, and every message for a given group goes through the
//! same writer so per-group send order survives.
//!
//! ## Architecture Overview
//! ```text
//!                      ┌──────────────────────── NetworkEngine ────────────────────────┐
//!  peers ──connect──▶  │ Acceptor ──round-robin──▶ ReaderWorker[0..N] ──┐              │
//!                      │                                                ├─▶ MessageHandler
//!  add_message(g, ..)─▶│ writers[g % N] ──▶ WriterWorker ──▶ ClientConnectionManager    │
//!                      │                       │   (replies read on the same loop) ─┘   │
//!                      └───────────────────────┼───────────────────────────────────────┘
//!                                              ▼
//!                                            peers
//! ```
//!
//! ## Wire format
//! Each message is a 4-byte big-endian length, counting itself, followed by
//! the payload. See [`net::codec`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quorum_io::{NetworkEngine, TransportConfig};
//!
//! fn main() -> quorum_io::Result<()> {
//!     let mut engine = NetworkEngine::new(TransportConfig::default(), |payload: &[u8]| {
//!         println!("received {} bytes", payload.len());
//!     });
//!     engine.init("127.0.0.1", 11111, 2)?;
//!     engine.start()?;
//!
//!     // messages for group 3 always leave through writer 3 % 2
//!     engine.add_message(3, "127.0.0.1", 11112, b"prepare".to_vec())?;
//!
//!     engine.stop();
//!     Ok(())
//! }
//! ```
//!
//! - [`NetworkEngine`]: wires and drives everything below
//! - [`event_loop`]: the single-threaded readiness loop and its handle
//! - [`worker`]: threads running one loop each
//! - [`net`]: acceptor, outbound connection manager, connections and framing
//! - [`signals`]: process-wide signal dispositions set by [`NetworkEngine::new`]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info};

pub mod buffer;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod net;
pub mod poll;
pub mod signals;
pub mod worker;

pub use buffer::BufferPool;
pub use config::{TransportConfig, TransportConfigBuilder};
pub use error::{NetworkError, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use handler::MessageHandler;
pub use net::acceptor::Acceptor;
pub use net::client::{ClientConnectionManager, ClientSender};
pub use net::codec::{FrameDecoder, FrameError};
pub use worker::{ReaderWorker, WriterWorker};

/// Owns the acceptor and equal-sized pools of reader and writer workers.
///
/// Lifecycle is `new` → [`init`](Self::init) → [`start`](Self::start) →
/// [`stop`](Self::stop). A stopped engine cannot be started again.
///
/// ## Example
///
/// ```rust,no_run
/// use quorum_io::{NetworkEngine, TransportConfig};
///
/// let config = TransportConfig::builder().max_frame_len(1 << 20).build()?;
/// let mut engine = NetworkEngine::new(config, |_: &[u8]| {});
/// engine.init("0.0.0.0", 0, 4)?;
/// println!("listening on {:?}", engine.local_addr());
/// assert_eq!(engine.writer_index(7), Some(3));
/// # Ok::<(), quorum_io::NetworkError>(())
/// ```
pub struct NetworkEngine {
    config: TransportConfig,
    handler: Arc<dyn MessageHandler>,
    buffers: BufferPool,
    acceptor: Acceptor,
    readers: Vec<ReaderWorker>,
    writers: Vec<WriterWorker>,
    initialized: bool,
    started: bool,
    stopped: bool,
}

impl NetworkEngine {
    /// Creates an engine delivering every inbound payload to `handler`.
    ///
    /// Side effect: sets SIGPIPE, SIGALRM and SIGCHLD to ignored for the whole
    /// process, once, via [`signals::ignore_disruptive_signals`].
    pub fn new<H: MessageHandler>(config: TransportConfig, handler: H) -> Self {
        signals::ignore_disruptive_signals();
        let buffers = BufferPool::new(config.buffer_pool_size, config.read_chunk_size);
        let acceptor = Acceptor::new(config.listen_backlog, config.poll_timeout);
        Self {
            config,
            handler: Arc::new(handler),
            buffers,
            acceptor,
            readers: Vec::new(),
            writers: Vec::new(),
            initialized: false,
            started: false,
            stopped: false,
        }
    }

    /// Builds `io_thread_count` readers and writers, listens on
    /// `listen_ip:listen_port` and initializes every loop.
    ///
    /// Returns the first failure. Nothing is started yet.
    pub fn init(
        &mut self,
        listen_ip: &str,
        listen_port: u16,
        io_thread_count: usize,
    ) -> Result<()> {
        if self.stopped {
            return Err(NetworkError::EventLoopGone);
        }
        if self.initialized || !self.readers.is_empty() {
            return Err(NetworkError::Configuration(
                "network engine already initialized".to_string(),
            ));
        }
        self.config.validate()?;
        if io_thread_count == 0 {
            return Err(NetworkError::Configuration(
                "io_thread_count must be at least 1".to_string(),
            ));
        }
        let ip: IpAddr = listen_ip
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(listen_ip.to_string()))?;

        for id in 0..io_thread_count {
            let reader = ReaderWorker::new(
                id,
                Arc::clone(&self.handler),
                self.buffers.clone(),
                self.config.clone(),
            );
            self.acceptor.add_event_loop(reader.loop_handle().clone());
            self.readers.push(reader);

            self.writers.push(WriterWorker::new(
                id,
                Arc::clone(&self.handler),
                self.buffers.clone(),
                self.config.clone(),
            ));
        }

        self.acceptor.listen(SocketAddr::new(ip, listen_port))?;

        for reader in &mut self.readers {
            reader.init()?;
        }
        for writer in &mut self.writers {
            writer.init()?;
        }

        self.initialized = true;
        info!(
            "network engine initialized: {} readers, {} writers, listening on {:?}",
            self.readers.len(),
            self.writers.len(),
            self.acceptor.local_addr()
        );
        Ok(())
    }

    /// Starts the acceptor, then every writer, then every reader.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(NetworkError::EventLoopGone);
        }
        if !self.initialized {
            return Err(NetworkError::NotInitialized);
        }
        if self.started {
            return Ok(());
        }
        // set first so a partial start is still torn down by stop()
        self.started = true;

        self.acceptor.start()?;
        for writer in &mut self.writers {
            writer.start()?;
        }
        for reader in &mut self.readers {
            reader.start()?;
        }
        info!("network engine started");
        Ok(())
    }

    /// Stops the acceptor, then every reader, then every writer, joining each
    /// thread. Queued outbound messages are dropped.
    ///
    /// Idempotent. An engine stopped before `start` has no threads to join but
    /// is still terminal.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.acceptor.stop();
        for reader in &mut self.readers {
            reader.stop();
        }
        for writer in &mut self.writers {
            writer.stop();
        }
        if self.started {
            info!("network engine stopped");
        }
    }

    /// Queues `payload` for `ip:port` on writer `group_index % writer_count`.
    ///
    /// Returns once the message is queued; delivery is at-most-once.
    pub fn add_message(
        &self,
        group_index: usize,
        ip: &str,
        port: u16,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.initialized {
            return Err(NetworkError::NotInitialized);
        }
        let index = self
            .writer_index(group_index)
            .ok_or(NetworkError::NotInitialized)?;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(ip.to_string()))?;
        let addr = SocketAddr::new(ip, port);
        debug!("group {} -> writer {} -> {}", group_index, index, addr);
        self.writers[index].add_message(addr, payload)
    }

    /// The writer serving `group_index`, or `None` before `init`.
    pub fn writer_index(&self, group_index: usize) -> Option<usize> {
        if self.writers.is_empty() {
            return None;
        }
        Some(group_index % self.writers.len())
    }

    /// The bound listening address, available after a successful `init`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn reader_handles(&self) -> Vec<LoopHandle> {
        self.readers.iter().map(|r| r.loop_handle().clone()).collect()
    }

    pub fn writer_handles(&self) -> Vec<LoopHandle> {
        self.writers.iter().map(|w| w.loop_handle().clone()).collect()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started && !self.stopped
    }
}

impl Drop for NetworkEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> NetworkEngine {
        let config = TransportConfig::builder()
            .buffer_capacity(64)
            .poll_timeout(Some(std::time::Duration::from_millis(50)))
            .build()
            .unwrap();
        NetworkEngine::new(config, |_: &[u8]| {})
    }

    #[test]
    fn test_new_ignores_signals() {
        let _engine = engine();
        assert!(signals::signals_ignored());
    }

    #[test]
    fn test_operations_before_init() {
        let mut engine = engine();
        assert_eq!(engine.writer_index(3), None);
        assert!(engine.local_addr().is_none());
        assert!(matches!(engine.start(), Err(NetworkError::NotInitialized)));
        assert!(matches!(
            engine.add_message(0, "127.0.0.1", 9, b"x".to_vec()),
            Err(NetworkError::NotInitialized)
        ));
        engine.stop();
    }

    #[test]
    fn test_init_rejects_bad_arguments() {
        let mut engine = engine();
        assert!(matches!(
            engine.init("127.0.0.1", 0, 0),
            Err(NetworkError::Configuration(_))
        ));
        assert!(matches!(
            engine.init("not-an-ip", 0, 1),
            Err(NetworkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_init_twice_fails() {
        let mut engine = engine();
        engine.init("127.0.0.1", 0, 1).unwrap();
        assert!(matches!(
            engine.init("127.0.0.1", 0, 1),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn test_add_message_validates_input() {
        let mut engine = engine();
        engine.init("127.0.0.1", 0, 2).unwrap();
        assert!(matches!(
            engine.add_message(0, "peer.local", 9, b"x".to_vec()),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            engine.add_message(0, "127.0.0.1", 9, Vec::new()),
            Err(NetworkError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_stop_before_start_is_terminal() {
        let mut engine = engine();
        engine.init("127.0.0.1", 0, 2).unwrap();
        engine.stop();
        assert!(!engine.is_started());
        assert!(engine
            .reader_handles()
            .iter()
            .chain(engine.writer_handles().iter())
            .all(|h| h.is_stopped()));
        assert!(matches!(engine.start(), Err(NetworkError::EventLoopGone)));
        assert!(matches!(
            engine.add_message(1, "127.0.0.1", 9, b"x".to_vec()),
            Err(NetworkError::EventLoopGone)
        ));
        engine.stop();
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut engine = engine();
        engine.init("127.0.0.1", 0, 1).unwrap();
        engine.start().unwrap();
        assert!(engine.is_started());
        engine.stop();
        assert!(!engine.is_started());
        assert!(matches!(engine.start(), Err(NetworkError::EventLoopGone)));
        assert!(matches!(
            engine.add_message(0, "127.0.0.1", 9, b"x".to_vec()),
            Err(NetworkError::EventLoopGone)
        ));
    }
}
