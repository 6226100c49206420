//! Single-threaded readiness loop.
//!
//! One [`EventLoop`] runs on exactly one worker thread and owns every
//! [`Connection`] registered with it. Other threads only ever touch its
//! [`LoopHandle`]: they push work into channels and fire the waker.
//!
//! ```text
//!   acceptor thread ──adopt()──┐         caller threads ──add_message()──┐
//!                              ▼                                         ▼
//!                   LoopHandle.incoming_tx                      ClientSender.pending
//!                              │            Waker                        │
//!                              └──────────────┬──────────────────────────┘
//!                                             ▼
//!   ┌──────────────────────── EventLoop::run (worker thread) ────────────────┐
//!   │ poll() ─▶ readable ─▶ ConnectionTable::read_ready ─▶ MessageHandler    │
//!   │        └▶ writable ─▶ WriteReadyHandler (write-role loops only)        │
//!   │ after each wait: adopt incoming sockets, WriteReadyHandler::on_wake    │
//!   └────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use mio::net::TcpStream;
use mio::{Registry, Token, Waker};

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::handler::MessageHandler;
use crate::net::connection::{Connection, ConnectionState, ReadOutcome};
use crate::poll::{PollHandle, FIRST_CONNECTION_TOKEN, WAKER_TOKEN};

struct LoopShared {
    name: String,
    stopped: AtomicBool,
    waker: OnceLock<Waker>,
    incoming_tx: Sender<(TcpStream, SocketAddr)>,
    incoming_rx: Receiver<(TcpStream, SocketAddr)>,
    active: AtomicUsize,
}

/// Thread-safe handle to an [`EventLoop`].
///
/// Exists before the loop is initialized, so it can be handed to the acceptor
/// or a connection manager during wiring. Wakes are no-ops until `init` has
/// installed the waker; queued work is picked up on the first iteration.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn new(name: impl Into<String>) -> Self {
        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(LoopShared {
                name: name.into(),
                stopped: AtomicBool::new(false),
                waker: OnceLock::new(),
                incoming_tx,
                incoming_rx,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True once the loop's poll handle and waker exist.
    pub fn is_initialized(&self) -> bool {
        self.shared.waker.get().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Connections currently registered with the loop.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Asks the loop to exit after its current iteration. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.wake() {
                warn!("{}: failed to wake for shutdown: {}", self.name(), e);
            }
        }
    }

    pub(crate) fn wake(&self) -> Result<()> {
        if let Some(waker) = self.shared.waker.get() {
            waker.wake()?;
        }
        Ok(())
    }

    /// Hands an accepted socket to this loop.
    pub(crate) fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.is_stopped() {
            return Err(NetworkError::EventLoopGone);
        }
        self.shared
            .incoming_tx
            .send((stream, peer))
            .map_err(|_| NetworkError::EventLoopGone)?;
        self.wake()
    }

    fn waker_slot(&self) -> &OnceLock<Waker> {
        &self.shared.waker
    }

    #[cfg(test)]
    pub(crate) fn take_incoming(&self) -> Option<(TcpStream, SocketAddr)> {
        self.shared.incoming_rx.try_recv().ok()
    }
}

/// Write-side capability plugged into a write-role loop at construction.
///
/// Both callbacks run on the loop thread with exclusive access to its connections.
pub trait WriteReadyHandler: Send {
    /// Called after every readiness wait, including pure waker wakeups.
    fn on_wake(&mut self, table: &mut ConnectionTable);

    /// Called when `token` reports writable (or errored) readiness.
    fn on_write_ready(&mut self, token: Token, table: &mut ConnectionTable);
}

/// The connections owned by one loop, keyed by their poll token.
pub struct ConnectionTable {
    registry: Registry,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    handler: Arc<dyn MessageHandler>,
    buffers: BufferPool,
    config: TransportConfig,
    shared: Arc<LoopShared>,
}

impl ConnectionTable {
    fn new(
        registry: Registry,
        handler: Arc<dyn MessageHandler>,
        buffers: BufferPool,
        config: TransportConfig,
        shared: Arc<LoopShared>,
    ) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            handler,
            buffers,
            config,
            shared,
        }
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(&token)
    }

    /// Registers an accepted socket for reading.
    pub(crate) fn adopt_inbound(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Token> {
        let token = self.allocate_token();
        self.insert(Connection::inbound(stream, token, peer, &self.config))
    }

    /// Registers a socket whose connect is in flight for reading and writing.
    pub(crate) fn open_outbound(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Token> {
        let token = self.allocate_token();
        self.insert(Connection::outbound(stream, token, peer, &self.config))
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn insert(&mut self, mut conn: Connection) -> Result<Token> {
        conn.register(&self.registry)?;
        let token = conn.token();
        debug!(
            "{}: registered {:?} connection {} as {:?}",
            self.shared.name,
            conn.direction(),
            conn.peer(),
            token
        );
        self.connections.insert(token, conn);
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        Ok(token)
    }

    /// Reads everything available on `token` and delivers complete frames.
    ///
    /// Any read or framing failure tears down this connection only.
    pub(crate) fn read_ready(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.state() != ConnectionState::Established {
            return;
        }

        let mut scratch = self.buffers.acquire();
        let handler = &self.handler;
        let outcome = conn.read_frames(&mut scratch, |payload| handler.on_message(payload));
        drop(scratch);

        match outcome {
            Ok(ReadOutcome::Open) => {}
            Ok(ReadOutcome::PeerClosed) => self.close(token, "peer closed connection"),
            Err(e) => {
                warn!("{}: read failed on {:?}: {}", self.shared.name, token, e);
                self.close(token, &e.to_string());
            }
        }
    }

    /// Tears down `token`, silently dropping whatever it still had queued.
    pub fn close(&mut self, token: Token, reason: &str) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let dropped = conn.close(&self.registry);
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            if dropped > 0 {
                warn!(
                    "{}: closed {} ({}), dropped {} queued messages",
                    self.shared.name,
                    conn.peer(),
                    reason,
                    dropped
                );
            } else {
                debug!("{}: closed {} ({})", self.shared.name, conn.peer(), reason);
            }
        }
    }

    fn close_all(&mut self, reason: &str) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, reason);
        }
    }
}

struct LoopState {
    poll: PollHandle,
    table: ConnectionTable,
}

/// A readiness-driven I/O loop bound to one thread.
///
/// Read-role loops are built without a [`WriteReadyHandler`] and only read.
/// Write-role loops get the connection manager at construction and forward
/// writable events to it.
pub struct EventLoop {
    handle: LoopHandle,
    handler: Arc<dyn MessageHandler>,
    buffers: BufferPool,
    config: TransportConfig,
    write_ready: Option<Box<dyn WriteReadyHandler>>,
    state: Option<LoopState>,
}

impl EventLoop {
    pub fn new(
        handle: LoopHandle,
        handler: Arc<dyn MessageHandler>,
        buffers: BufferPool,
        config: TransportConfig,
        write_ready: Option<Box<dyn WriteReadyHandler>>,
    ) -> Self {
        Self {
            handle,
            handler,
            buffers,
            config,
            write_ready,
            state: None,
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Creates the poll handle, waker and event buffer of `buffer_capacity` events.
    pub fn init(&mut self, buffer_capacity: usize) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let poll = PollHandle::new(buffer_capacity, self.handle.waker_slot())?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(NetworkError::PollInit)?;
        let table = ConnectionTable::new(
            registry,
            Arc::clone(&self.handler),
            self.buffers.clone(),
            self.config.clone(),
            Arc::clone(&self.handle.shared),
        );
        self.state = Some(LoopState { poll, table });
        debug!(
            "{}: initialized with capacity {}",
            self.handle.name(),
            buffer_capacity
        );
        Ok(())
    }

    /// Runs until [`LoopHandle::stop`] is called. Every connection still open
    /// when the loop exits is closed and its queue dropped.
    pub fn run(&mut self) -> Result<()> {
        let state = self.state.as_mut().ok_or(NetworkError::NotInitialized)?;
        let name = self.handle.name().to_string();
        let timeout = self.config.poll_timeout;
        info!("{}: event loop running", name);

        let mut result = Ok(());
        while !self.handle.is_stopped() {
            if let Err(e) = state.poll.poll(timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("{}: poll failed: {}", name, e);
                result = Err(NetworkError::Io(e));
                break;
            }

            for event in state.poll.events().iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some(write_ready) = self.write_ready.as_mut() {
                    if event.is_writable() || event.is_error() {
                        write_ready.on_write_ready(token, &mut state.table);
                    }
                }
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    state.table.read_ready(token);
                }
            }

            while let Ok((stream, peer)) = self.handle.shared.incoming_rx.try_recv() {
                if let Err(e) = state.table.adopt_inbound(stream, peer) {
                    warn!("{}: failed to register {}: {}", name, peer, e);
                }
            }

            if let Some(write_ready) = self.write_ready.as_mut() {
                write_ready.on_wake(&mut state.table);
            }
        }

        // Mark stopped so late adopt/add_message calls fail fast instead of queueing.
        self.handle.shared.stopped.store(true, Ordering::Release);
        state.table.close_all("event loop stopped");
        info!("{}: event loop exited", name);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::encode_frame;
    use std::io::Write;
    use std::net::TcpListener as StdListener;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn reader_loop(
        name: &str,
        config: TransportConfig,
    ) -> (EventLoop, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn MessageHandler> =
            Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec()));
        let event_loop = EventLoop::new(
            LoopHandle::new(name),
            handler,
            BufferPool::new(2, 64),
            config,
            None,
        );
        (event_loop, seen)
    }

    /// Returns (accepted mio stream for the loop, peer address, client side).
    fn accepted_pair(listener: &StdListener) -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    #[test]
    fn test_run_requires_init() {
        let (mut event_loop, _) = reader_loop("uninit", TransportConfig::default());
        assert!(matches!(event_loop.run(), Err(NetworkError::NotInitialized)));
    }

    #[test]
    fn test_stop_wakes_blocked_loop() {
        let config = TransportConfig::builder().poll_timeout(None).build().unwrap();
        let (mut event_loop, _) = reader_loop("stop-wake", config);
        event_loop.init(64).unwrap();
        let handle = event_loop.handle().clone();
        assert!(handle.is_initialized());

        let runner = thread::spawn(move || event_loop.run());
        thread::sleep(Duration::from_millis(50));
        handle.stop();
        handle.stop();
        runner.join().unwrap().unwrap();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_adopted_connection_delivers_frames() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let (mut event_loop, seen) = reader_loop("adopt", TransportConfig::default());
        event_loop.init(64).unwrap();
        let handle = event_loop.handle().clone();
        let runner = thread::spawn(move || event_loop.run());

        let (stream, peer, mut client) = accepted_pair(&listener);
        handle.adopt(stream, peer).unwrap();
        assert!(wait_for(|| handle.active_connections() == 1));

        client.write_all(&encode_frame(b"hello")).unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        assert_eq!(seen.lock().unwrap()[0], b"hello".to_vec());

        drop(client);
        assert!(wait_for(|| handle.active_connections() == 0));

        handle.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_bad_frame_closes_only_that_connection() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig::builder()
            .max_frame_len(32)
            .max_queued_bytes(1024)
            .build()
            .unwrap();
        let (mut event_loop, seen) = reader_loop("isolation", config);
        event_loop.init(64).unwrap();
        let handle = event_loop.handle().clone();
        let runner = thread::spawn(move || event_loop.run());

        let (healthy, healthy_peer, mut healthy_client) = accepted_pair(&listener);
        let (corrupt, corrupt_peer, mut corrupt_client) = accepted_pair(&listener);
        handle.adopt(healthy, healthy_peer).unwrap();
        handle.adopt(corrupt, corrupt_peer).unwrap();
        assert!(wait_for(|| handle.active_connections() == 2));

        corrupt_client.write_all(&(4096u32).to_be_bytes()).unwrap();
        assert!(wait_for(|| handle.active_connections() == 1));

        healthy_client.write_all(&encode_frame(b"still here")).unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        assert_eq!(seen.lock().unwrap()[0], b"still here".to_vec());

        handle.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_adopt_after_stop_fails() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let handle = LoopHandle::new("gone");
        handle.stop();
        let (stream, peer, _client) = accepted_pair(&listener);
        assert!(matches!(
            handle.adopt(stream, peer),
            Err(NetworkError::EventLoopGone)
        ));
    }
}
