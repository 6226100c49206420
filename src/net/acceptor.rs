//! Listening socket and round-robin distribution of accepted connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetworkError, Result};
use crate::event_loop::LoopHandle;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const ACCEPT_EVENTS_CAPACITY: usize = 128;

/// Deterministic round-robin over `len` targets, starting at index 0.
#[derive(Debug)]
pub(crate) struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub(crate) fn new(len: usize) -> Self {
        Self { next: 0, len }
    }

    pub(crate) fn next_index(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.len;
        index
    }
}

#[derive(Default)]
struct AcceptorShared {
    stopped: AtomicBool,
    waker: OnceLock<Waker>,
}

/// Accepts inbound connections on its own thread and hands each one to a
/// registered read-role loop.
///
/// Targets are visited in registration order, one connection each, so no
/// loop receives more than one connection above any other.
pub struct Acceptor {
    loops: Vec<LoopHandle>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    backlog: i32,
    poll_timeout: Option<Duration>,
    shared: Arc<AcceptorShared>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    pub fn new(backlog: i32, poll_timeout: Option<Duration>) -> Self {
        Self {
            loops: Vec::new(),
            listener: None,
            local_addr: None,
            backlog,
            poll_timeout,
            shared: Arc::new(AcceptorShared::default()),
            thread: None,
        }
    }

    /// Adds a read-role loop as a target. Must happen before [`start`](Self::start).
    pub fn add_event_loop(&mut self, handle: LoopHandle) {
        self.loops.push(handle);
    }

    pub fn event_loop_count(&self) -> usize {
        self.loops.len()
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds and listens on `addr`. Failures are not retryable on the same address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<()> {
        let bind_err = |source: io::Error| NetworkError::Bind { addr, source };
        let listen_err = |source: io::Error| NetworkError::Listen { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(self.backlog).map_err(listen_err)?;
        socket.set_nonblocking(true).map_err(listen_err)?;

        let listener: std::net::TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(listen_err)?;
        self.listener = Some(TcpListener::from_std(listener));
        self.local_addr = Some(local_addr);
        info!("acceptor listening on {}", local_addr);
        Ok(())
    }

    /// Spawns the accept thread. The listening socket moves into it.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(NetworkError::EventLoopGone);
        }
        if self.loops.is_empty() {
            return Err(NetworkError::Configuration(
                "acceptor has no event loops to hand connections to".to_string(),
            ));
        }
        let mut listener = self.listener.take().ok_or(NetworkError::NotInitialized)?;

        let poll = Poll::new().map_err(NetworkError::PollInit)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(NetworkError::PollInit)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(NetworkError::PollInit)?;
        let _ = self.shared.waker.set(waker);

        let accept_loop = AcceptLoop {
            poll,
            listener,
            loops: self.loops.clone(),
            next: RoundRobin::new(self.loops.len()),
            poll_timeout: self.poll_timeout,
            shared: Arc::clone(&self.shared),
        };

        let name = "quorum-acceptor".to_string();
        let thread = Builder::new()
            .name(name.clone())
            .spawn(move || accept_loop.run())
            .map_err(|source| NetworkError::Spawn { name, source })?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stops accepting, joins the accept thread and releases the listening socket.
    ///
    /// Connections already handed out stay with their loops. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(waker) = self.shared.waker.get() {
            if let Err(e) = waker.wake() {
                warn!("failed to wake acceptor: {}", e);
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("acceptor thread panicked");
            }
            info!("acceptor stopped");
        }
        self.listener = None;
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop {
    poll: Poll,
    listener: TcpListener,
    loops: Vec<LoopHandle>,
    next: RoundRobin,
    poll_timeout: Option<Duration>,
    shared: Arc<AcceptorShared>,
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(ACCEPT_EVENTS_CAPACITY);

        while !self.shared.stopped.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, self.poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("acceptor poll failed: {}", e);
                break;
            }

            if events.iter().any(|event| event.token() == LISTENER_TOKEN) {
                self.accept_pending();
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let index = self.next.next_index();
                    let target = &self.loops[index];
                    match target.adopt(stream, peer) {
                        Ok(()) => debug!("accepted {} -> {}", peer, target.name()),
                        Err(e) => warn!("dropping connection from {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}
