//! Outbound connection management for write-role loops.
//!
//! [`ClientConnectionManager`] lives inside its writer's
//! [`EventLoop`](crate::event_loop::EventLoop)
//! and is the only code that touches that loop's outbound sockets. Callers on
//! other threads hold a [`ClientSender`], which sends into a channel and
//! wakes the loop; the manager drains the channel on the loop thread.
//!
//! ```text
//! add_message(addr, payload)
//!     │  ClientSender (any thread)
//!     ▼
//! pending queue ──wake──▶ on_wake (loop thread)
//!                           ├─ endpoint known and live?  ──▶ enqueue on its Connection
//!                           └─ otherwise                 ──▶ non-blocking connect, then enqueue
//! on_write_ready(token)
//!     ├─ Connecting  ──▶ finish_connect (error: tear down, queue dropped)
//!     └─ Established ──▶ flush queued frames in order
//! ```
//!
//! Delivery is at-most-once. A failed connect or socket error drops whatever
//! was queued for that endpoint, and the next message to it starts a fresh
//! connect. There is no retry or backoff here.

use std::collections::HashMap;
use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use mio::net::TcpStream;
use mio::Token;

use crate::error::{NetworkError, Result};
use crate::event_loop::{ConnectionTable, LoopHandle, WriteReadyHandler};
use crate::net::codec::validate_payload;
use crate::net::connection::ConnectionState;

struct OutboundMessage {
    addr: SocketAddr,
    payload: Vec<u8>,
}

/// Caller-side handle for queueing messages onto one writer loop.
#[derive(Clone)]
pub struct ClientSender {
    pending: Sender<OutboundMessage>,
    loop_handle: LoopHandle,
    max_frame_len: usize,
}

impl ClientSender {
    /// Queues `payload` for `addr`. Success means accepted into the queue, not delivered.
    pub fn add_message(&self, addr: SocketAddr, payload: Vec<u8>) -> Result<()> {
        validate_payload(&payload, self.max_frame_len)
            .map_err(|e| NetworkError::InvalidPayload(e.to_string()))?;
        if self.loop_handle.is_stopped() {
            return Err(NetworkError::EventLoopGone);
        }
        self.pending
            .send(OutboundMessage { addr, payload })
            .map_err(|_| NetworkError::EventLoopGone)?;
        self.loop_handle.wake()
    }
}

/// Maps each destination to at most one live outbound connection on this loop.
pub struct ClientConnectionManager {
    pending_tx: Sender<OutboundMessage>,
    pending_rx: Receiver<OutboundMessage>,
    endpoints: HashMap<SocketAddr, Token>,
    loop_handle: LoopHandle,
    max_frame_len: usize,
}

impl ClientConnectionManager {
    pub fn new(loop_handle: LoopHandle, max_frame_len: usize) -> Self {
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
        Self {
            pending_tx,
            pending_rx,
            endpoints: HashMap::new(),
            loop_handle,
            max_frame_len,
        }
    }

    pub fn sender(&self) -> ClientSender {
        ClientSender {
            pending: self.pending_tx.clone(),
            loop_handle: self.loop_handle.clone(),
            max_frame_len: self.max_frame_len,
        }
    }

    fn dispatch(&mut self, message: OutboundMessage, table: &mut ConnectionTable) {
        let OutboundMessage { addr, payload } = message;

        let token = match self.live_connection(addr, table) {
            Some(token) => token,
            None => match self.connect(addr, table) {
                Ok(token) => token,
                Err(e) => {
                    warn!("{}: dropping message: {}", self.loop_handle.name(), e);
                    return;
                }
            },
        };

        let Some(conn) = table.get_mut(token) else {
            return;
        };
        if let Err(e) = conn.enqueue(&payload) {
            warn!("{}: dropping message: {}", self.loop_handle.name(), e);
            return;
        }
        if conn.state() == ConnectionState::Established {
            self.flush(token, table);
        }
    }

    fn live_connection(
        &mut self,
        addr: SocketAddr,
        table: &mut ConnectionTable,
    ) -> Option<Token> {
        let token = *self.endpoints.get(&addr)?;
        let live = table.get_mut(token).is_some_and(|conn| {
            matches!(
                conn.state(),
                ConnectionState::Connecting | ConnectionState::Established
            )
        });
        if live {
            return Some(token);
        }
        self.endpoints.remove(&addr);
        debug!(
            "{}: connection to {} is gone, reconnecting",
            self.loop_handle.name(),
            addr
        );
        None
    }

    fn connect(&mut self, addr: SocketAddr, table: &mut ConnectionTable) -> Result<Token> {
        let stream =
            TcpStream::connect(addr).map_err(|source| NetworkError::Connect { addr, source })?;
        let token = table.open_outbound(stream, addr)?;
        self.endpoints.insert(addr, token);
        debug!(
            "{}: connecting to {} as {:?}",
            self.loop_handle.name(),
            addr,
            token
        );
        Ok(token)
    }

    fn flush(&self, token: Token, table: &mut ConnectionTable) {
        let result = match table.get_mut(token) {
            Some(conn) => conn.flush(),
            None => return,
        };
        if let Err(e) = result {
            table.close(token, &e.to_string());
        }
    }
}

impl WriteReadyHandler for ClientConnectionManager {
    fn on_wake(&mut self, table: &mut ConnectionTable) {
        while let Ok(message) = self.pending_rx.try_recv() {
            self.dispatch(message, table);
        }
    }

    fn on_write_ready(&mut self, token: Token, table: &mut ConnectionTable) {
        let Some(conn) = table.get_mut(token) else {
            return;
        };

        if conn.state() == ConnectionState::Connecting {
            match conn.finish_connect() {
                Ok(true) => debug!(
                    "{}: connected to {}",
                    self.loop_handle.name(),
                    conn.peer()
                ),
                Ok(false) => return,
                Err(source) => {
                    let err = NetworkError::Connect {
                        addr: conn.peer(),
                        source,
                    };
                    warn!("{}: {}", self.loop_handle.name(), err);
                    table.close(token, "connect failed");
                    return;
                }
            }
        }

        self.flush(token, table);
    }
}
