use std::{io, sync::OnceLock, time::Duration};

use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::{NetworkError, Result};

/// Token reserved for the loop's waker.
pub const WAKER_TOKEN: Token = Token(0);

/// First token handed out to a connection.
pub const FIRST_CONNECTION_TOKEN: usize = 1;

/// The OS readiness handle of one event loop plus its event buffer.
///
/// Creating it also creates the loop's [`Waker`] and publishes it into
/// `waker_slot`, which is how other threads interrupt a blocked wait.
pub struct PollHandle {
    poller: Poll,
    events: Events,
}

impl PollHandle {
    pub fn new(events_capacity: usize, waker_slot: &OnceLock<Waker>) -> Result<Self> {
        let poller = Poll::new().map_err(NetworkError::PollInit)?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN).map_err(NetworkError::PollInit)?;
        if waker_slot.set(waker).is_err() {
            return Err(NetworkError::Configuration(
                "event loop initialized twice".to_string(),
            ));
        }

        Ok(PollHandle {
            poller,
            events: Events::with_capacity(events_capacity),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    /// Blocks until at least one source is ready, the waker fires, or `timeout` elapses.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.poller.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().count())
    }

    pub fn events(&self) -> &Events {
        &self.events
    }
}
