//! Thread-owning wrappers that run one [`EventLoop`] each.
//!
//! A [`ReaderWorker`] runs a read-role loop fed by the acceptor. A
//! [`WriterWorker`] runs a write-role loop with its own
//! [`ClientConnectionManager`] and is the entry point for outbound messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use log::{debug, error, info};

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::handler::MessageHandler;
use crate::net::client::{ClientConnectionManager, ClientSender};

struct LoopWorker {
    event_loop: Option<EventLoop>,
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
    buffer_capacity: usize,
}

impl LoopWorker {
    fn new(event_loop: EventLoop, buffer_capacity: usize) -> Self {
        let handle = event_loop.handle().clone();
        Self {
            event_loop: Some(event_loop),
            handle,
            thread: None,
            buffer_capacity,
        }
    }

    fn init(&mut self) -> Result<()> {
        let event_loop = self
            .event_loop
            .as_mut()
            .ok_or(NetworkError::EventLoopGone)?;
        event_loop.init(self.buffer_capacity)
    }

    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.handle.is_stopped() {
            return Err(NetworkError::EventLoopGone);
        }
        let mut event_loop = self.event_loop.take().ok_or(NetworkError::EventLoopGone)?;
        if !event_loop.is_initialized() {
            self.event_loop = Some(event_loop);
            return Err(NetworkError::NotInitialized);
        }

        let name = self.handle.name().to_string();
        let thread = Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(e) = event_loop.run() {
                    error!("{}: event loop failed: {}", event_loop.handle().name(), e);
                }
            })
            .map_err(|source| NetworkError::Spawn { name, source })?;
        self.thread = Some(thread);
        debug!("{}: started", self.handle.name());
        Ok(())
    }

    fn stop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{}: worker thread panicked", self.handle.name());
            }
            info!("{}: stopped", self.handle.name());
        }
        self.event_loop = None;
    }
}

impl Drop for LoopWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs a read-role loop on a dedicated thread.
pub struct ReaderWorker {
    worker: LoopWorker,
}

impl ReaderWorker {
    pub fn new(
        id: usize,
        handler: Arc<dyn MessageHandler>,
        buffers: BufferPool,
        config: TransportConfig,
    ) -> Self {
        let capacity = config.buffer_capacity;
        let handle = LoopHandle::new(format!("quorum-reader-{id}"));
        let event_loop = EventLoop::new(handle, handler, buffers, config, None);
        Self {
            worker: LoopWorker::new(event_loop, capacity),
        }
    }

    pub fn init(&mut self) -> Result<()> {
        self.worker.init()
    }

    pub fn start(&mut self) -> Result<()> {
        self.worker.start()
    }

    /// Stops the loop and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        self.worker.stop()
    }

    /// Handle to register with the [`Acceptor`](crate::net::acceptor::Acceptor).
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.worker.handle
    }
}

/// Runs a write-role loop and owns its outbound connections.
///
/// Responses arriving on those connections are read by the same loop and
/// delivered to the shared [`MessageHandler`].
pub struct WriterWorker {
    worker: LoopWorker,
    sender: ClientSender,
}

impl WriterWorker {
    pub fn new(
        id: usize,
        handler: Arc<dyn MessageHandler>,
        buffers: BufferPool,
        config: TransportConfig,
    ) -> Self {
        let capacity = config.buffer_capacity;
        let handle = LoopHandle::new(format!("quorum-writer-{id}"));
        let manager = ClientConnectionManager::new(handle.clone(), config.max_frame_len);
        let sender = manager.sender();
        let event_loop = EventLoop::new(handle, handler, buffers, config, Some(Box::new(manager)));
        Self {
            worker: LoopWorker::new(event_loop, capacity),
            sender,
        }
    }

    pub fn init(&mut self) -> Result<()> {
        self.worker.init()
    }

    pub fn start(&mut self) -> Result<()> {
        self.worker.start()
    }

    /// Stops the loop and joins its thread. Queued messages are dropped.
    pub fn stop(&mut self) {
        self.worker.stop()
    }

    /// Queues `payload` for `addr` on this writer's loop.
    pub fn add_message(&self, addr: SocketAddr, payload: Vec<u8>) -> Result<()> {
        self.sender.add_message(addr, payload)
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.worker.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::encode_frame;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    fn small_config() -> TransportConfig {
        TransportConfig::builder()
            .buffer_capacity(64)
            .poll_timeout(Some(Duration::from_millis(50)))
            .build()
            .unwrap()
    }

    fn recording_handler() -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn MessageHandler> =
            Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec()));
        (handler, seen)
    }

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

    #[test]
    fn test_start_before_init_fails() {
        let (handler, _) = recording_handler();
        let mut reader = ReaderWorker::new(0, handler, BufferPool::new(1, 64), small_config());
        assert_eq!(reader.loop_handle().name(), "quorum-reader-0");
        assert!(matches!(reader.start(), Err(NetworkError::NotInitialized)));

        reader.init().unwrap();
        reader.start().unwrap();
        assert!(reader.loop_handle().is_initialized());
        reader.stop();
        assert!(reader.loop_handle().is_stopped());
    }

    #[test]
    fn test_stop_is_idempotent_and_blocks_restart() {
        let (handler, _) = recording_handler();
        let mut reader = ReaderWorker::new(1, handler, BufferPool::new(1, 64), small_config());
        reader.init().unwrap();
        reader.start().unwrap();
        reader.stop();
        reader.stop();
        assert!(matches!(reader.start(), Err(NetworkError::EventLoopGone)));
    }

    #[test]
    fn test_stop_without_start() {
        let (handler, _) = recording_handler();
        let mut writer = WriterWorker::new(0, handler, BufferPool::new(1, 64), small_config());
        writer.init().unwrap();
        writer.stop();
        assert!(writer.loop_handle().is_stopped());
    }

    #[test]
    fn test_writer_delivers_and_reads_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (handler, seen) = recording_handler();
        let mut writer = WriterWorker::new(2, handler, BufferPool::new(1, 64), small_config());
        writer.init().unwrap();
        writer.start().unwrap();

        writer.add_message(addr, b"ping".to_vec()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let expected = encode_frame(b"ping");
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);

        peer.write_all(&encode_frame(b"pong")).unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 1));
        assert_eq!(seen.lock().unwrap()[0], b"pong".to_vec());

        writer.stop();
        assert!(matches!(
            writer.add_message(addr, b"late".to_vec()),
            Err(NetworkError::EventLoopGone)
        ));
    }
}
