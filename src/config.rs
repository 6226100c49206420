use std::time::Duration;

use crate::error::{NetworkError, Result};
use crate::net::codec::DEFAULT_MAX_FRAME_LEN;

/// Event buffer capacity reserved by each loop at init.
pub const DEFAULT_BUFFER_CAPACITY: usize = 20480;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 10240;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;

/// Tunables shared by every loop of a [`NetworkEngine`](crate::NetworkEngine).
///
/// ## Buffers
///
/// - buffer_capacity: readiness events a loop can take per wait
/// - read_chunk_size: size of the pooled scratch buffer used for each socket read
/// - buffer_pool_size: read chunks kept warm in the shared pool
///
/// ## Limits
///
/// - max_frame_len: largest payload accepted on read or on `add_message`
/// - max_queued_bytes / max_queued_messages: per-connection outbound queue bounds;
///   messages beyond them are dropped
///
/// Use [`TransportConfig::builder()`] to construct a validated config.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub buffer_capacity: usize,
    pub read_chunk_size: usize,
    pub buffer_pool_size: usize,
    pub max_frame_len: usize,
    pub max_queued_bytes: usize,
    pub max_queued_messages: usize,
    /// Enable TCP_NODELAY on every socket
    pub no_delay: bool,
    pub listen_backlog: i32,
    /// Upper bound on a single readiness wait. `None` blocks until an event or a wake.
    pub poll_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(NetworkError::Configuration(
                "buffer_capacity must be non-zero".to_string(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(NetworkError::Configuration(
                "read_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.max_frame_len == 0 || self.max_frame_len > (u32::MAX as usize - 4) {
            return Err(NetworkError::Configuration(format!(
                "max_frame_len {} out of range",
                self.max_frame_len
            )));
        }
        if self.max_queued_messages == 0 {
            return Err(NetworkError::Configuration(
                "max_queued_messages must be non-zero".to_string(),
            ));
        }
        if self.max_queued_bytes < self.max_frame_len {
            return Err(NetworkError::Configuration(format!(
                "max_queued_bytes {} cannot hold a single {}-byte frame",
                self.max_queued_bytes, self.max_frame_len
            )));
        }
        if self.listen_backlog <= 0 {
            return Err(NetworkError::Configuration(
                "listen_backlog must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            no_delay: true,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            poll_timeout: Some(Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS)),
        }
    }
}

/// Builder for [`TransportConfig`].
///
/// Unset fields fall back to [`TransportConfig::default()`].
#[derive(Default)]
pub struct TransportConfigBuilder {
    buffer_capacity: Option<usize>,
    read_chunk_size: Option<usize>,
    buffer_pool_size: Option<usize>,
    max_frame_len: Option<usize>,
    max_queued_bytes: Option<usize>,
    max_queued_messages: Option<usize>,
    no_delay: Option<bool>,
    listen_backlog: Option<i32>,
    poll_timeout: Option<Option<Duration>>,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = Some(size);
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = Some(len);
        self
    }

    pub fn max_queued_bytes(mut self, bytes: usize) -> Self {
        self.max_queued_bytes = Some(bytes);
        self
    }

    pub fn max_queued_messages(mut self, count: usize) -> Self {
        self.max_queued_messages = Some(count);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    pub fn poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<TransportConfig> {
        let default = TransportConfig::default();
        let config = TransportConfig {
            buffer_capacity: self.buffer_capacity.unwrap_or(default.buffer_capacity),
            read_chunk_size: self.read_chunk_size.unwrap_or(default.read_chunk_size),
            buffer_pool_size: self.buffer_pool_size.unwrap_or(default.buffer_pool_size),
            max_frame_len: self.max_frame_len.unwrap_or(default.max_frame_len),
            max_queued_bytes: self.max_queued_bytes.unwrap_or(default.max_queued_bytes),
            max_queued_messages: self
                .max_queued_messages
                .unwrap_or(default.max_queued_messages),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            listen_backlog: self.listen_backlog.unwrap_or(default.listen_backlog),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}
