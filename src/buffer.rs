use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A thread-safe pool of fixed-size read chunks shared by every event loop.
///
/// Chunks are created lazily when the pool is empty and returned on drop as
/// long as the pool holds fewer than `capacity` idle chunks.
#[derive(Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<VecDeque<Vec<u8>>>>,
    chunk_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        let idle = (0..capacity).map(|_| vec![0u8; chunk_size]).collect();
        Self {
            idle: Arc::new(Mutex::new(idle)),
            chunk_size,
            capacity,
        }
    }

    #[inline]
    pub fn acquire(&self) -> PooledBuffer {
        let chunk = lock(&self.idle)
            .pop_front()
            .unwrap_or_else(|| vec![0u8; self.chunk_size]);

        PooledBuffer {
            chunk: Some(chunk),
            pool: Arc::clone(&self.idle),
            capacity: self.capacity,
        }
    }

    pub fn available(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

fn lock(idle: &Mutex<VecDeque<Vec<u8>>>) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
    idle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A read chunk on loan from a [`BufferPool`].
pub struct PooledBuffer {
    chunk: Option<Vec<u8>>,
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.chunk.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.chunk.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            let mut idle = lock(&self.pool);
            if idle.len() < self.capacity {
                idle.push_back(chunk);
            }
        }
    }
}
