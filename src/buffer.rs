//! Bounded pool of reusable connection buffers.
//!
//! Each connection checks out a read and a write buffer at accept time and
//! returns them when it is torn down, however it exits. The pool is bounded;
//! when every buffer is checked out, `acquire` waits until one comes back.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub(crate) struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<BytesMut>>,
    buf_size: usize,
}

/// Cap on how much capacity a returned buffer may keep. Buffers that grew
/// past this while serving a large message are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 256 * 1024;

impl BufferPool {
    pub(crate) fn new(count: usize, buf_size: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(count)),
                free: Mutex::new(Vec::new()),
                buf_size,
            }),
        }
    }

    /// Checks a buffer out of the pool, waiting if all are in use.
    pub(crate) async fn acquire(&self) -> PooledBuf {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .expect("buffer pool semaphore is never closed");
        let buf = {
            let mut free = self.inner.free.lock().expect("buffer pool poisoned");
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| BytesMut::with_capacity(self.inner.buf_size));
        PooledBuf {
            buf,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> BufferPool {
        BufferPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PooledBuf {
    buf: BytesMut,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            if let Ok(mut free) = self.pool.free.lock() {
                free.push(buf);
            }
        }
        // permit drops after this, waking one waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire().await;
        buf.extend_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
        drop(buf);

        // reuse: the cleared buffer comes back
        let buf = pool.acquire().await;
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 5);
    }

    #[tokio::test]
    async fn exhaustion_blocks_until_return() {
        let pool = BufferPool::new(1, 64);
        let held = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        let _second = waiter.await.expect("waiter task");
    }
}
