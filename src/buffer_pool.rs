use anyhow::anyhow;
use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

struct PoolShared {
    buf_capacity: usize,
    max_pooled: usize,
    max_outstanding: usize,
    buffers: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}
impl PoolShared {
    /// Buffers that grew far beyond the regular capacity (e.g. for reassembling a huge message)
    ///  are not kept around
    const MAX_RETAINED_GROWTH: usize = 4;

    fn return_to_pool(&self, mut buffer: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if buffer.capacity() > self.buf_capacity * Self::MAX_RETAINED_GROWTH {
            debug!("discarding returned buffer with capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A pool of reusable byte buffers, shared by the outbound and the inbound side. Buffers are
///  handed out as [PooledBuf] handles that go back to the pool when they are dropped, so there
///  is no way to hold on to a buffer after returning it.
///
/// The number of buffers handed out at any given time is limited: Exceeding the limit is an
///  error rather than a reason to allocate without bound.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(buf_capacity: usize, max_pooled: usize, max_outstanding: usize) -> BufferPool {
        BufferPool {
            shared: Arc::new(PoolShared {
                buf_capacity,
                max_pooled,
                max_outstanding,
                buffers: Mutex::new(Vec::with_capacity(max_pooled)),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn get_from_pool(&self) -> anyhow::Result<PooledBuf> {
        let max_outstanding = self.shared.max_outstanding;
        self.shared.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max_outstanding).then_some(n + 1))
            .map_err(|n| anyhow!("buffer pool exhausted: {} buffers are in use", n))?;

        let pooled = self.shared.buffers.lock().unwrap().pop();
        let buf = match pooled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.shared.buf_capacity)
            }
        };

        Ok(PooledBuf {
            buf,
            pool: self.shared.clone(),
        })
    }

    /// convenience for getting a buffer and initializing it with a copy of some data
    pub fn get_with_content(&self, data: &[u8]) -> anyhow::Result<PooledBuf> {
        let mut result = self.get_from_pool()?;
        result.extend_from_slice(data);
        Ok(result)
    }

    pub fn num_outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn num_pooled(&self) -> usize {
        self.shared.buffers.lock().unwrap().len()
    }
}

/// Move-only handle for a buffer borrowed from a [BufferPool]
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<PoolShared>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.return_to_pool(std::mem::take(&mut self.buf));
    }
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

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_ref()
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.buf.as_ref().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_clear_on_return() {
        let pool = BufferPool::new(10, 10, 10);

        let mut buf = pool.get_from_pool().unwrap();
        buf.put_u8(1);
        buf.put_u8(2);
        drop(buf);

        assert_eq!(pool.num_pooled(), 1);
        assert!(pool.get_from_pool().unwrap().is_empty());
    }

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(10, 10, 10);

        let a = pool.get_from_pool().unwrap();
        let b = pool.get_from_pool().unwrap();
        assert_eq!(pool.num_outstanding(), 2);
        assert_eq!(pool.num_pooled(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.num_outstanding(), 0);
        assert_eq!(pool.num_pooled(), 2);

        let _c = pool.get_from_pool().unwrap();
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_pool_full_discards() {
        let pool = BufferPool::new(10, 1, 10);

        let a = pool.get_from_pool().unwrap();
        let b = pool.get_from_pool().unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_grown_buffer_discarded() {
        let pool = BufferPool::new(10, 10, 10);

        let mut buf = pool.get_from_pool().unwrap();
        buf.extend_from_slice(&[0u8; 1000]);
        drop(buf);

        assert_eq!(pool.num_pooled(), 0);
        assert_eq!(pool.num_outstanding(), 0);
    }

    #[test]
    fn test_exhausted() {
        let pool = BufferPool::new(10, 10, 2);

        let _a = pool.get_from_pool().unwrap();
        let b = pool.get_with_content(&[1, 2, 3]).unwrap();
        assert_eq!(b.as_ref(), &[1, 2, 3]);
        assert!(pool.get_from_pool().is_err());

        drop(b);
        assert!(pool.get_from_pool().is_ok());
    }

    #[test]
    fn test_concurrent_borrow_and_return() {
        let pool = BufferPool::new(16, 64, 64);

        let handles = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let mut buf = pool.get_from_pool().unwrap();
                        buf.put_u32(i);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.num_outstanding(), 0);
    }
}
