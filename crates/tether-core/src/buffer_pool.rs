//! Buffer pool for inbound frames.
//!
//! Every frame read from a socket lands in a fixed-capacity buffer taken from
//! this pool. Buffers go back to the pool when dropped, with the region that
//! was written zeroed first so the next reader never sees stale bytes.
//!
//! Two strategies are available and behave identically to callers:
//!
//! - [`BufferPoolKind::FreeList`]: a plain free list behind one lock.
//! - [`BufferPoolKind::ObjectPool`]: an `object-pool` pool, pre-filled.

use std::io::{self, Read};
use std::ops::Deref;
use std::sync::Arc;

use object_pool::Pool;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::BufferError;

/// Default buffer size (64KB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of idle buffers kept around.
const DEFAULT_POOL_CAPACITY: usize = 32;

/// Which pooling strategy backs a [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPoolKind {
    #[default]
    FreeList,
    ObjectPool,
}

impl std::str::FromStr for BufferPoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "freelist" | "free_list" | "free-list" => Ok(Self::FreeList),
            "objectpool" | "object_pool" | "object-pool" => Ok(Self::ObjectPool),
            other => Err(format!("unknown buffer pool kind {other:?}")),
        }
    }
}

/// A pool of fixed-capacity message buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: PoolInner,
    buffer_size: usize,
}

#[derive(Clone)]
enum PoolInner {
    FreeList(Arc<FreeList>),
    Object(Arc<Pool<Vec<u8>>>),
}

struct FreeList {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl FreeList {
    fn put(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("kind", &self.kind())
            .field("buffer_size", &self.buffer_size)
            .field("idle", &self.idle())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool of `buffer_size`-byte buffers.
    pub fn new(kind: BufferPoolKind, buffer_size: usize) -> Self {
        Self::with_capacity(kind, DEFAULT_POOL_CAPACITY, buffer_size)
    }

    /// Create a pool keeping up to `capacity` idle buffers.
    ///
    /// The object-pool strategy allocates all `capacity` buffers up front;
    /// the free list starts empty and fills as buffers are released.
    pub fn with_capacity(kind: BufferPoolKind, capacity: usize, buffer_size: usize) -> Self {
        let inner = match kind {
            BufferPoolKind::FreeList => PoolInner::FreeList(Arc::new(FreeList {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                max_idle: capacity,
            })),
            BufferPoolKind::ObjectPool => {
                PoolInner::Object(Arc::new(Pool::new(capacity, move || vec![0u8; buffer_size])))
            }
        };
        Self { inner, buffer_size }
    }

    /// Take a zeroed, empty buffer. Allocates when no idle buffer is
    /// available; never waits for one.
    pub fn acquire(&self) -> PooledBuf {
        let storage = match &self.inner {
            PoolInner::FreeList(list) => {
                let data = list
                    .idle
                    .lock()
                    .pop()
                    .unwrap_or_else(|| vec![0u8; self.buffer_size]);
                Storage::FreeList {
                    data,
                    home: list.clone(),
                }
            }
            PoolInner::Object(pool) => {
                let size = self.buffer_size;
                Storage::Object(pool.pull_owned(move || vec![0u8; size]))
            }
        };
        PooledBuf { storage, len: 0 }
    }

    /// Return a buffer to the pool. Same as dropping it.
    pub fn release(&self, buf: PooledBuf) {
        drop(buf);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn kind(&self) -> BufferPoolKind {
        match self.inner {
            PoolInner::FreeList(_) => BufferPoolKind::FreeList,
            PoolInner::Object(_) => BufferPoolKind::ObjectPool,
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        match &self.inner {
            PoolInner::FreeList(list) => list.idle.lock().len(),
            PoolInner::Object(pool) => pool.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolKind::default(), DEFAULT_BUFFER_SIZE)
    }
}

/// A fixed-capacity buffer that returns to its pool when dropped.
///
/// Derefs to the written region only.
pub struct PooledBuf {
    storage: Storage,
    len: usize,
}

enum Storage {
    FreeList { data: Vec<u8>, home: Arc<FreeList> },
    Object(object_pool::ReusableOwned<Vec<u8>>),
}

impl PooledBuf {
    fn raw(&self) -> &[u8] {
        match &self.storage {
            Storage::FreeList { data, .. } => data.as_slice(),
            Storage::Object(data) => data.as_slice(),
        }
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::FreeList { data, .. } => data.as_mut_slice(),
            Storage::Object(data) => data.as_mut_slice(),
        }
    }

    /// Fixed capacity of this buffer.
    pub fn capacity(&self) -> usize {
        self.raw().len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the written region and mark the buffer empty. No-op when nothing
    /// has been written.
    pub fn clear(&mut self) {
        if self.len == 0 {
            return;
        }
        let len = self.len;
        self.raw_mut()[..len].fill(0);
        self.len = 0;
    }

    /// Append bytes, failing when they would not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let capacity = self.capacity();
        let end = self.len + bytes.len();
        if end > capacity {
            return Err(BufferError::Overflow { capacity });
        }
        let start = self.len;
        self.raw_mut()[start..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// Fill the buffer with one whole frame read from `reader`, which must
    /// report end of frame with a zero-length read.
    ///
    /// If the frame does not fit, the buffer is released, the rest of the
    /// frame is drained from `reader` and [`BufferError::Overflow`] is
    /// returned. A truncated frame is never handed back.
    pub fn read_from<R: Read + ?Sized>(mut self, reader: &mut R) -> Result<Self, BufferError> {
        self.clear();
        let capacity = self.capacity();
        loop {
            if self.len == capacity {
                let mut probe = [0u8; 1];
                if read_retrying(reader, &mut probe)? == 0 {
                    return Ok(self);
                }
                drop(self);
                io::copy(reader, &mut io::sink())?;
                return Err(BufferError::Overflow { capacity });
            }
            let start = self.len;
            let n = read_retrying(reader, &mut self.raw_mut()[start..])?;
            if n == 0 {
                return Ok(self);
            }
            self.len += n;
        }
    }

    /// Convert into `Bytes` without copying. The buffer goes back to the pool
    /// once every clone and slice of the returned `Bytes` is dropped.
    pub fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from_owner(PooledBufOwner(self))
    }
}

fn read_retrying<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.raw()[..self.len]
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.clear();
        if let Storage::FreeList { data, home } = &mut self.storage {
            home.put(std::mem::take(data));
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct PooledBufOwner(PooledBuf);

impl AsRef<[u8]> for PooledBufOwner {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
