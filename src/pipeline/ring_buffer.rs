//! Fixed-capacity byte FIFOs shared between a worker and the control path.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::EngineError;

/// A fixed-capacity byte FIFO.
///
/// Writes beyond the remaining capacity are truncated (the newest bytes are
/// dropped, unread data is never overwritten) and reads beyond the occupied
/// count return fewer bytes. The buffer itself is not synchronized; see
/// [`SharedRingBuffer`].
pub struct RingBuffer {
    inner: HeapRb<u8>,
}

impl RingBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: HeapRb::new(capacity.max(1)),
        }
    }

    /// Appends as many bytes of `data` as fit and returns how many were stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.inner.push_slice(data)
    }

    /// Moves up to `out.len()` bytes into `out` and returns how many were read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.inner.pop_slice(out)
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Returns `true` if no bytes are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `true` if no more bytes can be written.
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    /// Number of bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.inner.vacant_len()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Discards all unread bytes.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A [`RingBuffer`] behind its single lock.
///
/// Every access takes the lock with a bounded wait; a timeout is reported as
/// [`EngineError::LockTimeout`] so the caller can skip the cycle. The lock is
/// held only for the copy.
pub(crate) struct SharedRingBuffer {
    name: &'static str,
    inner: Mutex<RingBuffer>,
}

impl SharedRingBuffer {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, RingBuffer>, EngineError> {
        self.inner
            .try_lock_for(wait)
            .ok_or(EngineError::LockTimeout {
                resource: self.name,
                waited: wait,
            })
    }

    /// Writes what fits, returns the stored count.
    pub fn write(&self, data: &[u8], wait: Duration) -> Result<usize, EngineError> {
        Ok(self.lock(wait)?.write(data))
    }

    /// Reads up to `out.len()` bytes, returns the count (0 when empty).
    pub fn read(&self, out: &mut [u8], wait: Duration) -> Result<usize, EngineError> {
        Ok(self.lock(wait)?.read(out))
    }

    pub fn len(&self, wait: Duration) -> Result<usize, EngineError> {
        Ok(self.lock(wait)?.len())
    }

    /// Clears the buffer, waiting as long as it takes.
    ///
    /// Only for start and stop paths, where the workers are not running.
    pub fn clear_blocking(&self) {
        self.inner.lock().clear();
    }
}
