// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # BUFFER POOL
//!
//! Raw readout buffers cycle through a bounded free-list: the readout
//! worker takes storage from the pool, fills it, and hands shared references
//! down the consumer chain; when the last reference drops, the storage
//! returns to the pool. The pool never grows past its configured depth, so
//! readout memory use is fixed for the lifetime of a run.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::ops::Deref;
use std::time::Duration;

/// ## BUFFER POOL
///
/// A bounded free-list of word buffers.
#[derive(Clone)]
pub struct BufferPool {
  free_tx: Sender<Vec<u32>>,
  free_rx: Receiver<Vec<u32>>,
  buffer_words: usize,
}

impl BufferPool {
  /// ### NEW POOL
  ///
  /// Creates a pool holding `depth` buffers of `buffer_words` words each,
  /// all initially free.
  pub fn new(depth: usize, buffer_words: usize) -> Self {
    let (free_tx, free_rx) = bounded::<Vec<u32>>(depth);
    for _ in 0..depth {
      free_tx.send(Vec::with_capacity(buffer_words)).expect("pool channel sized to depth");
    }
    BufferPool { free_tx, free_rx, buffer_words }
  }

  /// ### ACQUIRE BUFFER
  ///
  /// Takes a free buffer, waiting up to `timeout` for one to return to the
  /// pool. Returns [None] when every buffer is in flight for the whole
  /// timeout, which signals downstream backpressure to the caller.
  pub fn acquire(&self, timeout: Duration) -> Option<PooledBuffer> {
    let mut storage: Vec<u32> = self.free_rx.recv_timeout(timeout).ok()?;
    storage.clear();
    Some(PooledBuffer {
      storage,
      buffer_number: 0,
      free_tx: self.free_tx.clone(),
    })
  }

  /// ### FREE COUNT
  pub fn free_count(&self) -> usize {
    self.free_rx.len()
  }

  /// ### BUFFER WORDS
  pub fn buffer_words(&self) -> usize {
    self.buffer_words
  }
}

/// ## POOLED BUFFER
///
/// One raw readout buffer checked out of a [Buffer Pool]. Filled by the
/// producer, then typically wrapped in an [Arc] and shared by reference
/// down the consumer chain; the storage returns to the pool when the last
/// owner drops it.
///
/// [Buffer Pool]: BufferPool
/// [Arc]:         std::sync::Arc
pub struct PooledBuffer {
  storage: Vec<u32>,
  /// ### BUFFER NUMBER
  ///
  /// Monotone sequence number assigned by the producer; consumers use it
  /// to detect drops on their own queues.
  pub buffer_number: u32,
  free_tx: Sender<Vec<u32>>,
}

impl PooledBuffer {
  /// ### WORDS
  pub fn words(&self) -> &[u32] {
    &self.storage
  }

  /// ### STORAGE
  ///
  /// Mutable access for the producer while filling.
  pub fn storage_mut(&mut self) -> &mut Vec<u32> {
    &mut self.storage
  }
}

impl Deref for PooledBuffer {
  type Target = [u32];

  fn deref(&self) -> &[u32] {
    &self.storage
  }
}

impl Drop for PooledBuffer {
  fn drop(&mut self) {
    let storage: Vec<u32> = std::mem::take(&mut self.storage);
    // A full or closed free-list simply lets the storage fall.
    let _: Result<(), TrySendError<Vec<u32>>> = self.free_tx.try_send(storage);
  }
}

impl std::fmt::Debug for PooledBuffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PooledBuffer")
      .field("buffer_number", &self.buffer_number)
      .field("words", &self.storage.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn buffers_return_to_the_pool_on_drop() {
    let pool: BufferPool = BufferPool::new(2, 16);
    assert_eq!(pool.free_count(), 2);

    let a: PooledBuffer = pool.acquire(Duration::from_millis(10)).unwrap();
    let b: PooledBuffer = pool.acquire(Duration::from_millis(10)).unwrap();
    assert_eq!(pool.free_count(), 0);
    assert!(pool.acquire(Duration::from_millis(10)).is_none());

    drop(a);
    assert_eq!(pool.free_count(), 1);
    drop(b);
    assert_eq!(pool.free_count(), 2);
  }

  #[test]
  fn acquired_buffers_are_empty() {
    let pool: BufferPool = BufferPool::new(1, 16);
    let mut a: PooledBuffer = pool.acquire(Duration::from_millis(10)).unwrap();
    a.storage_mut().extend_from_slice(&[1, 2, 3]);
    drop(a);
    let b: PooledBuffer = pool.acquire(Duration::from_millis(10)).unwrap();
    assert!(b.words().is_empty());
  }
}
