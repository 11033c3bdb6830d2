//! Bounded per-sink block queue
//!
//! The mix driver pushes, the sink thread pops. A push never blocks: when
//! the queue is full the oldest block is dropped and counted, so a stalled
//! sink falls behind by at most `capacity` blocks.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Result of a timed pop
#[derive(Debug, Clone, PartialEq)]
pub enum Popped {
    Block(Arc<[f32]>),
    /// Nothing arrived before the timeout
    Empty,
    /// Closed and fully drained
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: VecDeque<Arc<[f32]>>,
    closed: bool,
    /// Drops since the last `take_dropped`
    dropped: u64,
}

#[derive(Debug)]
pub struct SinkQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
}

impl SinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `block`; returns `true` if the oldest block had to be dropped
    pub fn push(&self, block: Arc<[f32]>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        let overflow = inner.blocks.len() >= self.capacity;
        if overflow {
            inner.blocks.pop_front();
            inner.dropped += 1;
        }
        inner.blocks.push_back(block);
        drop(inner);
        self.ready.notify_one();
        overflow
    }

    /// Wait up to `timeout` for a block
    ///
    /// Blocks still queued after `close` are handed out before `Closed`.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped {
        let inner = self.lock();
        let (mut inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |i| i.blocks.is_empty() && !i.closed)
            .unwrap_or_else(|e| e.into_inner());
        match inner.blocks.pop_front() {
            Some(block) => Popped::Block(block),
            None if inner.closed => Popped::Closed,
            None => Popped::Empty,
        }
    }

    /// Discard everything queued; discarded blocks count as drops
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.blocks.len();
        inner.blocks.clear();
        inner.dropped += n as u64;
        n
    }

    /// Drops since the previous call
    pub fn take_dropped(&self) -> u64 {
        std::mem::take(&mut self.lock().dropped)
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Sleep up to `timeout`; returns early with `true` once closed
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        let (inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |i| !i.closed)
            .unwrap_or_else(|e| e.into_inner());
        inner.closed
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
