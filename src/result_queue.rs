//! Per-stream reply channel from the I/O worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::request::Request;

/// Unordered single-producer (server) / single-consumer (stream) queue of
/// completed requests, plus the bookkeeping the cleanup protocol relies on.
///
/// `expected` counts requests sent minus replies consumed: the stream bumps
/// it on every send, and both `pop` and `discard_expected` bring it back
/// down. Replies arrive in whatever order the server finished them; the
/// stream reimposes file order through its prefetch FIFO.
///
/// A stream that closes with replies still expected hands its queue to the
/// server, which drains it and then sets `awaiting_cleanup` so every late
/// reply is reclaimed at delivery instead of being pushed. The queue itself
/// is freed by the last `Arc` clone, which disappears exactly when the final
/// expected reply has been accounted for.
pub(crate) struct ResultQueue {
    queue: ArrayQueue<Box<Request>>,
    expected: AtomicUsize,
    awaiting_cleanup: AtomicBool,
}

impl ResultQueue {
    /// `capacity` must cover every reply that can be queued at once; the
    /// server sizes it to the request pool capacity, which bounds all nodes
    /// in existence.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            expected: AtomicUsize::new(0),
            awaiting_cleanup: AtomicBool::new(false),
        }
    }

    /// Server side. Fails only if the capacity contract above is broken.
    pub fn push(&self, node: Box<Request>) -> Result<(), Box<Request>> {
        self.queue.push(node)
    }

    pub fn pop(&self) -> Option<Box<Request>> {
        let node = self.queue.pop();
        if node.is_some() {
            self.expected.fetch_sub(1, Ordering::Relaxed);
        }
        node
    }

    /// Client side, called once per request sent with this queue attached.
    pub fn add_expected(&self) {
        self.expected.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a reply the server reclaimed on the cleanup path without
    /// it ever transiting the queue.
    pub fn discard_expected(&self) {
        self.expected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn expected_results(&self) -> usize {
        self.expected.load(Ordering::Relaxed)
    }

    pub fn set_awaiting_cleanup(&self) {
        self.awaiting_cleanup.store(true, Ordering::Release);
    }

    pub fn awaiting_cleanup(&self) -> bool {
        self.awaiting_cleanup.load(Ordering::Acquire)
    }
}
