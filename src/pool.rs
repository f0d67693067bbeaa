//! Fixed-capacity lock-free pool of request nodes.

use crossbeam::queue::ArrayQueue;

use crate::request::Request;

/// Recycles the boxed nodes that carry every client/server message.
///
/// All nodes are allocated up front; `allocate` and `release` are lock-free
/// and never touch the general heap, which keeps them legal on the client's
/// real-time path. Exhaustion returns `None` and the caller surfaces
/// `Error::OutOfResources`.
pub(crate) struct RequestPool {
    free: ArrayQueue<Box<Request>>,
    capacity: usize,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // The queue has exactly `capacity` slots; these pushes cannot fail.
            let _ = free.push(Box::new(Request::Vacant));
        }
        Self { free, capacity }
    }

    pub fn allocate(&self) -> Option<Box<Request>> {
        self.free.pop()
    }

    /// Return a node to the pool. The old payload is dropped here, so the
    /// caller must already have settled any server-side resource (data
    /// block, file-record reference) the payload referred to.
    pub fn release(&self, mut node: Box<Request>) {
        *node = Request::Vacant;
        let _ = self.free.push(node);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes currently free. Returns to `capacity` once every stream is
    /// closed and the server has drained.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}
