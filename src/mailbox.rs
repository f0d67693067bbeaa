//! The client-to-server mailbox.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::request::Request;
use crate::result_queue::ResultQueue;

/// Message accepted by the I/O worker.
pub(crate) enum ServerMsg {
    /// A pooled request node.
    Request(Box<Request>),
    /// A closed stream's reply queue, handed over for draining.
    CleanupResultQueue(Arc<ResultQueue>),
    /// Stop the worker.
    Shutdown,
}

/// Producer half; cloned into every stream. Sending wakes the worker when
/// the mailbox was empty, and never blocks or allocates: every `Request`
/// message wraps one of the pool's nodes, each live stream pins at least one
/// pool node until its close is processed and contributes at most one
/// cleanup message, so a channel of `2 * pool_capacity + 1` slots cannot
/// fill.
#[derive(Clone)]
pub(crate) struct MailboxSender {
    tx: Sender<ServerMsg>,
}

/// Consumer half, owned by the worker thread.
pub(crate) struct Mailbox {
    rx: Receiver<ServerMsg>,
}

pub(crate) fn mailbox(pool_capacity: usize) -> (MailboxSender, Mailbox) {
    let (tx, rx) = bounded(2 * pool_capacity + 1);
    (MailboxSender { tx }, Mailbox { rx })
}

impl MailboxSender {
    pub fn send(&self, msg: ServerMsg) {
        // The receiver only disconnects after shutdown, when dropping a
        // message is harmless.
        let _ = self.tx.send(msg);
    }
}

impl Mailbox {
    /// Park until a message arrives or `timeout` elapses. The worker calls
    /// this only with an empty private backlog, then drains with
    /// [`try_recv`](Self::try_recv) so it never sleeps on a nonempty mailbox.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ServerMsg> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ServerMsg::Shutdown),
        }
    }

    pub fn try_recv(&self) -> Option<ServerMsg> {
        self.rx.try_recv().ok()
    }
}
