//! The I/O server: the only thread that touches the filesystem.
//!
//! The worker parks on the mailbox with a one-second timeout, drains it
//! completely on every wake, and dispatches each message by kind. Blocking
//! I/O, data-block allocation, and file lifetime all live here so that
//! stream clients never have to wait on any of them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::block::DataBlock;
use crate::config::ServerConfig;
use crate::error::{Error, Result, StreamError};
use crate::mailbox::{mailbox, Mailbox, MailboxSender, ServerMsg};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::pool::RequestPool;
use crate::request::{BlockGrant, FileId, OpenMode, Request};
use crate::result_queue::ResultQueue;

/// Interval between periodic mailbox sweeps while idle.
const MAILBOX_WAIT: Duration = Duration::from_secs(1);

/// Grace period for the worker to acknowledge shutdown before it is
/// abandoned.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// State shared between the worker thread and every stream: the request
/// pool, the metrics counters, and the immutable configuration.
pub(crate) struct ServerShared {
    pub(crate) pool: RequestPool,
    pub(crate) metrics: ServerMetrics,
    pub(crate) config: ServerConfig,
}

/// Handle to the streaming engine. Owns the worker thread; streams are
/// opened against it and share its request pool and mailbox.
///
/// Dropping the handle shuts the worker down. Streams must be closed first —
/// their close is non-blocking, so the usual order is: close streams, then
/// `shutdown`, then inspect [`metrics`](Self::metrics).
pub struct IoServer {
    shared: Arc<ServerShared>,
    sender: MailboxSender,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    /// Disconnects when the worker exits; `shutdown` waits on it so the
    /// join is bounded.
    done: Receiver<()>,
}

impl IoServer {
    /// Allocate the request pool and spawn the worker thread.
    pub fn start(config: ServerConfig) -> Result<Self> {
        let shared = Arc::new(ServerShared {
            pool: RequestPool::new(config.request_pool_capacity),
            metrics: ServerMetrics::default(),
            config,
        });
        let (sender, inbox) = mailbox(config.request_pool_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("tapedeck-io".into())
            .spawn({
                let shared = Arc::clone(&shared);
                let shutdown = Arc::clone(&shutdown);
                move || {
                    // Dropped when the loop returns, acknowledging shutdown.
                    let _done = done_tx;
                    worker_loop(inbox, shared, shutdown);
                }
            })
            .map_err(Error::Spawn)?;

        Ok(Self {
            shared,
            sender,
            shutdown,
            worker: Some(worker),
            done,
        })
    }

    /// Stop the worker: raise the flag, wake the mailbox, then join. The
    /// wait is bounded: a worker wedged in a blocking syscall is abandoned
    /// after the grace period instead of hanging the caller.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        self.sender.send(ServerMsg::Shutdown);
        match self.done.recv_timeout(SHUTDOWN_WAIT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("i/o worker did not stop within the grace period; detaching");
                drop(worker);
            }
        }
    }

    /// Handle with no worker thread: requests pile up in the returned
    /// mailbox for tests to answer by hand, deterministically.
    #[cfg(test)]
    pub(crate) fn idle(config: ServerConfig) -> (Self, Mailbox) {
        let shared = Arc::new(ServerShared {
            pool: RequestPool::new(config.request_pool_capacity),
            metrics: ServerMetrics::default(),
            config,
        });
        let (sender, inbox) = mailbox(config.request_pool_capacity);
        let (_, done) = bounded::<()>(1);
        (
            Self {
                shared,
                sender,
                shutdown: Arc::new(AtomicBool::new(false)),
                worker: None,
                done,
            },
            inbox,
        )
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Free request nodes. Returns to the configured capacity once every
    /// stream is closed and the worker has drained.
    pub fn pool_available(&self) -> usize {
        self.shared.pool.available()
    }

    pub fn config(&self) -> ServerConfig {
        self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    pub(crate) fn sender(&self) -> MailboxSender {
        self.sender.clone()
    }
}

impl Drop for IoServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inbox: Mailbox, shared: Arc<ServerShared>, shutdown: Arc<AtomicBool>) {
    let mut worker = Worker::new(shared);
    debug!("i/o worker started");

    while !shutdown.load(Ordering::Relaxed) {
        let Some(msg) = inbox.recv_timeout(MAILBOX_WAIT) else {
            continue;
        };
        if !worker.handle(msg) {
            break;
        }
        // Stay awake until the mailbox is empty again.
        while let Some(msg) = inbox.try_recv() {
            if !worker.handle(msg) {
                return;
            }
        }
    }
    debug!("i/o worker stopped");
}

/// An open file plus the number of clients depending on it: one for the
/// stream that opened it, one per block in flight or held. The OS file is
/// closed exactly when the count reaches zero, which is what makes stream
/// close safe while reads are still in flight.
struct FileRecord {
    file: File,
    dependent_clients: usize,
}

/// Worker-private state: the file table and a file-id counter. Nothing in
/// here is visible to any other thread.
struct Worker {
    shared: Arc<ServerShared>,
    files: HashMap<FileId, FileRecord>,
    next_file_id: u64,
}

impl Worker {
    fn new(shared: Arc<ServerShared>) -> Self {
        Self {
            shared,
            files: HashMap::new(),
            next_file_id: 1,
        }
    }

    /// Returns `false` when the worker should exit.
    fn handle(&mut self, msg: ServerMsg) -> bool {
        match msg {
            ServerMsg::Request(node) => {
                self.dispatch(node);
                true
            }
            ServerMsg::CleanupResultQueue(queue) => {
                self.cleanup_queue(queue);
                true
            }
            ServerMsg::Shutdown => false,
        }
    }

    fn dispatch(&mut self, mut node: Box<Request>) {
        self.shared.metrics.record_request();
        match node.take() {
            Request::OpenFile {
                path,
                mode,
                reply_to,
            } => self.open_file(node, &path, mode, reply_to),
            Request::CloseFile { file } => {
                self.release_file_ref(file);
                self.shared.pool.release(node);
            }
            Request::ReadBlock {
                file,
                position,
                ticket,
                reply_to,
            } => {
                let result = self.read_block(file, position);
                if result.is_err() {
                    self.shared.metrics.record_read_error();
                }
                *node = Request::ReadBlockDone {
                    file,
                    ticket,
                    result,
                };
                self.complete(&reply_to, node);
            }
            Request::ReleaseReadBlock { file, block }
            | Request::ReleaseWriteBlock { file, block } => {
                drop(block);
                self.shared.metrics.block_retired();
                self.release_file_ref(file);
                self.shared.pool.release(node);
            }
            Request::AllocateWriteBlock {
                file,
                position,
                ticket,
                reply_to,
            } => {
                let result = self.allocate_write_block(file, position);
                *node = Request::WriteBlockDone {
                    file,
                    ticket,
                    result,
                };
                self.complete(&reply_to, node);
            }
            Request::CommitWriteBlock {
                file,
                position,
                block,
                reply_to,
            } => {
                let result = self.commit_write_block(file, position, &block);
                drop(block);
                self.shared.metrics.block_retired();
                self.release_file_ref(file);
                if result.is_err() {
                    self.shared.metrics.record_write_error();
                }
                *node = Request::CommitDone { result };
                self.complete(&reply_to, node);
            }
            other => {
                debug_assert!(false, "reply or vacant node in the mailbox");
                drop(other);
                self.shared.pool.release(node);
            }
        }
    }

    fn open_file(
        &mut self,
        mut node: Box<Request>,
        path: &Path,
        mode: OpenMode,
        reply_to: Arc<ResultQueue>,
    ) {
        let result = match open_with_mode(path, mode) {
            Ok(file) => {
                let id = FileId(self.next_file_id);
                self.next_file_id += 1;
                self.files.insert(
                    id,
                    FileRecord {
                        file,
                        dependent_clients: 1,
                    },
                );
                self.shared.metrics.file_opened();
                debug!(path = %path.display(), file = id.0, "opened file");
                Ok(id)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "open failed");
                Err(StreamError::from(&err))
            }
        };
        *node = Request::OpenFileDone { result };
        self.complete(&reply_to, node);
    }

    fn read_block(&mut self, file: FileId, position: u64) -> std::result::Result<BlockGrant, StreamError> {
        let block_bytes = self.shared.config.block_bytes;
        let record = self.files.get_mut(&file).ok_or(StreamError::StaleHandle)?;

        let mut block = DataBlock::new(block_bytes);
        record
            .file
            .seek(SeekFrom::Start(position))
            .map_err(|e| StreamError::from(&e))?;
        let n = read_up_to(&mut record.file, block.bytes_mut()).map_err(|e| {
            warn!(file = file.0, position, %e, "block read failed");
            StreamError::from(&e)
        })?;
        block.set_valid_len(n);

        record.dependent_clients += 1;
        self.shared.metrics.block_granted();
        self.shared.metrics.record_read_bytes(n as u64);
        Ok(BlockGrant {
            block,
            at_eof: n < block_bytes,
        })
    }

    fn allocate_write_block(
        &mut self,
        file: FileId,
        position: u64,
    ) -> std::result::Result<DataBlock, StreamError> {
        let block_bytes = self.shared.config.block_bytes;
        let record = self.files.get_mut(&file).ok_or(StreamError::StaleHandle)?;

        // Preload whatever the file already holds at this position so the
        // client can overwrite part of a block without losing the rest.
        let mut block = DataBlock::new(block_bytes);
        if record.file.seek(SeekFrom::Start(position)).is_ok() {
            if let Ok(n) = read_up_to(&mut record.file, block.bytes_mut()) {
                block.set_valid_len(n);
            }
        }

        record.dependent_clients += 1;
        self.shared.metrics.block_granted();
        Ok(block)
    }

    fn commit_write_block(
        &mut self,
        file: FileId,
        position: u64,
        block: &DataBlock,
    ) -> std::result::Result<(), StreamError> {
        let record = self.files.get_mut(&file).ok_or(StreamError::StaleHandle)?;
        record
            .file
            .seek(SeekFrom::Start(position))
            .map_err(|e| StreamError::from(&e))?;
        record.file.write_all(block.bytes()).map_err(|e| {
            warn!(file = file.0, position, %e, "block write failed");
            StreamError::from(&e)
        })?;
        self.shared
            .metrics
            .record_write_bytes(block.valid_len() as u64);
        Ok(())
    }

    fn release_file_ref(&mut self, file: FileId) {
        let Some(record) = self.files.get_mut(&file) else {
            debug_assert!(false, "release for a file that is not open");
            return;
        };
        record.dependent_clients -= 1;
        if record.dependent_clients == 0 {
            self.files.remove(&file);
            self.shared.metrics.file_closed();
            debug!(file = file.0, "closed file");
        }
    }

    /// Deliver a finished request, unless the stream has been closed — then
    /// the reply is reclaimed on the spot and accounted against the queue's
    /// expected count, whose reaching zero drops the queue's last `Arc`.
    fn complete(&mut self, reply_to: &Arc<ResultQueue>, node: Box<Request>) {
        if reply_to.awaiting_cleanup() {
            self.cleanup_result(node);
            reply_to.discard_expected();
            return;
        }
        if let Err(node) = reply_to.push(node) {
            // The queue is sized to the whole pool; a full queue means the
            // consumer is gone without the flag having been raised yet.
            self.cleanup_result(node);
            reply_to.discard_expected();
        }
    }

    /// Reclaim whatever a reply carries when no client is listening:
    /// a successful open becomes a close, a granted block is freed and its
    /// file reference released, errors have nothing attached.
    fn cleanup_result(&mut self, mut node: Box<Request>) {
        match node.take() {
            Request::OpenFileDone { result: Ok(file) } => self.release_file_ref(file),
            Request::ReadBlockDone {
                file,
                result: Ok(grant),
                ..
            } => {
                drop(grant);
                self.shared.metrics.block_retired();
                self.release_file_ref(file);
            }
            Request::WriteBlockDone {
                file,
                result: Ok(block),
                ..
            } => {
                drop(block);
                self.shared.metrics.block_retired();
                self.release_file_ref(file);
            }
            Request::OpenFileDone { result: Err(_) }
            | Request::ReadBlockDone { result: Err(_), .. }
            | Request::WriteBlockDone { result: Err(_), .. }
            | Request::CommitDone { .. } => {}
            _ => debug_assert!(false, "cleanup of a node that is not a reply"),
        }
        self.shared.pool.release(node);
    }

    /// A stream closed with replies still expected. Drain whatever is
    /// already queued; if more are in flight, mark the queue so they are
    /// reclaimed at delivery (see `complete`).
    fn cleanup_queue(&mut self, queue: Arc<ResultQueue>) {
        while let Some(node) = queue.pop() {
            self.cleanup_result(node);
        }
        if queue.expected_results() > 0 {
            queue.set_awaiting_cleanup();
        }
        self.shared.metrics.record_queue_cleaned();
    }
}

fn open_with_mode(path: &Path, mode: OpenMode) -> std::io::Result<File> {
    match mode {
        OpenMode::ReadOnly => File::open(path),
        OpenMode::ReadWriteOverwrite => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
    }
}

/// Fill `buf` from the file's current position, stopping early only at end
/// of file. A short result therefore always means EOF; mid-stream faults
/// come back as errors.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
