//! Client-side stream machinery shared by read and write streams.
//!
//! A stream is a prefetch FIFO of block slots sliding over the file. Slots
//! are created when an acquire request is sent, filled (or failed) when its
//! reply is matched back by ticket, and retired from the head as the client
//! consumes them. Replies arrive unordered; the FIFO is what restores file
//! order, and a reply whose ticket matches no live slot was discarded by a
//! flush and cleans itself up.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use crate::block::DataBlock;
use crate::config::StreamConfig;
use crate::error::{Error, Result, StreamError};
use crate::mailbox::{MailboxSender, ServerMsg};
use crate::request::{FileId, OpenMode, Request, Ticket};
use crate::result_queue::ResultQueue;
use crate::server::{IoServer, ServerShared};

/// Observable stream state. Drive it with `poll_state`: `Opening` until the
/// open reply lands, `OpenIdle` until the first seek, then
/// `OpenBuffering`/`OpenStreaming` as the prefetch window fills and drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the open reply.
    Opening,
    /// Open; no block window requested yet.
    OpenIdle,
    /// Window requested; the head block is not ready yet.
    OpenBuffering,
    /// Head block ready; reads or writes make progress.
    OpenStreaming,
    /// The final block has been fully consumed (read streams only).
    OpenEof,
    /// A fault is latched; only close is useful.
    Error,
}

/// Which acquire/release request kinds a stream speaks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Read,
    Write,
}

pub(crate) enum SlotState {
    /// Acquire request in flight.
    Pending,
    /// Block delivered. `node` is the pooled reply, kept so the eventual
    /// release or commit needs no allocation.
    Ready {
        node: Box<Request>,
        block: DataBlock,
        at_eof: bool,
        modified: bool,
    },
    /// The acquire failed; surfaced when the client reaches this position.
    Failed(StreamError),
}

pub(crate) struct PrefetchSlot {
    pub ticket: Ticket,
    pub position: u64,
    /// Consumption cursor within the block. Seek pre-seeds the first slot's
    /// cursor so an unaligned position skips the pre-roll bytes.
    pub bytes_copied: usize,
    pub state: SlotState,
}

pub(crate) struct StreamCore {
    kind: StreamKind,
    shared: Arc<ServerShared>,
    mailbox: MailboxSender,
    queue: Arc<ResultQueue>,
    pub(crate) state: StreamState,
    pub(crate) status: Option<StreamError>,
    file: Option<FileId>,
    /// The open reply node, retained for the stream's lifetime so `close`
    /// can issue `CloseFile` without touching the pool.
    retained: Option<Box<Request>>,
    pub(crate) prefetch: VecDeque<PrefetchSlot>,
    waiting_for_blocks: usize,
    next_ticket: u64,
    prefetch_blocks: usize,
    pub(crate) block_bytes: usize,
    closed: bool,
}

impl StreamCore {
    /// Allocate the stream structure and fire the open request. Fails only
    /// on pool exhaustion; open errors themselves arrive asynchronously.
    pub fn open(
        server: &IoServer,
        path: PathBuf,
        mode: OpenMode,
        config: StreamConfig,
        kind: StreamKind,
    ) -> Result<Self> {
        let shared = Arc::clone(server.shared());
        let block_bytes = shared.config.block_bytes;

        let Some(mut node) = shared.pool.allocate() else {
            return Err(Error::OutOfResources);
        };
        // Replies wrap pool nodes, so the pool capacity bounds what can ever
        // be queued at once.
        let queue = Arc::new(ResultQueue::new(shared.pool.capacity()));
        *node = Request::OpenFile {
            path,
            mode,
            reply_to: Arc::clone(&queue),
        };
        queue.add_expected();

        let mailbox = server.sender();
        mailbox.send(ServerMsg::Request(node));

        Ok(Self {
            kind,
            shared,
            mailbox,
            queue,
            state: StreamState::Opening,
            status: None,
            file: None,
            retained: None,
            prefetch: VecDeque::with_capacity(config.prefetch_blocks.max(1) + 1),
            waiting_for_blocks: 0,
            next_ticket: 1,
            prefetch_blocks: config.prefetch_blocks.max(1),
            block_bytes,
            closed: false,
        })
    }

    /// Process at most one reply and report the state.
    pub fn poll_state(&mut self) -> StreamState {
        if self.queue.expected_results() > 0 {
            if self.state == StreamState::Opening {
                if let Some(mut node) = self.queue.pop() {
                    match node.take() {
                        Request::OpenFileDone { result: Ok(file) } => {
                            self.file = Some(file);
                            self.state = StreamState::OpenIdle;
                        }
                        Request::OpenFileDone { result: Err(err) } => {
                            self.status = Some(err);
                            self.state = StreamState::Error;
                        }
                        _ => debug_assert!(false, "first reply must be the open result"),
                    }
                    self.retained = Some(node);
                }
            } else {
                self.receive_one();
            }
        }
        self.state
    }

    pub fn error(&self) -> Option<StreamError> {
        self.status
    }

    /// Drop the current window and request a fresh one starting at the block
    /// containing `pos`, with the first slot's cursor skipping the pre-roll.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if matches!(self.state, StreamState::Opening | StreamState::Error) {
            return Err(Error::InvalidState(self.state));
        }
        self.flush_prefetch_queue();

        let block_bytes = self.block_bytes as u64;
        let aligned = pos - pos % block_bytes;
        self.send_acquire(aligned, (pos - aligned) as usize)?;
        for k in 1..self.prefetch_blocks {
            self.send_acquire(aligned + k as u64 * block_bytes, 0)?;
        }
        self.state = StreamState::OpenBuffering;
        Ok(())
    }

    /// Drain one reply from the result queue. Returns `false` if it was
    /// empty.
    pub fn receive_one(&mut self) -> bool {
        let Some(mut node) = self.queue.pop() else {
            return false;
        };
        match node.take() {
            Request::ReadBlockDone {
                file,
                ticket,
                result,
            } => match result {
                Ok(grant) => self.accept_block(node, file, ticket, grant.block, grant.at_eof),
                Err(err) => self.fail_block(node, ticket, err),
            },
            Request::WriteBlockDone {
                file,
                ticket,
                result,
            } => match result {
                Ok(block) => self.accept_block(node, file, ticket, block, false),
                Err(err) => self.fail_block(node, ticket, err),
            },
            Request::CommitDone { result } => {
                if let Err(err) = result {
                    // A lost write is unrecoverable for the stream.
                    self.status = Some(err);
                    self.state = StreamState::Error;
                }
                self.shared.pool.release(node);
            }
            _ => {
                debug_assert!(false, "unexpected reply kind");
                self.shared.pool.release(node);
            }
        }
        true
    }

    fn accept_block(
        &mut self,
        mut node: Box<Request>,
        file: FileId,
        ticket: Ticket,
        block: DataBlock,
        at_eof: bool,
    ) {
        match self.slot_index(ticket) {
            Some(i) => {
                self.note_block_arrival();
                self.prefetch[i].state = SlotState::Ready {
                    node,
                    block,
                    at_eof,
                    modified: false,
                };
            }
            None => {
                // Discarded by a flush; hand the block straight back.
                *node = self.release_request(file, block);
                self.mailbox.send(ServerMsg::Request(node));
            }
        }
    }

    fn fail_block(&mut self, node: Box<Request>, ticket: Ticket, err: StreamError) {
        match self.slot_index(ticket) {
            Some(i) => {
                // The error is latched on the slot and surfaces only when
                // the client consumes up to this position.
                self.note_block_arrival();
                self.prefetch[i].state = SlotState::Failed(err);
                self.shared.pool.release(node);
            }
            None => self.shared.pool.release(node),
        }
    }

    fn slot_index(&self, ticket: Ticket) -> Option<usize> {
        self.prefetch.iter().position(|slot| slot.ticket == ticket)
    }

    fn note_block_arrival(&mut self) {
        self.waiting_for_blocks -= 1;
        // Only a buffering stream may start streaming; late replies must not
        // resurrect one that already hit EOF or an error.
        if self.waiting_for_blocks == 0 && self.state == StreamState::OpenBuffering {
            self.state = StreamState::OpenStreaming;
        }
    }

    fn release_request(&self, file: FileId, block: DataBlock) -> Request {
        match self.kind {
            StreamKind::Read => Request::ReleaseReadBlock { file, block },
            StreamKind::Write => Request::ReleaseWriteBlock { file, block },
        }
    }

    /// Send one block acquire at `position` and link its slot at the tail.
    /// On pool exhaustion the stream is latched into `Error`.
    fn send_acquire(&mut self, position: u64, skip: usize) -> Result<()> {
        let Some(file) = self.file else {
            debug_assert!(false, "acquire before the file opened");
            self.state = StreamState::Error;
            return Err(Error::InvalidState(self.state));
        };
        let Some(mut node) = self.shared.pool.allocate() else {
            self.status = Some(StreamError::OutOfResources);
            self.state = StreamState::Error;
            return Err(Error::OutOfResources);
        };

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        *node = match self.kind {
            StreamKind::Read => Request::ReadBlock {
                file,
                position,
                ticket,
                reply_to: Arc::clone(&self.queue),
            },
            StreamKind::Write => Request::AllocateWriteBlock {
                file,
                position,
                ticket,
                reply_to: Arc::clone(&self.queue),
            },
        };
        self.prefetch.push_back(PrefetchSlot {
            ticket,
            position,
            bytes_copied: skip,
            state: SlotState::Pending,
        });
        self.queue.add_expected();
        self.waiting_for_blocks += 1;
        self.mailbox.send(ServerMsg::Request(node));
        Ok(())
    }

    /// Extend the window by one acquire at the tail, retire the head slot to
    /// the server, and opportunistically take one reply. The new tail is
    /// linked before the head comes off, so the window never goes empty.
    pub fn advance_window(&mut self) -> Result<()> {
        let Some(tail) = self.prefetch.back() else {
            debug_assert!(false, "advancing an empty window");
            return Ok(());
        };
        let next = tail.position + self.block_bytes as u64;
        self.send_acquire(next, 0)?;
        if let Some(head) = self.prefetch.pop_front() {
            self.flush_slot(head);
        }
        self.receive_one();
        Ok(())
    }

    /// Retire every slot in the window: pending acquires are left to clean
    /// themselves up when their reply arrives, ready blocks go back to the
    /// server (committed first if modified), failed slots hold nothing.
    pub fn flush_prefetch_queue(&mut self) {
        while let Some(slot) = self.prefetch.pop_front() {
            self.flush_slot(slot);
        }
        debug_assert_eq!(self.waiting_for_blocks, 0);
    }

    fn flush_slot(&mut self, slot: PrefetchSlot) {
        match slot.state {
            SlotState::Pending => {
                // The reply's ticket will match no live slot and the block
                // will be handed straight back; see `accept_block`.
                self.waiting_for_blocks -= 1;
            }
            SlotState::Ready {
                mut node,
                block,
                modified,
                ..
            } => {
                let Some(file) = self.file else {
                    debug_assert!(false, "ready slot without an open file");
                    self.shared.pool.release(node);
                    return;
                };
                if modified {
                    *node = Request::CommitWriteBlock {
                        file,
                        position: slot.position,
                        block,
                        reply_to: Arc::clone(&self.queue),
                    };
                    self.queue.add_expected();
                } else {
                    *node = self.release_request(file, block);
                }
                self.mailbox.send(ServerMsg::Request(node));
            }
            SlotState::Failed(_) => {}
        }
    }

    /// Tear the stream down without waiting. Safe to call with requests in
    /// flight: the open node becomes the close request, and a queue with
    /// replies still expected is handed to the server for cleanup.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.state == StreamState::Opening {
            // The open reply has not been claimed; the server reclaims
            // everything, including the file if the open succeeded.
            self.mailbox
                .send(ServerMsg::CleanupResultQueue(Arc::clone(&self.queue)));
            return;
        }

        self.flush_prefetch_queue();

        if let Some(mut node) = self.retained.take() {
            match self.file {
                Some(file) => {
                    *node = Request::CloseFile { file };
                    self.mailbox.send(ServerMsg::Request(node));
                }
                None => self.shared.pool.release(node),
            }
        }

        if self.queue.expected_results() > 0 {
            self.mailbox
                .send(ServerMsg::CleanupResultQueue(Arc::clone(&self.queue)));
        }
    }
}

/// Hand-driven stand-in for the I/O worker: tests pop requests from an idle
/// server's mailbox and answer them in place, so every slot and state
/// transition can be checked without threads or timing.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::ServerConfig;
    use crate::mailbox::Mailbox;
    use crate::request::BlockGrant;

    pub(crate) const BLOCK: usize = 64;

    pub(crate) fn idle_server() -> (IoServer, Mailbox) {
        IoServer::idle(ServerConfig {
            request_pool_capacity: 16,
            block_bytes: BLOCK,
        })
    }

    /// Pop the next pooled request from the mailbox.
    pub(crate) fn next_request(inbox: &Mailbox) -> Box<Request> {
        match inbox.try_recv() {
            Some(ServerMsg::Request(node)) => node,
            Some(_) => panic!("expected a pooled request"),
            None => panic!("mailbox is empty"),
        }
    }

    /// Answer an open request in place, as the worker would.
    pub(crate) fn answer_open(
        mut node: Box<Request>,
        result: std::result::Result<FileId, StreamError>,
    ) {
        match node.take() {
            Request::OpenFile { reply_to, .. } => {
                *node = Request::OpenFileDone { result };
                push_reply(reply_to, node);
            }
            _ => panic!("expected an open request"),
        }
    }

    /// Answer a read or write acquire with a block holding `bytes`.
    pub(crate) fn grant_block(mut node: Box<Request>, bytes: &[u8], at_eof: bool) {
        let mut block = DataBlock::new(BLOCK);
        block.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        block.set_valid_len(bytes.len());
        match node.take() {
            Request::ReadBlock {
                file,
                ticket,
                reply_to,
                ..
            } => {
                *node = Request::ReadBlockDone {
                    file,
                    ticket,
                    result: Ok(BlockGrant { block, at_eof }),
                };
                push_reply(reply_to, node);
            }
            Request::AllocateWriteBlock {
                file,
                ticket,
                reply_to,
                ..
            } => {
                *node = Request::WriteBlockDone {
                    file,
                    ticket,
                    result: Ok(block),
                };
                push_reply(reply_to, node);
            }
            _ => panic!("expected an acquire request"),
        }
    }

    /// Answer a read or write acquire with a failure.
    pub(crate) fn fail_acquire(mut node: Box<Request>, err: StreamError) {
        match node.take() {
            Request::ReadBlock {
                file,
                ticket,
                reply_to,
                ..
            } => {
                *node = Request::ReadBlockDone {
                    file,
                    ticket,
                    result: Err(err),
                };
                push_reply(reply_to, node);
            }
            Request::AllocateWriteBlock {
                file,
                ticket,
                reply_to,
                ..
            } => {
                *node = Request::WriteBlockDone {
                    file,
                    ticket,
                    result: Err(err),
                };
                push_reply(reply_to, node);
            }
            _ => panic!("expected an acquire request"),
        }
    }

    /// Answer a commit with a failure, as a full disk would.
    pub(crate) fn fail_commit(mut node: Box<Request>, err: StreamError) {
        match node.take() {
            Request::CommitWriteBlock { reply_to, .. } => {
                *node = Request::CommitDone { result: Err(err) };
                push_reply(reply_to, node);
            }
            _ => panic!("expected a commit request"),
        }
    }

    fn push_reply(reply_to: Arc<ResultQueue>, node: Box<Request>) {
        if reply_to.push(node).is_err() {
            panic!("result queue full");
        }
    }
}
