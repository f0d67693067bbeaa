//! Request and reply messages exchanged with the I/O worker.
//!
//! One pooled [`Request`] node carries each message through its whole
//! lifecycle: the client fills in a request variant, the server rewrites it
//! in place into the matching reply, and release/commit traffic reuses the
//! same node on the way back. The node returns to the pool only when no
//! server-side resource (data block, file-record reference) depends on it.

use std::path::PathBuf;
use std::sync::Arc;

use crate::block::DataBlock;
use crate::error::StreamError;
use crate::result_queue::ResultQueue;

/// Server-private key into the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId(pub(crate) u64);

/// Client-assigned id matching unordered replies back to prefetch slots.
///
/// A reply whose ticket no longer matches a live slot was discarded by a
/// flush; the client turns it into a release (or frees it) on sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket(pub(crate) u64);

/// How a stream opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Existing file, read only.
    #[default]
    ReadOnly,
    /// Create or truncate, read and write.
    ReadWriteOverwrite,
}

/// A successfully read block together with its end-of-file marker.
pub(crate) struct BlockGrant {
    pub block: DataBlock,
    pub at_eof: bool,
}

pub(crate) enum Request {
    /// Pooled idle state.
    Vacant,

    OpenFile {
        path: PathBuf,
        mode: OpenMode,
        reply_to: Arc<ResultQueue>,
    },
    OpenFileDone {
        result: Result<FileId, StreamError>,
    },
    /// Releases the reference the open established; fire-and-forget.
    CloseFile {
        file: FileId,
    },

    ReadBlock {
        file: FileId,
        position: u64,
        ticket: Ticket,
        reply_to: Arc<ResultQueue>,
    },
    ReadBlockDone {
        file: FileId,
        ticket: Ticket,
        result: Result<BlockGrant, StreamError>,
    },
    ReleaseReadBlock {
        file: FileId,
        block: DataBlock,
    },

    AllocateWriteBlock {
        file: FileId,
        position: u64,
        ticket: Ticket,
        reply_to: Arc<ResultQueue>,
    },
    WriteBlockDone {
        file: FileId,
        ticket: Ticket,
        result: Result<DataBlock, StreamError>,
    },
    CommitWriteBlock {
        file: FileId,
        position: u64,
        block: DataBlock,
        reply_to: Arc<ResultQueue>,
    },
    CommitDone {
        result: Result<(), StreamError>,
    },
    ReleaseWriteBlock {
        file: FileId,
        block: DataBlock,
    },
}

impl Request {
    /// Move the payload out, leaving the node `Vacant` for in-place reuse.
    pub fn take(&mut self) -> Request {
        std::mem::replace(self, Request::Vacant)
    }
}
