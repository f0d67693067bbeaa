//! Non-blocking write streams.
//!
//! The mirror of [`ReadStream`](crate::ReadStream): the window holds blocks
//! acquired for writing (preloaded with whatever the file already contains),
//! the client copies into them, and retired blocks are committed back when
//! they were touched or released untouched. Commit failures come back as
//! replies and latch the stream, so lost writes are never silent.

use std::path::PathBuf;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::request::OpenMode;
use crate::server::IoServer;
use crate::stream::{SlotState, StreamCore, StreamKind, StreamState};

enum Step {
    Continue,
    BlockEnd,
    Fail(StreamError),
    Starved,
}

/// A file written through the streaming engine.
///
/// Driven exactly like a read stream: poll to `OpenIdle`, `seek` to position
/// the window, then `write` copies caller bytes into prefetched blocks and
/// returns 0 whenever the window has not buffered yet. Closing (or dropping)
/// commits every modified block still in the window.
pub struct WriteStream {
    core: StreamCore,
}

impl WriteStream {
    /// Open with the default prefetch window. Writing wants
    /// [`OpenMode::ReadWriteOverwrite`]; read-only opens succeed but every
    /// commit will fail.
    pub fn open(server: &IoServer, path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        Self::open_with(server, path, mode, StreamConfig::default())
    }

    pub fn open_with(
        server: &IoServer,
        path: impl Into<PathBuf>,
        mode: OpenMode,
        config: StreamConfig,
    ) -> Result<Self> {
        Ok(Self {
            core: StreamCore::open(server, path.into(), mode, config, StreamKind::Write)?,
        })
    }

    /// Process at most one pending reply and report the state.
    pub fn poll_state(&mut self) -> StreamState {
        self.core.poll_state()
    }

    /// The fault that latched the stream into [`StreamState::Error`], if
    /// any — including surfaced commit failures.
    pub fn error(&self) -> Option<StreamError> {
        self.core.error()
    }

    /// Reposition the stream; drops the current window, committing modified
    /// blocks on the way out.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.core.seek(pos)
    }

    /// Copy up to `src.len() / item_size` items from `src` into the stream,
    /// returning the number of whole items accepted. Returns 0 in any
    /// non-streaming state.
    ///
    /// `item_size` must divide the server's block size and `src` must hold a
    /// whole number of items.
    pub fn write(&mut self, src: &[u8], item_size: usize) -> usize {
        assert!(item_size > 0, "item size must be nonzero");
        assert!(
            self.core.block_bytes % item_size == 0,
            "item size must divide the block size"
        );
        assert!(
            src.len() % item_size == 0,
            "source must hold a whole number of items"
        );

        self.core.poll_state();
        match self.core.state {
            StreamState::Opening
            | StreamState::OpenIdle
            | StreamState::OpenEof
            | StreamState::Error => 0,
            StreamState::OpenBuffering => {
                while self.core.receive_one() {}
                if self.core.state != StreamState::OpenStreaming {
                    0
                } else {
                    self.stream_write(src, item_size)
                }
            }
            StreamState::OpenStreaming => self.stream_write(src, item_size),
        }
    }

    /// Consume the stream, committing modified blocks. Also runs on drop.
    pub fn close(mut self) {
        self.core.close();
    }

    fn stream_write(&mut self, src: &[u8], item_size: usize) -> usize {
        let total = src.len();
        let mut copied = 0;

        while copied < total {
            while matches!(
                self.core.prefetch.front().map(|slot| &slot.state),
                Some(SlotState::Pending)
            ) {
                if !self.core.receive_one() {
                    break;
                }
            }
            // A surfaced commit failure latches the stream mid-loop.
            if self.core.state == StreamState::Error {
                break;
            }

            let step = {
                let Some(slot) = self.core.prefetch.front_mut() else {
                    debug_assert!(false, "streaming with an empty prefetch window");
                    break;
                };
                match &mut slot.state {
                    SlotState::Ready {
                        block, modified, ..
                    } => {
                        let space = block.capacity() - slot.bytes_copied;
                        let n = space.min(total - copied);
                        block.bytes_mut()[slot.bytes_copied..slot.bytes_copied + n]
                            .copy_from_slice(&src[copied..copied + n]);
                        slot.bytes_copied += n;
                        copied += n;
                        *modified = true;
                        if block.valid_len() < slot.bytes_copied {
                            block.set_valid_len(slot.bytes_copied);
                        }

                        if slot.bytes_copied == block.capacity() {
                            Step::BlockEnd
                        } else {
                            Step::Continue
                        }
                    }
                    SlotState::Failed(err) => Step::Fail(*err),
                    SlotState::Pending => Step::Starved,
                }
            };

            match step {
                Step::Continue => {}
                Step::BlockEnd => {
                    // Retiring the head commits it; see `flush_slot`. The
                    // opportunistic receive may surface a commit failure.
                    if self.core.advance_window().is_err()
                        || self.core.state == StreamState::Error
                    {
                        break;
                    }
                }
                Step::Fail(err) => {
                    self.core.status = Some(err);
                    self.core.state = StreamState::Error;
                    break;
                }
                Step::Starved => {
                    self.core.state = StreamState::OpenBuffering;
                    break;
                }
            }
        }

        copied / item_size
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        self.core.close();
    }
}
