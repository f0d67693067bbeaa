//! Non-blocking read streams.

use std::path::PathBuf;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::request::OpenMode;
use crate::server::IoServer;
use crate::stream::{SlotState, StreamCore, StreamKind, StreamState};

/// Outcome of copying out of the head block.
enum Step {
    /// Head block still has bytes.
    Continue,
    /// Head block drained; slide the window.
    BlockEnd,
    /// Head block drained and it was the file's last.
    FinalBlockEnd,
    /// Head block failed to arrive.
    Fail(StreamError),
    /// Head block still pending; the window has run dry.
    Starved,
}

/// A file read through the streaming engine.
///
/// Every operation returns without blocking. Callers drive the stream with
/// [`poll_state`](Self::poll_state): wait for [`StreamState::OpenIdle`],
/// [`seek`](Self::seek) to the wanted position, then call
/// [`read`](Self::read) — it returns 0 until the window has buffered, and
/// afterwards delivers the file's bytes in order until EOF.
///
/// Dropping the stream closes it; `close` is never blocking and is safe
/// while requests are in flight.
pub struct ReadStream {
    core: StreamCore,
}

impl ReadStream {
    /// Open with the default prefetch window.
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
            core: StreamCore::open(server, path.into(), mode, config, StreamKind::Read)?,
        })
    }

    /// Process at most one pending reply and report the state.
    pub fn poll_state(&mut self) -> StreamState {
        self.core.poll_state()
    }

    /// The fault that latched the stream into [`StreamState::Error`], if any.
    pub fn error(&self) -> Option<StreamError> {
        self.core.error()
    }

    /// Reposition the stream. Legal in any state except `Opening` and
    /// `Error`; the old prefetch window is dropped and a new one is
    /// requested, so the next reads return 0 until buffering finishes.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.core.seek(pos)
    }

    /// Copy up to `dst.len() / item_size` items into `dst`, returning the
    /// number of whole items copied. Returns 0 in any non-streaming state;
    /// poll for the state to find out why.
    ///
    /// `item_size` must divide the server's block size and `dst` must hold a
    /// whole number of items; items never straddle blocks.
    pub fn read(&mut self, dst: &mut [u8], item_size: usize) -> usize {
        assert!(item_size > 0, "item size must be nonzero");
        assert!(
            self.core.block_bytes % item_size == 0,
            "item size must divide the block size"
        );
        assert!(
            dst.len() % item_size == 0,
            "destination must hold a whole number of items"
        );

        self.core.poll_state();
        match self.core.state {
            StreamState::Opening
            | StreamState::OpenIdle
            | StreamState::OpenEof
            | StreamState::Error => 0,
            StreamState::OpenBuffering => {
                // Drain everything already delivered; with luck that is the
                // whole window and we can stream immediately.
                while self.core.receive_one() {}
                if self.core.state != StreamState::OpenStreaming {
                    0
                } else {
                    self.stream_read(dst, item_size)
                }
            }
            StreamState::OpenStreaming => self.stream_read(dst, item_size),
        }
    }

    /// Consume the stream. Also runs on drop.
    pub fn close(mut self) {
        self.core.close();
    }

    fn stream_read(&mut self, dst: &mut [u8], item_size: usize) -> usize {
        let total = dst.len();
        let mut copied = 0;

        while copied < total {
            // Give late replies a last chance before declaring starvation.
            while matches!(
                self.core.prefetch.front().map(|slot| &slot.state),
                Some(SlotState::Pending)
            ) {
                if !self.core.receive_one() {
                    break;
                }
            }

            let step = {
                let Some(slot) = self.core.prefetch.front_mut() else {
                    debug_assert!(false, "streaming with an empty prefetch window");
                    break;
                };
                match &mut slot.state {
                    SlotState::Ready { block, at_eof, .. } => {
                        // A seek past EOF leaves the pre-roll cursor beyond
                        // the block's valid bytes; that is an empty read.
                        let available = block.valid_len().saturating_sub(slot.bytes_copied);
                        let n = available.min(total - copied);
                        if n > 0 {
                            dst[copied..copied + n].copy_from_slice(
                                &block.bytes()[slot.bytes_copied..slot.bytes_copied + n],
                            );
                            slot.bytes_copied += n;
                            copied += n;
                        }

                        let remaining = available - n;
                        debug_assert!(
                            remaining == 0 || *at_eof || remaining >= item_size,
                            "blocks must hold whole items"
                        );
                        if remaining > 0 {
                            Step::Continue
                        } else if *at_eof {
                            Step::FinalBlockEnd
                        } else {
                            Step::BlockEnd
                        }
                    }
                    SlotState::Failed(err) => Step::Fail(*err),
                    SlotState::Pending => Step::Starved,
                }
            };

            match step {
                Step::Continue => {}
                Step::BlockEnd => {
                    if self.core.advance_window().is_err() {
                        // The pool ran dry; the stream is already latched.
                        break;
                    }
                }
                Step::FinalBlockEnd => {
                    self.core.state = StreamState::OpenEof;
                    break;
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

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;
    use crate::request::FileId;
    use crate::stream::testing::{
        answer_open, fail_acquire, grant_block, idle_server, next_request, BLOCK,
    };

    fn opened_stream(server: &IoServer, inbox: &Mailbox, prefetch: usize) -> ReadStream {
        let mut stream = ReadStream::open_with(
            server,
            "take.raw",
            OpenMode::ReadOnly,
            StreamConfig {
                prefetch_blocks: prefetch,
            },
        )
        .unwrap();
        answer_open(next_request(inbox), Ok(FileId(1)));
        assert_eq!(stream.poll_state(), StreamState::OpenIdle);
        stream
    }

    #[test]
    fn test_unordered_replies_read_in_file_order() {
        let (server, inbox) = idle_server();
        let mut stream = opened_stream(&server, &inbox, 2);
        stream.seek(0).unwrap();

        // Deliver the window back to front; the FIFO restores file order.
        let req0 = next_request(&inbox);
        let req1 = next_request(&inbox);
        grant_block(req1, &[0xBB; BLOCK], false);
        grant_block(req0, &[0xAA; BLOCK], false);

        let mut buf = [0u8; BLOCK + 16];
        assert_eq!(stream.read(&mut buf, 1), BLOCK + 16);
        assert!(buf[..BLOCK].iter().all(|b| *b == 0xAA));
        assert!(buf[BLOCK..].iter().all(|b| *b == 0xBB));
        assert_eq!(stream.poll_state(), StreamState::OpenStreaming);
    }

    #[test]
    fn test_seek_preroll_skips_to_requested_byte() {
        let (server, inbox) = idle_server();
        let mut stream = opened_stream(&server, &inbox, 1);
        stream.seek(10).unwrap();

        let pattern: Vec<u8> = (0..BLOCK as u8).collect();
        grant_block(next_request(&inbox), &pattern, false);

        let mut buf = [0u8; 20];
        assert_eq!(stream.read(&mut buf, 1), 20);
        assert_eq!(&buf[..], &pattern[10..30]);
    }

    #[test]
    fn test_failed_block_surfaces_only_at_its_position() {
        let (server, inbox) = idle_server();
        let mut stream = opened_stream(&server, &inbox, 2);
        stream.seek(0).unwrap();

        grant_block(next_request(&inbox), &[0xAA; BLOCK], false);
        fail_acquire(
            next_request(&inbox),
            StreamError::Io(std::io::ErrorKind::TimedOut),
        );

        // Everything before the failed block still reads cleanly.
        let mut buf = [0u8; 32];
        assert_eq!(stream.read(&mut buf, 1), 32);
        assert!(buf.iter().all(|b| *b == 0xAA));
        assert_eq!(stream.poll_state(), StreamState::OpenStreaming);
        assert!(stream.error().is_none());

        // Crossing into the failed block latches the error.
        let mut rest = [0u8; BLOCK];
        assert_eq!(stream.read(&mut rest, 1), 32);
        assert_eq!(stream.poll_state(), StreamState::Error);
        assert_eq!(
            stream.error(),
            Some(StreamError::Io(std::io::ErrorKind::TimedOut))
        );
    }

    #[test]
    fn test_short_final_block_reaches_eof() {
        let (server, inbox) = idle_server();
        let mut stream = opened_stream(&server, &inbox, 2);
        stream.seek(0).unwrap();

        let pattern: Vec<u8> = (0..40).map(|i| i as u8).collect();
        grant_block(next_request(&inbox), &pattern, true);
        grant_block(next_request(&inbox), &[], true); // window runs past EOF

        let mut buf = [0u8; BLOCK];
        assert_eq!(stream.read(&mut buf, 1), 40);
        assert_eq!(&buf[..40], &pattern[..]);
        assert_eq!(stream.poll_state(), StreamState::OpenEof);

        // EOF is terminal for reads.
        assert_eq!(stream.read(&mut buf, 1), 0);
        assert_eq!(stream.poll_state(), StreamState::OpenEof);
    }
}
