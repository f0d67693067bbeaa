//! Error types.

use thiserror::Error;

use crate::stream::StreamState;

/// Error type for synchronous engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Request pool exhausted.
    #[error("request pool exhausted")]
    OutOfResources,

    /// Operation is not legal in the stream's current state.
    #[error("operation not legal in stream state {0:?}")]
    InvalidState(StreamState),

    /// Failed to spawn the I/O worker thread.
    #[error("failed to spawn I/O worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Fault latched on a stream by an asynchronous reply.
///
/// Unlike [`Error`], these arrive after the call that caused them; the
/// stream reports them through `error()` once it has entered
/// [`StreamState::Error`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The server hit an I/O fault opening, reading, or writing.
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),

    /// Request pool exhausted while extending the prefetch window.
    #[error("request pool exhausted")]
    OutOfResources,

    /// The file record is no longer open on the server.
    #[error("file is no longer open on the server")]
    StaleHandle,
}

impl From<&std::io::Error> for StreamError {
    fn from(err: &std::io::Error) -> Self {
        StreamError::Io(err.kind())
    }
}
