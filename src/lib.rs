//! Real-time file streaming over a dedicated I/O worker thread.
//!
//! A latency-sensitive thread — an audio callback, a control loop — cannot
//! open files, read from disk, or wait on locks. `tapedeck` moves all of
//! that onto one blocking I/O worker and gives the client non-blocking,
//! bounded-time streams instead: every `read`/`write`/`seek`/`poll_state`
//! call performs a handful of lock-free queue operations and returns,
//! while the worker keeps a window of fixed-size blocks prefetched ahead
//! of the client's position.
//!
//! # Example
//!
//! ```ignore
//! use tapedeck::{IoServer, OpenMode, ReadStream, ServerConfig, StreamState};
//!
//! let mut server = IoServer::start(ServerConfig::default())?;
//! let mut stream = ReadStream::open(&server, "take_07.raw", OpenMode::ReadOnly)?;
//!
//! // Poll from the real-time thread; never wait.
//! while stream.poll_state() == StreamState::Opening {}
//! stream.seek(0)?;
//!
//! let mut frames = [0u8; 4096];
//! loop {
//!     match stream.poll_state() {
//!         StreamState::OpenStreaming => {
//!             let n = stream.read(&mut frames, 4);
//!             // feed `n` frames downstream...
//!         }
//!         StreamState::OpenEof | StreamState::Error => break,
//!         _ => {} // opening or buffering: emit silence this cycle
//!     }
//! }
//!
//! stream.close();
//! server.shutdown();
//! ```

pub mod config;
pub mod error;

mod block;
mod mailbox;
mod metrics;
mod pool;
mod read;
mod request;
mod result_queue;
mod server;
mod stream;
mod write;

pub use config::{ServerConfig, StreamConfig};
pub use error::{Error, Result, StreamError};
pub use metrics::MetricsSnapshot;
pub use read::ReadStream;
pub use request::OpenMode;
pub use server::IoServer;
pub use stream::StreamState;
pub use write::WriteStream;
