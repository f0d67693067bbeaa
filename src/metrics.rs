//! I/O worker statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the worker thread. The two gauges double as leak
/// detectors: once every stream is closed and the server has drained, both
/// return to zero.
#[derive(Default)]
pub(crate) struct ServerMetrics {
    requests_handled: AtomicU64,
    /// Gauge: files currently open on the server.
    open_files: AtomicU64,
    /// Gauge: data blocks granted to clients and not yet retired.
    blocks_outstanding: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    queues_cleaned: AtomicU64,
}

impl ServerMetrics {
    #[inline]
    pub fn record_request(&self) {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn block_granted(&self) {
        self.blocks_outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_retired(&self) {
        self.blocks_outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_bytes(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_bytes(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_cleaned(&self) {
        self.queues_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            open_files: self.open_files.load(Ordering::Relaxed),
            blocks_outstanding: self.blocks_outstanding.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            queues_cleaned: self.queues_cleaned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_handled: u64,
    pub open_files: u64,
    pub blocks_outstanding: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub queues_cleaned: u64,
}
