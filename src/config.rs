//! Engine configuration.

/// Server-wide tuning, fixed at [`IoServer::start`](crate::IoServer::start).
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Number of pre-allocated request nodes. Default: 256.
    ///
    /// Every in-flight request, queued reply, and open stream consumes one
    /// node; exhaustion surfaces as `Error::OutOfResources` on `open`/`seek`.
    pub request_pool_capacity: usize,
    /// Bytes per data block. Default: 64 KiB.
    pub block_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_pool_capacity: 256,
            block_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            request_pool_capacity: capacity.max(2), // one stream needs an open node plus a block node
            ..Default::default()
        }
    }
}

/// Per-stream tuning, chosen at `open`.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Blocks kept in flight ahead of the read/write cursor. Default: 20.
    pub prefetch_blocks: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { prefetch_blocks: 20 }
    }
}

impl StreamConfig {
    /// Size the prefetch window to cover `seconds` of streaming at
    /// `bytes_per_second`, given the server's block size.
    pub fn for_rate(bytes_per_second: u64, seconds: f64, block_bytes: usize) -> Self {
        let bytes = (bytes_per_second as f64 * seconds).ceil() as u64;
        let blocks = bytes.div_ceil(block_bytes as u64) as usize;
        Self {
            prefetch_blocks: blocks.max(2),
        }
    }
}
