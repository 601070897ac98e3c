//! Engine configuration: the tunables archive, cull, and the transaction
//! pool are built from, using the same `const fn new()` + chained `with_*`
//! builder shape used throughout this workspace's config types.

use std::time::Duration;

use crate::error::{CtEngineError, CtResult};
use crate::transport::POLLED_OPEN_TIMEOUT;

/// Default maximum payload carried by a single archive/extract transaction.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Default number of SHA digests per cull-shas batch.
pub const DEFAULT_SHA_PER_PACKET: usize = 1000;

/// Default transaction pool size.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Tunable configuration for one engine instance.
#[derive(Debug, Clone, Copy)]
pub struct CtEngineConfig {
    max_block_size: usize,
    sha_per_packet: usize,
    ctfile_keep_days: Option<u32>,
    pool_capacity: usize,
    open_timeout: Duration,
}

impl CtEngineConfig {
    /// Starts from the engine's defaults; `ctfile_keep_days` is unset and
    /// must be supplied via [`CtEngineConfig::with_ctfile_keep_days`] before
    /// cull operations can run.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            sha_per_packet: DEFAULT_SHA_PER_PACKET,
            ctfile_keep_days: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            open_timeout: POLLED_OPEN_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    #[must_use]
    pub const fn with_sha_per_packet(mut self, sha_per_packet: usize) -> Self {
        self.sha_per_packet = sha_per_packet;
        self
    }

    #[must_use]
    pub const fn with_ctfile_keep_days(mut self, days: u32) -> Self {
        self.ctfile_keep_days = Some(days);
        self
    }

    #[must_use]
    pub const fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    #[must_use]
    pub const fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    #[must_use]
    pub const fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    #[must_use]
    pub const fn sha_per_packet(&self) -> usize {
        self.sha_per_packet
    }

    #[must_use]
    pub const fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Returns the configured retention window, or
    /// [`CtEngineError::MissingConfigValue`] if cull has never been
    /// configured with one.
    pub fn ctfile_keep_days(&self) -> CtResult<u32> {
        self.ctfile_keep_days
            .ok_or(CtEngineError::MissingConfigValue("ctfile_keep_days"))
    }
}

impl Default for CtEngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
