//! Configuration for pool creation
//!
//! Provides size presets and a validation pass that `Pool::create`
//! runs before touching the filesystem.

use crate::format::{LOG_HEADER_SIZE, PAGE_SIZE, POOL_HEADER_SIZE};

/// Smallest pool the layout accepts (1 MiB)
pub const MIN_POOL_SIZE: u64 = 1024 * 1024;

/// Pool creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total size of the pool file in bytes
    pub pool_size: u64,
    /// Bytes reserved for the undo log, including its header
    pub log_capacity: u64,
    /// Unix permission bits for a newly created pool file
    pub mode: u32,
}

impl PoolConfig {
    /// 10 MiB pool with a 256 KiB undo log, owner read/write
    pub fn standard() -> Self {
        Self {
            pool_size: 10 * 1024 * 1024,
            log_capacity: 256 * 1024,
            mode: 0o600,
        }
    }

    /// 2 MiB pool with a 64 KiB undo log, owner read/write
    pub fn compact() -> Self {
        Self {
            pool_size: 2 * 1024 * 1024,
            log_capacity: 64 * 1024,
            mode: 0o600,
        }
    }

    /// Override the pool size.
    pub fn with_pool_size(mut self, pool_size: u64) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Override the permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(format!("pool_size must be >= {} bytes", MIN_POOL_SIZE));
        }
        if self.pool_size % PAGE_SIZE != 0 {
            return Err(format!("pool_size must be a multiple of {}", PAGE_SIZE));
        }
        if self.log_capacity % PAGE_SIZE != 0 {
            return Err(format!("log_capacity must be a multiple of {}", PAGE_SIZE));
        }
        if self.log_capacity < 4 * PAGE_SIZE {
            return Err("log_capacity must be >= 16KB".into());
        }
        if self.log_capacity <= LOG_HEADER_SIZE as u64
            || self.log_capacity + POOL_HEADER_SIZE as u64 > self.pool_size / 4
        {
            return Err("log_capacity must leave at least 3/4 of the pool for objects".into());
        }
        if self.mode & 0o600 != 0o600 {
            return Err("mode must grant the owner read and write".into());
        }
        if self.mode > 0o777 {
            return Err("mode must only contain permission bits".into());
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self { Self::standard() }
}
