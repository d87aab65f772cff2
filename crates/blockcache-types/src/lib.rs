#![forbid(unsafe_code)]
//! Unit-carrying identifiers and build-time cache geometry.
//!
//! These are wrapper types to prevent mixing block numbers, device ids,
//! and shard indices. Geometry is validated once at construction; nothing
//! here is runtime-adjustable after a cache is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable identifier for one attached block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Block number within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Cache identity of one storage block: `(device, block number)`.
///
/// At most one buffer in the pool carries a given tag with a positive
/// refcount at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockTag {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockTag {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev={} block={}", self.device.0, self.block.0)
    }
}

/// Validated block payload size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Payload size as a `usize` for buffer allocation.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of `block` on a device with this block size.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Default pool size: enough for three concurrent multi-block operations.
pub const DEFAULT_BUFFER_COUNT: usize = 30;

/// Default shard count. A small prime spreads consecutive block numbers
/// across shards without blockno/shard correlation.
pub const DEFAULT_SHARD_COUNT: usize = 13;

/// Default block payload size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Fixed, build-time cache geometry: pool size, shard count, block size.
///
/// Constructed once and handed to the cache; the pool is never resized.
/// A prime `shard_count` is recommended for even distribution but not
/// enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    total_buffers: usize,
    shard_count: usize,
    block_size: BlockSize,
}

impl CacheGeometry {
    pub fn new(
        total_buffers: usize,
        shard_count: usize,
        block_size: BlockSize,
    ) -> Result<Self, GeometryError> {
        if total_buffers == 0 {
            return Err(GeometryError::InvalidField {
                field: "total_buffers",
                reason: "must be at least 1",
            });
        }
        if shard_count == 0 {
            return Err(GeometryError::InvalidField {
                field: "shard_count",
                reason: "must be at least 1",
            });
        }
        if shard_count > total_buffers {
            return Err(GeometryError::InvalidField {
                field: "shard_count",
                reason: "must not exceed total_buffers",
            });
        }
        Ok(Self {
            total_buffers,
            shard_count,
            block_size,
        })
    }

    #[must_use]
    pub fn total_buffers(&self) -> usize {
        self.total_buffers
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Home shard for a block number: `block mod shard_count`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // result < shard_count, a usize
    pub fn shard_of(&self, block: BlockNumber) -> usize {
        (block.0 % self.shard_count as u64) as usize
    }
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            total_buffers: DEFAULT_BUFFER_COUNT,
            shard_count: DEFAULT_SHARD_COUNT,
            block_size: BlockSize(DEFAULT_BLOCK_SIZE),
        }
    }
}

/// Rejected cache geometry or field value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}
