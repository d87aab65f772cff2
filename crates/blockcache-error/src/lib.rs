#![forbid(unsafe_code)]
//! Error types for the blockcache workspace.
//!
//! # Error Taxonomy
//!
//! Two layers, kept in separate crates to avoid cyclic dependencies:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Configuration | `GeometryError` | `blockcache-types` | Rejected geometry at construction |
//! | Runtime | `CacheError` | `blockcache-error` (this crate) | Cache and backend faults |
//!
//! `blockcache-error` MUST NOT depend on `blockcache-types`; variants carry
//! plain integers and the boundary conversion (`GeometryError` →
//! `CacheError::Geometry`) lives in the core crate.
//!
//! ## Retryability
//!
//! `PoolExhausted` is the single fault that originates inside the cache
//! itself. It is fatal by design: the pool is statically sized, so
//! exhaustion means every buffer is referenced system-wide and a retry
//! cannot succeed until some holder releases. Raising it never mutates any
//! buffer's tag or refcount. Backend faults (`Io`, `UnknownDevice`,
//! `OutOfRange`, `SizeMismatch`) are propagated for the caller to handle;
//! a failed load leaves the affected buffer invalid so the next acquirer
//! retries the read, and a buffer handle is never returned half-initialized.

use thiserror::Error;

/// Unified error type for all blockcache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error from the storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every buffer in every shard has a positive refcount.
    ///
    /// Fatal and non-retryable: the pool is fixed-size, so this indicates
    /// a system-wide overcommit by the calling layers, not a transient
    /// condition.
    #[error("buffer pool exhausted: all {total_buffers} buffers are referenced")]
    PoolExhausted { total_buffers: usize },

    /// A request named a device the backend has never attached.
    #[error("unknown device: {device}")]
    UnknownDevice { device: u32 },

    /// Block number past the end of the device.
    #[error("block out of range: device {device} block {block} block_count {block_count}")]
    OutOfRange {
        device: u32,
        block: u64,
        block_count: u64,
    },

    /// Payload length does not match the backend block size.
    #[error("payload size mismatch: got {got} expected {expected}")]
    SizeMismatch { got: usize, expected: usize },

    /// Rejected cache geometry (converted from `GeometryError` at the core
    /// crate boundary).
    #[error("invalid cache geometry: {0}")]
    Geometry(String),
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
