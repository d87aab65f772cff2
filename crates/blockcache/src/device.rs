//! Storage backends consumed by the cache.
//!
//! The cache talks to stable storage through [`BlockStore`]: synchronous
//! whole-block reads and writes addressed by [`BlockTag`]. Both operations
//! block the calling thread until complete. Two implementations are
//! provided: a file-per-device backend using `pread`/`pwrite` style I/O and
//! an in-memory backend for tests and benchmarks.

use blockcache_error::{CacheError, Result};
use blockcache_types::{BlockSize, BlockTag, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Synchronous block-addressed storage.
///
/// `read_block` and `write_block` transfer exactly one block; the caller's
/// slice length MUST equal `block_size()`.
pub trait BlockStore: Send + Sync {
    /// Block payload size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Fill `buf` with the on-device contents of `tag`.
    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` as the on-device contents of `tag`.
    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_len(buf_len: usize, block_size: BlockSize) -> Result<()> {
    let expected = block_size.as_usize();
    if buf_len != expected {
        return Err(CacheError::SizeMismatch {
            got: buf_len,
            expected,
        });
    }
    Ok(())
}

// ── File-backed store ──────────────────────────────────────────────────────

#[derive(Debug)]
struct FileDev {
    file: Arc<File>,
    block_count: u64,
}

/// File-per-device store using `std::os::unix::fs::FileExt`, which is
/// thread-safe and does not require a shared seek position.
///
/// Devices are attached before the store is handed to the cache; the map
/// is read-only afterwards.
#[derive(Debug)]
pub struct FileBlockStore {
    devices: HashMap<DeviceId, FileDev>,
    block_size: BlockSize,
}

impl FileBlockStore {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            devices: HashMap::new(),
            block_size,
        }
    }

    /// Attach a device image. Opens read-write if possible, read-only
    /// otherwise; the image length must be block-aligned.
    pub fn attach(&mut self, device: DeviceId, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .or_else(|_| OpenOptions::new().read(true).open(path.as_ref()))?;
        let len = file.metadata()?.len();
        let block_size = u64::from(self.block_size.get());
        if len % block_size != 0 {
            return Err(CacheError::Geometry(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        self.devices.insert(
            device,
            FileDev {
                file: Arc::new(file),
                block_count: len / block_size,
            },
        );
        Ok(())
    }

    fn device(&self, tag: BlockTag) -> Result<&FileDev> {
        let dev = self
            .devices
            .get(&tag.device)
            .ok_or(CacheError::UnknownDevice {
                device: tag.device.0,
            })?;
        if tag.block.0 >= dev.block_count {
            return Err(CacheError::OutOfRange {
                device: tag.device.0,
                block: tag.block.0,
                block_count: dev.block_count,
            });
        }
        Ok(dev)
    }

    fn offset(&self, tag: BlockTag) -> Result<u64> {
        self.block_size
            .block_to_byte(tag.block)
            .ok_or(CacheError::OutOfRange {
                device: tag.device.0,
                block: tag.block.0,
                block_count: 0,
            })
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len(), self.block_size)?;
        let dev = self.device(tag)?;
        dev.file.read_exact_at(buf, self.offset(tag)?)?;
        Ok(())
    }

    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()> {
        check_len(buf.len(), self.block_size)?;
        let dev = self.device(tag)?;
        dev.file.write_all_at(buf, self.offset(tag)?)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        for dev in self.devices.values() {
            dev.file.sync_all()?;
        }
        Ok(())
    }
}

// ── In-memory store (for testing and benchmarking) ─────────────────────────

/// In-memory store: one `Vec<u8>` image per attached device.
///
/// Eliminates disk latency to isolate cache behavior in tests and benches.
#[derive(Debug)]
pub struct MemBlockStore {
    images: Mutex<HashMap<DeviceId, Vec<u8>>>,
    block_size: BlockSize,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            block_size,
        }
    }

    /// Attach a zero-filled device of `block_count` blocks.
    pub fn attach(&self, device: DeviceId, block_count: u64) {
        let len = self.block_size.as_usize() * usize::try_from(block_count).unwrap_or(0);
        self.images.lock().insert(device, vec![0_u8; len]);
    }

    fn range(&self, tag: BlockTag, image_len: usize) -> Result<(usize, usize)> {
        let size = self.block_size.as_usize();
        let start = usize::try_from(tag.block.0)
            .ok()
            .and_then(|b| b.checked_mul(size))
            .ok_or(CacheError::OutOfRange {
                device: tag.device.0,
                block: tag.block.0,
                block_count: (image_len / size) as u64,
            })?;
        let end = start + size;
        if end > image_len {
            return Err(CacheError::OutOfRange {
                device: tag.device.0,
                block: tag.block.0,
                block_count: (image_len / size) as u64,
            });
        }
        Ok((start, end))
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len(), self.block_size)?;
        let images = self.images.lock();
        let image = images.get(&tag.device).ok_or(CacheError::UnknownDevice {
            device: tag.device.0,
        })?;
        let (start, end) = self.range(tag, image.len())?;
        buf.copy_from_slice(&image[start..end]);
        Ok(())
    }

    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()> {
        check_len(buf.len(), self.block_size)?;
        let mut images = self.images.lock();
        let image = images
            .get_mut(&tag.device)
            .ok_or(CacheError::UnknownDevice {
                device: tag.device.0,
            })?;
        let (start, end) = self.range(tag, image.len())?;
        image[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(tag, buf)
    }

    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()> {
        (**self).write_block(tag, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}
