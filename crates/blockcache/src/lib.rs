#![forbid(unsafe_code)]
//! Concurrent, hash-sharded block buffer cache.
//!
//! A statically-sized pool of block buffers shared by all threads, sitting
//! between higher filesystem layers and a [`BlockStore`] backend. Caching
//! blocks in memory reduces device reads and provides the serialization
//! point for blocks used by multiple threads: only one holder at a time
//! can use a buffer's payload.
//!
//! Interface:
//! * [`BufCache::read`] returns an exclusively-held buffer loaded with a
//!   block's contents.
//! * After changing the payload, [`BufGuard::flush`] writes it back.
//! * Dropping (or [`BufGuard::release`]) ends exclusive access and requeues
//!   the buffer at the most-recently-used end of its shard.
//! * [`BufGuard::pin`] keeps a buffer resident across acquire/release
//!   cycles without holding the exclusive lock.
//!
//! # Sharding and lock discipline
//!
//! Buffers are partitioned across independently-locked shards; a block's
//! home shard is `block mod shard_count`. On a miss with no free buffer in
//! the home shard, a victim is stolen from another shard. The miss path
//! releases the home shard's lock before scanning foreign shards,
//! revalidates the lookup after choosing a victim, and re-checks the home
//! shard once more before reporting exhaustion, so at most one shard
//! lock is ever held by a thread and no lock-ordering cycle can form
//! between two threads whose home/foreign shards are swapped. The only
//! lock a thread blocks on while holding nothing else it needs is the
//! per-buffer frame mutex, and no frame mutex is ever acquired while a
//! shard lock is held.

mod device;
mod shard;

pub use device::{BlockStore, FileBlockStore, MemBlockStore};

use blockcache_error::{CacheError, Result};
use blockcache_types::{BlockNumber, BlockTag, CacheGeometry, DeviceId};
use parking_lot::{Mutex, MutexGuard};
use shard::{BufMeta, Shard};
use std::ops::{Deref, DerefMut};

/// One block-sized payload slot. The surrounding mutex is the buffer's
/// exclusive lock; `valid` lives in the shard metadata, not here.
#[derive(Debug)]
struct Frame {
    data: Box<[u8]>,
}

/// Counters for cache activity, snapshot via [`BufCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups satisfied by a resident buffer.
    pub hits: u64,
    /// Lookups that had to claim a victim buffer.
    pub misses: u64,
    /// Misses satisfied within the home shard.
    pub home_evictions: u64,
    /// Misses satisfied by stealing from a foreign shard.
    pub steals: u64,
    /// Block loads issued to the backend.
    pub loads: u64,
    /// Block flushes issued to the backend.
    pub flushes: u64,
    /// Lookups that failed with pool exhaustion.
    pub exhaustions: u64,
}

/// The buffer pool, shard table, and controller in one owning value.
///
/// Constructed once at startup and passed by reference to all call sites;
/// the pool and shard count are fixed for its whole lifetime.
#[derive(Debug)]
pub struct BufCache<S: BlockStore> {
    store: S,
    geometry: CacheGeometry,
    shards: Vec<Mutex<Shard>>,
    frames: Vec<Mutex<Frame>>,
    stats: Mutex<CacheStats>,
}

impl<S: BlockStore> BufCache<S> {
    /// Build the pool: every buffer is created here, distributed
    /// round-robin across shards, and never individually freed.
    pub fn new(store: S, geometry: CacheGeometry) -> Result<Self> {
        if store.block_size() != geometry.block_size() {
            return Err(CacheError::Geometry(format!(
                "store block size {} does not match geometry block size {}",
                store.block_size().get(),
                geometry.block_size().get()
            )));
        }

        let mut shards: Vec<Mutex<Shard>> = (0..geometry.shard_count())
            .map(|_| Mutex::new(Shard::new()))
            .collect();
        for idx in 0..geometry.total_buffers() {
            shards[idx % geometry.shard_count()]
                .get_mut()
                .insert_mru(idx, BufMeta::unassigned());
        }

        let payload = geometry.block_size().as_usize();
        let frames = (0..geometry.total_buffers())
            .map(|_| {
                Mutex::new(Frame {
                    data: vec![0_u8; payload].into_boxed_slice(),
                })
            })
            .collect();

        Ok(Self {
            store,
            geometry,
            shards,
            frames,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Look up or allocate the buffer for `(device, block)` and take
    /// exclusive access to it.
    ///
    /// The returned guard's payload is only trustworthy if
    /// [`BufGuard::is_valid`] reports true; [`BufCache::read`] layers the
    /// backend load on top. Blocks if another thread holds the same
    /// buffer. Fails with [`CacheError::PoolExhausted`] if every buffer in
    /// every shard is referenced, mutating nothing.
    pub fn acquire(&self, device: DeviceId, block: BlockNumber) -> Result<BufGuard<'_, S>> {
        let tag = BlockTag::new(device, block);
        let home = self.geometry.shard_of(block);

        if let Some(guard) = self.home_lookup_or_claim(home, tag) {
            return Ok(guard);
        }

        // Home shard exhausted. Scan the other shards exactly once,
        // starting adjacent to home, holding one shard lock at a time.
        for step in 1..self.geometry.shard_count() {
            let foreign_id = (home + step) % self.geometry.shard_count();
            let stolen = {
                let mut foreign = self.shards[foreign_id].lock();
                foreign.victim().map(|idx| {
                    // Claim before unlocking so no other thread can pick
                    // the same victim.
                    foreign.get_mut(idx).refcount = 1;
                    (idx, foreign.remove(idx))
                })
            };
            let Some((idx, mut meta)) = stolen else {
                continue;
            };

            // The buffer is privately owned here: referenced, linked in no
            // shard, unobservable by lookups of its old or new key.
            meta.tag = Some(tag);
            meta.valid = false;

            let mut shard = self.shards[home].lock();
            if let Some(existing) = shard.find(tag) {
                // Another thread cached the key while no lock was held.
                // Return the stolen buffer as free and take a reference on
                // the winner instead.
                meta.tag = None;
                meta.valid = false;
                meta.refcount = 0;
                shard.insert_lru(idx, meta);
                shard.get_mut(existing).refcount += 1;
                drop(shard);
                self.stats.lock().hits += 1;
                tracing::debug!(
                    target: "blockcache::cache",
                    device = tag.device.0,
                    block = tag.block.0,
                    shard = home,
                    "cache_steal_lost_revalidation"
                );
                return Ok(self.lock_frame(existing, home, tag));
            }
            shard.insert_mru(idx, meta);
            drop(shard);
            {
                let mut stats = self.stats.lock();
                stats.misses += 1;
                stats.steals += 1;
            }
            tracing::debug!(
                target: "blockcache::cache",
                device = tag.device.0,
                block = tag.block.0,
                shard = home,
                stolen_from = foreign_id,
                buffer = idx,
                "cache_miss_steal"
            );
            return Ok(self.lock_frame(idx, home, tag));
        }

        // The home lock was not held during the scan: another thread may
        // have cached this key, or released a home buffer, in the
        // meantime. Re-check before declaring the pool exhausted.
        if let Some(guard) = self.home_lookup_or_claim(home, tag) {
            return Ok(guard);
        }

        self.stats.lock().exhaustions += 1;
        tracing::error!(
            target: "blockcache::cache",
            device = tag.device.0,
            block = tag.block.0,
            total_buffers = self.geometry.total_buffers(),
            "cache_pool_exhausted"
        );
        Err(CacheError::PoolExhausted {
            total_buffers: self.geometry.total_buffers(),
        })
    }

    /// Acquire `(device, block)` and make sure its payload is loaded.
    ///
    /// If the buffer is not yet valid, exactly one holder performs the
    /// backend read; later holders of the same key observe the loaded
    /// contents. A failed load releases the buffer still-invalid, so the
    /// next acquirer retries; a guard with a half-initialized payload is
    /// never returned as valid.
    pub fn read(&self, device: DeviceId, block: BlockNumber) -> Result<BufGuard<'_, S>> {
        let mut guard = self.acquire(device, block)?;
        if !guard.is_valid() {
            let tag = guard.tag();
            self.store.read_block(tag, &mut guard)?;
            guard.mark_valid();
            self.stats.lock().loads += 1;
            tracing::debug!(
                target: "blockcache::cache",
                device = tag.device.0,
                block = tag.block.0,
                "cache_load"
            );
        }
        Ok(guard)
    }

    /// Flush pending backend writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Number of buffers carrying `tag` with a positive refcount, across
    /// all shards. Diagnostics; the cache-wide invariant is that this
    /// never exceeds one.
    #[must_use]
    pub fn resident_holders(&self, tag: BlockTag) -> usize {
        (0..self.geometry.shard_count())
            .map(|s| self.shards[s].lock().holders(tag))
            .sum()
    }

    /// Hit check and home-shard victim search in one critical section, so
    /// two threads missing on the same key cannot both claim home victims
    /// for it. Returns `None` when the key is absent and the home shard
    /// has no free buffer.
    fn home_lookup_or_claim(&self, home: usize, tag: BlockTag) -> Option<BufGuard<'_, S>> {
        let mut shard = self.shards[home].lock();
        if let Some(idx) = shard.find(tag) {
            shard.get_mut(idx).refcount += 1;
            drop(shard);
            self.stats.lock().hits += 1;
            tracing::trace!(
                target: "blockcache::cache",
                device = tag.device.0,
                block = tag.block.0,
                shard = home,
                "cache_hit"
            );
            return Some(self.lock_frame(idx, home, tag));
        }

        let idx = shard.victim()?;
        {
            let meta = shard.get_mut(idx);
            meta.tag = Some(tag);
            meta.valid = false;
            meta.refcount = 1;
        }
        shard.touch_mru(idx);
        drop(shard);
        {
            let mut stats = self.stats.lock();
            stats.misses += 1;
            stats.home_evictions += 1;
        }
        tracing::debug!(
            target: "blockcache::cache",
            device = tag.device.0,
            block = tag.block.0,
            shard = home,
            buffer = idx,
            "cache_miss_home_victim"
        );
        Some(self.lock_frame(idx, home, tag))
    }

    /// Must only be called with `meta.refcount` already raised for this
    /// holder; may block until the current holder releases.
    fn lock_frame(&self, idx: usize, home: usize, tag: BlockTag) -> BufGuard<'_, S> {
        let frame = self.frames[idx].lock();
        BufGuard {
            cache: self,
            idx,
            home,
            tag,
            frame: Some(frame),
        }
    }
}

/// Exclusive handle to one cached block.
///
/// Dereferences to the payload bytes. Holding a `BufGuard` *is* holding
/// the buffer's exclusive lock, so operations that require the lock
/// (payload access, [`flush`](Self::flush)) cannot be expressed without
/// it, and double release is unrepresentable.
#[must_use = "dropping the guard immediately releases the buffer"]
pub struct BufGuard<'c, S: BlockStore> {
    cache: &'c BufCache<S>,
    idx: usize,
    home: usize,
    tag: BlockTag,
    frame: Option<MutexGuard<'c, Frame>>,
}

impl<'c, S: BlockStore> BufGuard<'c, S> {
    /// The `(device, block)` identity this buffer carries. Stable while
    /// any reference (hold or pin) exists.
    #[must_use]
    pub fn tag(&self) -> BlockTag {
        self.tag
    }

    /// Whether the payload reflects on-device contents.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cache.shards[self.home].lock().get(self.idx).valid
    }

    fn mark_valid(&self) {
        self.cache.shards[self.home].lock().get_mut(self.idx).valid = true;
    }

    /// Write the payload to the backend. Does not release the guard and
    /// does not alter validity.
    pub fn flush(&self) -> Result<()> {
        self.cache.store.write_block(self.tag, self.payload())?;
        self.cache.stats.lock().flushes += 1;
        tracing::debug!(
            target: "blockcache::cache",
            device = self.tag.device.0,
            block = self.tag.block.0,
            "cache_flush"
        );
        Ok(())
    }

    /// Take an extra residency reference that survives this guard.
    pub fn pin(&self) -> BufPin<'c, S> {
        self.cache.shards[self.home]
            .lock()
            .get_mut(self.idx)
            .refcount += 1;
        BufPin {
            cache: self.cache,
            idx: self.idx,
            home: self.home,
            tag: self.tag,
        }
    }

    /// End exclusive access. Equivalent to dropping the guard.
    pub fn release(self) {}

    fn payload(&self) -> &[u8] {
        &self
            .frame
            .as_ref()
            .expect("exclusive frame guard held until release")
            .data
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self
            .frame
            .as_mut()
            .expect("exclusive frame guard held until release")
            .data
    }
}

impl<S: BlockStore> Deref for BufGuard<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl<S: BlockStore> DerefMut for BufGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.payload_mut()
    }
}

impl<S: BlockStore> Drop for BufGuard<'_, S> {
    fn drop(&mut self) {
        // Release the exclusive lock first so waiters on the same key can
        // proceed, then requeue under the owning shard's lock.
        drop(self.frame.take());
        let mut shard = self.cache.shards[self.home].lock();
        let meta = shard.get_mut(self.idx);
        debug_assert!(meta.refcount > 0, "release of unreferenced buffer");
        meta.refcount -= 1;
        if meta.refcount == 0 {
            shard.touch_mru(self.idx);
        }
    }
}

impl<S: BlockStore> std::fmt::Debug for BufGuard<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufGuard")
            .field("tag", &self.tag)
            .field("buffer", &self.idx)
            .finish_non_exhaustive()
    }
}

/// Residency reference that keeps a buffer eligible to stay cached without
/// holding its exclusive lock. No list movement on pin or unpin; a pinned
/// buffer is simply never chosen as a victim.
#[must_use = "dropping the pin immediately unpins the buffer"]
#[derive(Debug)]
pub struct BufPin<'c, S: BlockStore> {
    cache: &'c BufCache<S>,
    idx: usize,
    home: usize,
    tag: BlockTag,
}

impl<S: BlockStore> BufPin<'_, S> {
    #[must_use]
    pub fn tag(&self) -> BlockTag {
        self.tag
    }

    /// Drop the residency reference. Equivalent to dropping the pin.
    pub fn unpin(self) {}
}

impl<S: BlockStore> Drop for BufPin<'_, S> {
    fn drop(&mut self) {
        let mut shard = self.cache.shards[self.home].lock();
        let meta = shard.get_mut(self.idx);
        debug_assert!(meta.refcount > 0, "unpin of unreferenced buffer");
        meta.refcount -= 1;
    }
}
