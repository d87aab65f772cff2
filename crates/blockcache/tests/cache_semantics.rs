#![forbid(unsafe_code)]
//! Single-threaded eviction and residency semantics, including the
//! reference scenarios for home-shard victims and cross-shard steals on a
//! 4-buffer, 2-shard pool.

use blockcache::{BlockStore, BufCache, MemBlockStore};
use blockcache_error::{CacheError, Result};
use blockcache_types::{BlockNumber, BlockSize, BlockTag, CacheGeometry, DeviceId};
use parking_lot::Mutex;
use std::sync::Arc;

const DEV: DeviceId = DeviceId(0);

/// Store wrapper that records which tags were read from the backend, to
/// distinguish cache hits from reloads.
#[derive(Debug)]
struct CountingStore<S: BlockStore> {
    inner: S,
    reads: Mutex<Vec<BlockTag>>,
}

impl<S: BlockStore> CountingStore<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            reads: Mutex::new(Vec::new()),
        }
    }

    fn reads_of(&self, block: u64) -> usize {
        let tag = BlockTag::new(DEV, BlockNumber(block));
        self.reads.lock().iter().filter(|t| **t == tag).count()
    }
}

impl<S: BlockStore> BlockStore for CountingStore<S> {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()> {
        self.reads.lock().push(tag);
        self.inner.read_block(tag, buf)
    }

    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()> {
        self.inner.write_block(tag, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Store wrapper that fails a configured number of reads before serving
/// them, to exercise load-error paths.
#[derive(Debug)]
struct FlakyStore {
    inner: MemBlockStore,
    failures_left: Mutex<u32>,
}

impl FlakyStore {
    fn new(inner: MemBlockStore, failures: u32) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(failures),
        }
    }
}

impl BlockStore for FlakyStore {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn read_block(&self, tag: BlockTag, buf: &mut [u8]) -> Result<()> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(CacheError::Io(std::io::Error::other("injected read failure")));
        }
        drop(left);
        self.inner.read_block(tag, buf)
    }

    fn write_block(&self, tag: BlockTag, buf: &[u8]) -> Result<()> {
        self.inner.write_block(tag, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

type TestCache = BufCache<Arc<CountingStore<MemBlockStore>>>;

/// Pool of 4 buffers over 2 shards, so a block's home shard is
/// `block mod 2`.
fn four_buffer_cache() -> (TestCache, Arc<CountingStore<MemBlockStore>>) {
    let bs = BlockSize::new(512).expect("block size");
    let mem = MemBlockStore::new(bs);
    mem.attach(DEV, 1024);
    let store = Arc::new(CountingStore::new(mem));
    let geometry = CacheGeometry::new(4, 2, bs).expect("geometry");
    let cache = BufCache::new(Arc::clone(&store), geometry).expect("cache");
    (cache, store)
}

fn read_release(cache: &TestCache, block: u64) {
    cache.read(DEV, BlockNumber(block)).expect("read").release();
}

#[test]
fn home_shard_victim_is_least_recently_released() {
    let (cache, store) = four_buffer_cache();

    // Fill the pool exactly: 10, 12 land in shard 0; 11, 13 in shard 1.
    for block in [10, 11, 12, 13] {
        read_release(&cache, block);
    }

    // Block 14 hashes to shard 0, which has a free victim of its own:
    // block 10, released before 12.
    let guard = cache.acquire(DEV, BlockNumber(14)).expect("acquire");
    assert_eq!(guard.tag(), BlockTag::new(DEV, BlockNumber(14)));
    assert!(!guard.is_valid(), "recycled buffer starts invalid");
    guard.release();

    let stats = cache.stats();
    assert_eq!(stats.steals, 0, "no cross-shard steal was needed");
    assert_eq!(stats.home_evictions, 5, "four cold misses plus block 14");

    // 12 survived the eviction, 10 did not.
    read_release(&cache, 12);
    assert_eq!(store.reads_of(12), 1, "block 12 stayed resident");
    read_release(&cache, 10);
    assert_eq!(store.reads_of(10), 2, "block 10 was the victim");
}

#[test]
fn steal_from_foreign_shard_when_home_is_exhausted() {
    let (cache, store) = four_buffer_cache();

    for block in [10, 11, 12, 13] {
        read_release(&cache, block);
    }

    // Hold both shard-0 buffers so shard 0 has no victim, while shard 1
    // still holds released buffers for 11 and 13.
    let held_a = cache.read(DEV, BlockNumber(12)).expect("read 12");
    let held_b = cache.acquire(DEV, BlockNumber(16)).expect("acquire 16");

    // Block 18 hashes to shard 0: its buffer must be stolen from shard 1.
    let guard = cache.acquire(DEV, BlockNumber(18)).expect("acquire 18");
    assert_eq!(guard.tag(), BlockTag::new(DEV, BlockNumber(18)));
    assert!(!guard.is_valid());
    assert_eq!(cache.stats().steals, 1);

    // Shard 1's least-recently-released buffer held block 11; block 13
    // survived.
    read_release(&cache, 13);
    assert_eq!(store.reads_of(13), 1, "block 13 stayed resident");
    read_release(&cache, 11);
    assert_eq!(store.reads_of(11), 2, "block 11 was stolen");

    guard.release();
    held_b.release();
    held_a.release();
}

#[test]
fn lru_eviction_within_a_contended_shard() {
    let bs = BlockSize::new(512).expect("block size");
    let mem = MemBlockStore::new(bs);
    mem.attach(DEV, 1024);
    let store = Arc::new(CountingStore::new(mem));
    let geometry = CacheGeometry::new(2, 1, bs).expect("geometry");
    let cache = BufCache::new(Arc::clone(&store), geometry).expect("cache");

    read_release(&cache, 1);
    read_release(&cache, 2);
    // Third distinct key on a 2-buffer pool evicts block 1, released
    // before block 2.
    read_release(&cache, 3);

    read_release(&cache, 2);
    assert_eq!(store.reads_of(2), 1, "block 2 was most recently released");
    read_release(&cache, 1);
    assert_eq!(store.reads_of(1), 2, "block 1 was evicted first");
}

#[test]
fn exhaustion_is_fatal_and_mutates_nothing() {
    let (cache, _store) = four_buffer_cache();

    let guards = vec![
        cache.read(DEV, BlockNumber(10)).expect("read 10"),
        cache.read(DEV, BlockNumber(11)).expect("read 11"),
        cache.read(DEV, BlockNumber(12)).expect("read 12"),
        cache.read(DEV, BlockNumber(13)).expect("read 13"),
    ];

    let err = cache.acquire(DEV, BlockNumber(14)).expect_err("exhausted");
    assert!(matches!(
        err,
        CacheError::PoolExhausted { total_buffers: 4 }
    ));
    assert_eq!(cache.stats().exhaustions, 1);

    // Every existing hold is untouched.
    for (guard, block) in guards.iter().zip([10, 11, 12, 13]) {
        assert_eq!(guard.tag(), BlockTag::new(DEV, BlockNumber(block)));
        assert_eq!(cache.resident_holders(guard.tag()), 1);
    }

    // Releasing any one buffer makes the request satisfiable again.
    drop(guards);
    let guard = cache.acquire(DEV, BlockNumber(14)).expect("acquire after release");
    guard.release();
}

#[test]
fn flushed_contents_survive_eviction() {
    let (cache, _store) = four_buffer_cache();

    let mut guard = cache.read(DEV, BlockNumber(10)).expect("read");
    guard.fill(0xC3);
    guard.flush().expect("flush");
    guard.release();

    // Churn shard 0 with enough distinct keys that block 10's buffer is
    // certainly recycled.
    for block in [20, 22, 24, 26] {
        read_release(&cache, block);
    }

    let guard = cache.read(DEV, BlockNumber(10)).expect("reread");
    assert!(guard.iter().all(|b| *b == 0xC3));
    guard.release();
}

#[test]
fn pinned_buffer_is_never_victimized() {
    let bs = BlockSize::new(512).expect("block size");
    let mem = MemBlockStore::new(bs);
    mem.attach(DEV, 1024);
    let store = Arc::new(CountingStore::new(mem));
    let geometry = CacheGeometry::new(2, 1, bs).expect("geometry");
    let cache = BufCache::new(Arc::clone(&store), geometry).expect("cache");

    let guard = cache.read(DEV, BlockNumber(1)).expect("read");
    let pin = guard.pin();
    guard.release();

    // Sustained pressure recycles the only other buffer repeatedly.
    for block in 2..10 {
        read_release(&cache, block);
    }

    read_release(&cache, 1);
    assert_eq!(store.reads_of(1), 1, "pinned block was never evicted");

    // Once unpinned, the buffer is an ordinary victim again.
    pin.unpin();
    read_release(&cache, 50);
    read_release(&cache, 51);
    read_release(&cache, 1);
    assert_eq!(store.reads_of(1), 2, "unpinned block became evictable");
}

#[test]
fn failed_load_leaves_the_buffer_invalid_and_retryable() {
    let bs = BlockSize::new(512).expect("block size");
    let mem = MemBlockStore::new(bs);
    mem.attach(DEV, 1024);
    let tag = BlockTag::new(DEV, BlockNumber(7));
    mem.write_block(tag, &[0xB7_u8; 512]).expect("seed block");

    let store = Arc::new(CountingStore::new(FlakyStore::new(mem, 1)));
    let geometry = CacheGeometry::new(4, 2, bs).expect("geometry");
    let cache = BufCache::new(Arc::clone(&store), geometry).expect("cache");

    let err = cache.read(DEV, BlockNumber(7)).expect_err("load fails");
    assert!(matches!(err, CacheError::Io(_)));

    // The failing holder released cleanly: no reference remains and no
    // load was recorded.
    assert_eq!(cache.resident_holders(tag), 0);
    assert_eq!(cache.stats().loads, 0);

    // The buffer kept its tag but stayed invalid, so the next read of the
    // same key is a hit that retries the backend load in full.
    let guard = cache.read(DEV, BlockNumber(7)).expect("retry succeeds");
    assert_eq!(guard.tag(), tag);
    assert!(guard.is_valid());
    assert!(guard.iter().all(|b| *b == 0xB7));
    guard.release();

    assert_eq!(store.reads_of(7), 2, "both attempts reached the backend");
    let stats = cache.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!((stats.misses, stats.hits), (1, 1));
}

#[test]
fn released_buffer_keeps_its_contents_until_recycled() {
    let (cache, store) = four_buffer_cache();

    read_release(&cache, 10);
    // Immediate re-acquire of a fully released key is a hit with no
    // device read.
    read_release(&cache, 10);
    assert_eq!(store.reads_of(10), 1);
    assert_eq!(cache.stats().hits, 1);
}
