//! Process-wide cache of fixed-size disk blocks.
//!
//! All driver I/O comes through here. The cache can handle blocks of
//! different sizes for multiple underlying devices. It is organized as a
//! hash table (for lookups by device and block number) and two
//! doubly-linked lists: the normal list holds blocks that are clean or
//! dirty, the locked list holds blocks a caller has pinned. Both lists are
//! LRU ordered.
//!
//! Blocks committed to a journal get a *clone*: a private snapshot taken by
//! [`BlockCache::set_block_info`] that is flushed in place of the live
//! bytes; when the clone is durably written, the commit callback fires
//! exactly once and the clone is freed. The live buffer keeps accepting
//! writes that reach disk on a later flush.

use std::collections::HashMap;
use std::fs::File;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use log::error;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::error::fatal;
use crate::error::FsError;
use crate::error::FsResult;

/// Largest number of blocks written by one vectored flush.
pub const NUM_FLUSH_BLOCKS: usize = 64;

/// Default read-ahead window in bytes.
const READ_AHEAD_SIZE: usize = 32 * 1024;

/// Transfers at least this large bypass the cache.
const DIRECT_IO_THRESHOLD: usize = 64 * 1024;

/// Raw device transfers are split into chunks of this size.
const CHUNK: usize = 512 * 1024;

/// How long to sleep before retrying a busy block.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(5);

/// How long to sleep when no eviction victims are available.
const VICTIM_RETRY_DELAY: Duration = Duration::from_millis(10);

const HT_DEFAULT_MAX: usize = 128;

/// Identifier of a device registered with the cache.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DeviceId(pub u64);

/// Journal commit callback: `(journaled_block, block_count, arg)`.
pub type CommitFn = Arc<dyn Fn(u64, usize, u64) + Send + Sync>;

/// Shared handle to a cached block's live bytes.
///
/// The handle stays valid while the caller holds the block's lock count;
/// writes through it reach the cache directly.
#[derive(Clone)]
pub struct BlockBuf(Arc<Mutex<Box<[u8]>>>);

impl BlockBuf {
    /// Locks the block bytes for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.0.lock()
    }
}

impl std::fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockBuf[{} bytes]", self.0.lock().len())
    }
}

struct CommitRecord {
    journaled: u64,
    func: CommitFn,
    arg: u64,
}

struct Block {
    dev: DeviceId,
    bnum: u64,
    bsize: usize,
    data: Arc<Mutex<Box<[u8]>>>,
    clone: Option<Box<[u8]>>,
    commit: Option<CommitRecord>,
    lock_count: u32,
    dirty: bool,
    busy: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Block {
    fn locked(&self) -> bool {
        self.lock_count > 0
    }

    fn needs_flush(&self) -> bool {
        self.dirty || self.clone.is_some()
    }
}

#[derive(Default)]
struct ListHead {
    lru: Option<usize>,
    mru: Option<usize>,
}

// Chained hash table keyed on (device, block). Grown by powers of two to
// keep the load factor under 3/4.
struct BlockHash {
    buckets: Vec<Vec<(u64, u64, usize)>>,
    mask: u64,
    elements: usize,
}

impl BlockHash {
    fn new() -> BlockHash {
        BlockHash {
            buckets: vec![Vec::new(); HT_DEFAULT_MAX],
            mask: (HT_DEFAULT_MAX - 1) as u64,
            elements: 0,
        }
    }

    fn hash(dev: DeviceId, bnum: u64) -> u64 {
        (dev.0 << (u64::BITS - 6)) | bnum
    }

    fn insert(&mut self, dev: DeviceId, bnum: u64, slot: usize) {
        let bucket = (Self::hash(dev, bnum) & self.mask) as usize;
        if self.buckets[bucket].iter().any(|e| e.0 == dev.0 && e.1 == bnum) {
            fatal("block already in the hash table");
        }
        self.buckets[bucket].push((dev.0, bnum, slot));
        self.elements += 1;
        if self.elements >= self.buckets.len() * 3 / 4 {
            self.grow();
        }
    }

    fn lookup(&self, dev: DeviceId, bnum: u64) -> Option<usize> {
        let bucket = (Self::hash(dev, bnum) & self.mask) as usize;
        self.buckets[bucket]
            .iter()
            .find(|e| e.0 == dev.0 && e.1 == bnum)
            .map(|e| e.2)
    }

    fn remove(&mut self, dev: DeviceId, bnum: u64) -> Option<usize> {
        let bucket = (Self::hash(dev, bnum) & self.mask) as usize;
        let position = self.buckets[bucket]
            .iter()
            .position(|e| e.0 == dev.0 && e.1 == bnum)?;
        self.elements -= 1;
        Some(self.buckets[bucket].swap_remove(position).2)
    }

    fn grow(&mut self) {
        let new_size = self.buckets.len() * 2;
        let new_mask = (new_size - 1) as u64;
        let mut new_buckets = vec![Vec::new(); new_size];
        for bucket in self.buckets.drain(..) {
            for entry in bucket {
                let index = (Self::hash(DeviceId(entry.0), entry.1) & new_mask) as usize;
                new_buckets[index].push(entry);
            }
        }
        self.buckets = new_buckets;
        self.mask = new_mask;
    }
}

struct Device {
    file: Arc<File>,
    max_blocks: u64,
    bsize: usize,
}

struct CacheInner {
    slots: Vec<Option<Block>>,
    free_slots: Vec<usize>,
    hash: BlockHash,
    normal: ListHead,
    locked: ListHead,
    cur_blocks: usize,
    max_blocks: usize,
    devices: HashMap<u64, Device>,
    next_device: u64,
}

/// Counters over raw device transfers.
#[derive(Debug, Default)]
pub struct IoStats {
    /// Number of read transfers issued to devices.
    pub reads: AtomicU64,
    /// Number of write transfers issued to devices (one per vectored batch).
    pub writes: AtomicU64,
}

/// The shared block cache.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    stats: IoStats,
}

// State a block carries through a flush while the cache lock is dropped.
// The block itself stays marked busy so nobody else touches it.
struct FlushEnt {
    slot: usize,
    dev: DeviceId,
    bnum: u64,
    bsize: usize,
    file: Arc<File>,
    data: Arc<Mutex<Box<[u8]>>>,
    clone: Option<Box<[u8]>>,
    commit: Option<CommitRecord>,
    dirty: bool,
    locked: bool,
}

impl FlushEnt {
    // A clone is always written first; live bytes only go out when they are
    // dirty, unpinned, and no clone is pending.
    fn pending_write(&self) -> bool {
        self.clone.is_some() || (self.dirty && !self.locked)
    }
}

impl BlockCache {
    /// Creates a cache bounded to `max_blocks` resident blocks.
    pub fn new(max_blocks: usize) -> BlockCache {
        BlockCache {
            inner: Mutex::new(CacheInner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                hash: BlockHash::new(),
                normal: ListHead::default(),
                locked: ListHead::default(),
                cur_blocks: 0,
                max_blocks,
                devices: HashMap::new(),
                next_device: 1,
            }),
            stats: IoStats::default(),
        }
    }

    /// Raw transfer counters.
    pub fn io_stats(&self) -> &IoStats {
        &self.stats
    }

    /// Registers a device with its backing file, size and block size.
    /// Every later call for this device must use the same `bsize`.
    pub fn init_device(&self, file: File, max_blocks: u64, bsize: usize) -> FsResult<DeviceId> {
        if bsize == 0 || max_blocks == 0 {
            return Err(FsError::BadRequest);
        }
        let mut inner = self.inner.lock();
        let id = inner.next_device;
        inner.next_device += 1;
        inner.devices.insert(
            id,
            Device {
                file: Arc::new(file),
                max_blocks,
                bsize,
            },
        );
        Ok(DeviceId(id))
    }

    fn device_info(
        &self,
        inner: &CacheInner,
        dev: DeviceId,
        bnum: u64,
        count: u64,
        bsize: usize,
    ) -> FsResult<(Arc<File>, u64)> {
        let device = inner.devices.get(&dev.0).ok_or(FsError::Cache(libc::ENXIO))?;
        if bsize != device.bsize {
            fatal("block size differs from the device's registered block size");
        }
        if bnum + count > device.max_blocks {
            warn!(
                "device {}: access to blocks {}:{} but device has {}",
                dev.0, bnum, count, device.max_blocks
            );
            return Err(FsError::Cache(libc::EINVAL));
        }
        Ok((device.file.clone(), device.max_blocks))
    }

    // ----- block accessors -----

    /// Returns the block's bytes, locking it into the cache. Reads from the
    /// device on a miss; may trigger eviction.
    pub fn get(&self, dev: DeviceId, bnum: u64, bsize: usize) -> FsResult<BlockBuf> {
        self.get_common(dev, bnum, bsize, false)
    }

    /// Like [`BlockCache::get`], but the block is zero-filled and marked
    /// dirty without touching the device.
    pub fn get_empty(&self, dev: DeviceId, bnum: u64, bsize: usize) -> FsResult<BlockBuf> {
        self.get_common(dev, bnum, bsize, true)
    }

    fn get_common(&self, dev: DeviceId, bnum: u64, bsize: usize, empty: bool) -> FsResult<BlockBuf> {
        loop {
            let mut inner = self.inner.lock();
            let (file, dev_max) = self.device_info(&inner, dev, bnum, 1, bsize)?;

            match self.lookup(&mut inner, dev, bnum) {
                Lookup::Busy => {
                    drop(inner);
                    std::thread::sleep(BUSY_RETRY_DELAY);
                    continue;
                }
                Lookup::Hit(slot) => {
                    inner.detach(slot);
                    let block = inner.slots[slot].as_mut().unwrap();
                    if empty {
                        block.data.lock().fill(0);
                        block.dirty = true;
                    }
                    block.lock_count += 1;
                    let buf = BlockBuf(block.data.clone());
                    inner.push_mru(slot, true);
                    return Ok(buf);
                }
                Lookup::Miss => {
                    if empty {
                        self.make_room(&mut inner, 1)?;
                        if inner.hash.lookup(dev, bnum).is_some() {
                            // Someone slipped the block in while we made
                            // room; start over with the lookup.
                            continue;
                        }
                        let slot = inner.insert_block(dev, bnum, bsize);
                        let block = inner.slots[slot].as_mut().unwrap();
                        block.dirty = true;
                        block.lock_count = 1;
                        let buf = BlockBuf(block.data.clone());
                        inner.push_mru(slot, true);
                        return Ok(buf);
                    }

                    // Plan a read-ahead run behind the requested block.
                    let plan_limit = inner.plan_limit();
                    let mut wanted = 1u64;
                    while wanted < plan_limit
                        && (wanted as usize) * bsize < READ_AHEAD_SIZE
                        && bnum + wanted < dev_max
                        && inner.hash.lookup(dev, bnum + wanted).is_none()
                    {
                        wanted += 1;
                    }
                    let Some(slots) =
                        self.fill_from_device(&mut inner, dev, bnum, wanted as usize, bsize, &file)?
                    else {
                        continue;
                    };
                    let first = slots[0];
                    {
                        let block = inner.slots[first].as_mut().unwrap();
                        block.lock_count = 1;
                    }
                    for (i, slot) in slots.iter().enumerate() {
                        inner.slots[*slot].as_mut().unwrap().busy = false;
                        inner.push_mru(*slot, i == 0);
                    }
                    let buf =
                        BlockBuf(inner.slots[first].as_ref().unwrap().data.clone());
                    return Ok(buf);
                }
            }
        }
    }

    /// Drops one lock count. On reaching zero the block moves back to the
    /// MRU end of the normal list.
    pub fn release(&self, dev: DeviceId, bnum: u64) {
        loop {
            let mut inner = self.inner.lock();
            match self.lookup(&mut inner, dev, bnum) {
                Lookup::Busy => {
                    drop(inner);
                    std::thread::sleep(BUSY_RETRY_DELAY);
                }
                Lookup::Miss => fatal("release of a block that is not cached"),
                Lookup::Hit(slot) => {
                    let block = inner.slots[slot].as_mut().unwrap();
                    if block.lock_count == 0 {
                        fatal("release of an unlocked block");
                    }
                    block.lock_count -= 1;
                    if block.lock_count == 0 {
                        inner.detach(slot);
                        inner.push_mru(slot, false);
                    }
                    return;
                }
            }
        }
    }

    // ----- bulk transfers -----

    /// Reads `count` blocks starting at `bnum` into `buffer`. Missed runs
    /// are extended with read-ahead; transfers of 64 KiB or more bypass the
    /// cache but still prefer any cached bytes.
    pub fn cached_read(
        &self,
        dev: DeviceId,
        bnum: u64,
        buffer: &mut [u8],
        count: u64,
        bsize: usize,
    ) -> FsResult<()> {
        if buffer.len() < count as usize * bsize || count == 0 {
            return Err(FsError::BadRequest);
        }

        if count as usize * bsize >= DIRECT_IO_THRESHOLD {
            let file = {
                let inner = self.inner.lock();
                self.device_info(&inner, dev, bnum, count, bsize)?.0
            };
            self.read_phys(&file, bnum * bsize as u64, &mut buffer[..count as usize * bsize])?;
            // Cached copies may be fresher than what we just read.
            let mut inner = self.inner.lock();
            for i in 0..count {
                loop {
                    match self.lookup(&mut inner, dev, bnum + i) {
                        Lookup::Miss => break,
                        Lookup::Busy => {
                            MutexGuard::unlocked(&mut inner, || {
                                std::thread::sleep(BUSY_RETRY_DELAY)
                            });
                        }
                        Lookup::Hit(slot) => {
                            let block = inner.slots[slot].as_ref().unwrap();
                            let data = block.data.lock();
                            buffer[i as usize * bsize..(i as usize + 1) * bsize]
                                .copy_from_slice(&data);
                            break;
                        }
                    }
                }
            }
            return Ok(());
        }

        let mut current = bnum;
        let end = bnum + count;
        while current < end {
            let mut inner = self.inner.lock();
            let (file, dev_max) = self.device_info(&inner, dev, current, end - current, bsize)?;
            match self.lookup(&mut inner, dev, current) {
                Lookup::Busy => {
                    drop(inner);
                    std::thread::sleep(BUSY_RETRY_DELAY);
                    continue;
                }
                Lookup::Hit(slot) => {
                    let offset = (current - bnum) as usize * bsize;
                    let block = inner.slots[slot].as_ref().unwrap();
                    let data = block.data.lock();
                    buffer[offset..offset + bsize].copy_from_slice(&data);
                    drop(data);
                    let locked = inner.slots[slot].as_ref().unwrap().locked();
                    inner.detach(slot);
                    inner.push_mru(slot, locked);
                    current += 1;
                }
                Lookup::Miss => {
                    // Extend the miss into one device transfer, then tack on
                    // read-ahead up to the window.
                    let plan_limit = inner.plan_limit();
                    let mut run = 1u64;
                    while current + run < end
                        && run < plan_limit
                        && inner.hash.lookup(dev, current + run).is_none()
                    {
                        run += 1;
                    }
                    let mut wanted = run;
                    if (run as usize) * bsize < READ_AHEAD_SIZE {
                        while wanted < plan_limit
                            && (wanted as usize) * bsize < READ_AHEAD_SIZE
                            && current + wanted < dev_max
                            && inner.hash.lookup(dev, current + wanted).is_none()
                        {
                            wanted += 1;
                        }
                    }
                    let Some(slots) = self.fill_from_device(
                        &mut inner,
                        dev,
                        current,
                        wanted as usize,
                        bsize,
                        &file,
                    )?
                    else {
                        continue;
                    };
                    let copied = (slots.len() as u64).min(run);
                    for (i, slot) in slots.iter().enumerate() {
                        let block = inner.slots[*slot].as_mut().unwrap();
                        block.busy = false;
                        if (i as u64) < copied {
                            let offset = (current - bnum) as usize * bsize + i * bsize;
                            buffer[offset..offset + bsize].copy_from_slice(&block.data.lock());
                        }
                        inner.push_mru(*slot, false);
                    }
                    current += copied;
                }
            }
        }
        Ok(())
    }

    /// Writes `count` blocks starting at `bnum` from `buffer` into the
    /// cache, marking them dirty.
    pub fn cached_write(
        &self,
        dev: DeviceId,
        bnum: u64,
        buffer: &[u8],
        count: u64,
        bsize: usize,
    ) -> FsResult<()> {
        self.cached_write_common(dev, bnum, buffer, count, bsize, false)
    }

    /// Like [`BlockCache::cached_write`], but additionally leaves each
    /// written block locked.
    pub fn cached_write_locked(
        &self,
        dev: DeviceId,
        bnum: u64,
        buffer: &[u8],
        count: u64,
        bsize: usize,
    ) -> FsResult<()> {
        self.cached_write_common(dev, bnum, buffer, count, bsize, true)
    }

    fn cached_write_common(
        &self,
        dev: DeviceId,
        bnum: u64,
        buffer: &[u8],
        count: u64,
        bsize: usize,
        lock: bool,
    ) -> FsResult<()> {
        if buffer.len() < count as usize * bsize || count == 0 {
            return Err(FsError::BadRequest);
        }

        if count as usize * bsize >= DIRECT_IO_THRESHOLD {
            if lock {
                fatal("large locked write cannot be served");
            }
            let file = {
                let mut inner = self.inner.lock();
                let file = self.device_info(&inner, dev, bnum, count, bsize)?.0;
                // Keep any cached copies coherent with what goes to disk.
                for i in 0..count {
                    loop {
                        match self.lookup(&mut inner, dev, bnum + i) {
                            Lookup::Miss => break,
                            Lookup::Busy => {
                                MutexGuard::unlocked(&mut inner, || {
                                    std::thread::sleep(BUSY_RETRY_DELAY)
                                });
                            }
                            Lookup::Hit(slot) => {
                                let block = inner.slots[slot].as_ref().unwrap();
                                block.data.lock().copy_from_slice(
                                    &buffer[i as usize * bsize..(i as usize + 1) * bsize],
                                );
                                break;
                            }
                        }
                    }
                }
                file
            };
            return self.write_phys(&file, bnum * bsize as u64, &buffer[..count as usize * bsize]);
        }

        let mut current = bnum;
        let end = bnum + count;
        while current < end {
            let mut inner = self.inner.lock();
            self.device_info(&inner, dev, current, end - current, bsize)?;
            match self.lookup(&mut inner, dev, current) {
                Lookup::Busy => {
                    drop(inner);
                    std::thread::sleep(BUSY_RETRY_DELAY);
                    continue;
                }
                Lookup::Hit(slot) => {
                    let offset = (current - bnum) as usize * bsize;
                    inner.detach(slot);
                    let block = inner.slots[slot].as_mut().unwrap();
                    block
                        .data
                        .lock()
                        .copy_from_slice(&buffer[offset..offset + bsize]);
                    block.dirty = true;
                    if lock {
                        block.lock_count += 1;
                    }
                    let locked = block.locked();
                    inner.push_mru(slot, locked);
                    current += 1;
                }
                Lookup::Miss => {
                    self.make_room(&mut inner, 1)?;
                    if inner.hash.lookup(dev, current).is_some() {
                        continue;
                    }
                    let offset = (current - bnum) as usize * bsize;
                    let slot = inner.insert_block(dev, current, bsize);
                    let block = inner.slots[slot].as_mut().unwrap();
                    block
                        .data
                        .lock()
                        .copy_from_slice(&buffer[offset..offset + bsize]);
                    block.dirty = true;
                    if lock {
                        block.lock_count = 1;
                    }
                    inner.push_mru(slot, lock);
                    current += 1;
                }
            }
        }
        Ok(())
    }

    /// Sets the dirty bit on `count` already-resident blocks.
    pub fn mark_dirty(&self, dev: DeviceId, bnum: u64, count: u64) -> FsResult<()> {
        let mut inner = self.inner.lock();
        for i in 0..count {
            match inner.hash.lookup(dev, bnum + i) {
                Some(slot) => inner.slots[slot].as_mut().unwrap().dirty = true,
                None => {
                    warn!("mark_dirty could not find block {}:{}", dev.0, bnum + i);
                    return Err(FsError::Cache(libc::ENOENT));
                }
            }
        }
        Ok(())
    }

    // ----- journal commit -----

    /// Journal commit primitive. For each named block (which must be locked
    /// and dirty): snapshot its bytes into a clone, attach the completion
    /// callback, and drop one lock count. From now on a flush writes the
    /// clone; the live buffer keeps accepting writes that become visible on
    /// a later flush. When the clone is durably written the callback fires
    /// with `(journaled_block, 1, arg)` exactly once.
    pub fn set_block_info(
        &self,
        dev: DeviceId,
        blocks: &[u64],
        func: CommitFn,
        arg: u64,
    ) -> FsResult<()> {
        let mut inner = self.inner.lock();

        // First pass: pin every named block and flush any clone still
        // pending from an earlier commit.
        let mut pending: Vec<FlushEnt> = Vec::new();
        for &bnum in blocks {
            let slot = loop {
                match self.lookup(&mut inner, dev, bnum) {
                    Lookup::Hit(slot) => break slot,
                    Lookup::Miss => fatal("set_block_info on a block that is not cached"),
                    Lookup::Busy => {
                        MutexGuard::unlocked(&mut inner, || std::thread::sleep(BUSY_RETRY_DELAY));
                    }
                }
            };
            let block = inner.slots[slot].as_mut().unwrap();
            if !block.locked() {
                fatal("set_block_info on an unlocked block");
            }
            if !block.dirty {
                fatal("set_block_info on a clean block");
            }
            block.busy = true;
            if block.clone.is_some() && block.commit.is_some() {
                if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                    pending.push(ent);
                }
            }
            if pending.len() >= NUM_FLUSH_BLOCKS {
                let batch = std::mem::take(&mut pending);
                self.run_flush(&mut inner, batch)?;
            }
        }
        if !pending.is_empty() {
            self.run_flush(&mut inner, pending)?;
        }

        // Second pass: take the snapshots and unpin.
        for &bnum in blocks {
            let slot = inner
                .hash
                .lookup(dev, bnum)
                .unwrap_or_else(|| fatal("set_block_info lost a block"));
            let block = inner.slots[slot].as_mut().unwrap();
            block.dirty = false;
            block.busy = false;
            if block.commit.is_some() {
                fatal("set_block_info on a block that already has a commit callback");
            }
            if block.clone.is_some() {
                fatal("set_block_info on an already cloned block");
            }
            block.clone = Some(block.data.lock().clone());
            block.commit = Some(CommitRecord {
                journaled: bnum,
                func: func.clone(),
                arg,
            });
            if block.lock_count == 0 {
                warn!("set_block_info: block {}:{} has no lock", dev.0, bnum);
            } else {
                block.lock_count -= 1;
            }
            if block.lock_count == 0 {
                inner.detach(slot);
                inner.push_mru(slot, false);
            }
        }
        Ok(())
    }

    // ----- write-out primitives -----

    /// Flushes `count` blocks starting at `bnum`, where resident and in
    /// need of it.
    pub fn flush_blocks(&self, dev: DeviceId, bnum: u64, count: u64) -> FsResult<()> {
        if count == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let mut batch: Vec<FlushEnt> = Vec::new();
        for i in 0..count {
            let slot = loop {
                match self.lookup(&mut inner, dev, bnum + i) {
                    Lookup::Hit(slot) => break Some(slot),
                    Lookup::Miss => break None,
                    Lookup::Busy => {
                        MutexGuard::unlocked(&mut inner, || std::thread::sleep(BUSY_RETRY_DELAY));
                    }
                }
            };
            let Some(slot) = slot else { continue };
            if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                batch.push(ent);
            }
            if batch.len() >= NUM_FLUSH_BLOCKS {
                let full = std::mem::take(&mut batch);
                self.run_flush(&mut inner, full)?;
            }
        }
        if !batch.is_empty() {
            self.run_flush(&mut inner, batch)?;
        }
        Ok(())
    }

    /// Flushes every block of `dev` that needs it. With `warn_if_locked`,
    /// dirty blocks that stay pinned (and therefore unflushed) are logged.
    pub fn flush_device(&self, dev: DeviceId, warn_if_locked: bool) -> FsResult<()> {
        let mut inner = self.inner.lock();

        // Each block is written at most once per call; cloned blocks that
        // are also dirty keep their dirty bit for the next flush. The scans
        // restart from the LRU end after every batch (the lock was dropped
        // meanwhile), so already-flushed blocks are remembered by number.
        let mut done: std::collections::HashSet<u64> = std::collections::HashSet::new();

        // Normal list: anything dirty or cloned.
        loop {
            let mut batch: Vec<FlushEnt> = Vec::new();
            let mut cursor = inner.normal.lru;
            while let Some(slot) = cursor {
                cursor = inner.slots[slot].as_ref().unwrap().next;
                let block = inner.slots[slot].as_ref().unwrap();
                if block.dev != dev
                    || block.busy
                    || !block.needs_flush()
                    || done.contains(&block.bnum)
                {
                    continue;
                }
                done.insert(block.bnum);
                if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                    batch.push(ent);
                }
                if batch.len() >= NUM_FLUSH_BLOCKS {
                    break;
                }
            }
            if batch.is_empty() {
                break;
            }
            self.run_flush(&mut inner, batch)?;
        }

        // Locked list: only clones can be written.
        loop {
            let mut batch: Vec<FlushEnt> = Vec::new();
            let mut cursor = inner.locked.lru;
            while let Some(slot) = cursor {
                cursor = inner.slots[slot].as_ref().unwrap().next;
                let block = inner.slots[slot].as_ref().unwrap();
                if block.dev != dev
                    || block.busy
                    || block.clone.is_none()
                    || done.contains(&block.bnum)
                {
                    continue;
                }
                done.insert(block.bnum);
                if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                    batch.push(ent);
                }
                if batch.len() >= NUM_FLUSH_BLOCKS {
                    break;
                }
            }
            if batch.is_empty() {
                break;
            }
            self.run_flush(&mut inner, batch)?;
        }

        if warn_if_locked {
            let mut cursor = inner.locked.lru;
            while let Some(slot) = cursor {
                let block = inner.slots[slot].as_ref().unwrap();
                if block.dev == dev && block.dirty {
                    warn!(
                        "flush_device: block {}:{} is dirty but locked ({} locks)",
                        dev.0, block.bnum, block.lock_count
                    );
                }
                cursor = block.next;
            }
        }
        Ok(())
    }

    /// Opportunistic flush of up to one batch for `dev`. With
    /// `prefer_log_blocks` only blocks carrying a commit callback are
    /// taken from the normal list; cloned locked blocks fill the rest.
    pub fn force_cache_flush(&self, dev: DeviceId, prefer_log_blocks: bool) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let mut batch: Vec<FlushEnt> = Vec::new();

        let mut cursor = inner.normal.lru;
        while let Some(slot) = cursor {
            cursor = inner.slots[slot].as_ref().unwrap().next;
            let block = inner.slots[slot].as_ref().unwrap();
            if block.dev != dev
                || block.busy
                || !block.needs_flush()
                || (prefer_log_blocks && block.commit.is_none())
            {
                continue;
            }
            if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                batch.push(ent);
            }
            if batch.len() >= NUM_FLUSH_BLOCKS {
                break;
            }
        }
        if batch.len() < NUM_FLUSH_BLOCKS {
            let mut cursor = inner.locked.lru;
            while let Some(slot) = cursor {
                cursor = inner.slots[slot].as_ref().unwrap().next;
                let block = inner.slots[slot].as_ref().unwrap();
                if block.dev != dev || block.busy || block.clone.is_none() {
                    continue;
                }
                if let Some(ent) = self.take_flush_ent(&mut inner, slot) {
                    batch.push(ent);
                }
                if batch.len() >= NUM_FLUSH_BLOCKS {
                    break;
                }
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.run_flush(&mut inner, batch)
    }

    /// Evicts every cached block of `dev` and unregisters the device. With
    /// `allow_writes`, dirty and cloned blocks are flushed first.
    pub fn remove_cached_device_blocks(&self, dev: DeviceId, allow_writes: bool) -> FsResult<()> {
        let mut inner = self.inner.lock();
        if allow_writes {
            self.flush_all_for(&mut inner, Some(dev))?;
        }
        let mut victims = Vec::new();
        for slot in 0..inner.slots.len() {
            if let Some(block) = &inner.slots[slot] {
                if block.dev != dev {
                    continue;
                }
                if block.locked() || block.busy {
                    warn!(
                        "removing cached blocks: block {}:{} has lock {} busy {}",
                        dev.0, block.bnum, block.lock_count, block.busy
                    );
                }
                victims.push(slot);
            }
        }
        for slot in victims {
            inner.remove_block(slot);
        }
        inner.devices.remove(&dev.0);
        Ok(())
    }

    /// Flushes and evicts everything; registered devices are forgotten.
    pub fn shutdown(&self) -> FsResult<()> {
        let mut inner = self.inner.lock();
        for slot in 0..inner.slots.len() {
            if let Some(block) = &inner.slots[slot] {
                if block.locked() {
                    warn!(
                        "cache shutdown: block {}:{} still has lock count {}",
                        block.dev.0, block.bnum, block.lock_count
                    );
                }
                if block.busy {
                    warn!("cache shutdown: block {}:{} is busy", block.dev.0, block.bnum);
                }
            }
        }
        self.flush_all_for(&mut inner, None)?;
        let occupied: Vec<usize> = (0..inner.slots.len())
            .filter(|&slot| inner.slots[slot].is_some())
            .collect();
        for slot in occupied {
            inner.remove_block(slot);
        }
        inner.devices.clear();
        Ok(())
    }

    // Flushes until nothing of `dev` (or anything, if None) needs a write.
    // A block that is both cloned and dirty needs two rounds.
    fn flush_all_for(&self, inner: &mut MutexGuard<'_, CacheInner>, dev: Option<DeviceId>) -> FsResult<()> {
        loop {
            let mut batch: Vec<FlushEnt> = Vec::new();
            for slot in 0..inner.slots.len() {
                let Some(block) = &inner.slots[slot] else { continue };
                if dev.is_some_and(|d| block.dev != d) || block.busy {
                    continue;
                }
                if block.clone.is_none() && (!block.dirty || block.locked()) {
                    continue;
                }
                if let Some(ent) = self.take_flush_ent(inner, slot) {
                    batch.push(ent);
                }
                if batch.len() >= NUM_FLUSH_BLOCKS {
                    break;
                }
            }
            if batch.is_empty() {
                return Ok(());
            }
            self.run_flush(inner, batch)?;
        }
    }

    // ----- internals -----

    fn lookup(&self, inner: &mut MutexGuard<'_, CacheInner>, dev: DeviceId, bnum: u64) -> Lookup {
        match inner.hash.lookup(dev, bnum) {
            None => Lookup::Miss,
            Some(slot) => {
                if inner.slots[slot].as_ref().unwrap().busy {
                    Lookup::Busy
                } else {
                    Lookup::Hit(slot)
                }
            }
        }
    }

    // Evicts from the LRU end of the normal list until `needed` more blocks
    // fit. Dirty victims are flushed before they are dropped.
    fn make_room(&self, inner: &mut MutexGuard<'_, CacheInner>, needed: usize) -> FsResult<()> {
        let max_retries = needed * 256;
        let mut retries = 0;
        while inner.cur_blocks + needed > inner.max_blocks {
            let mut victims: Vec<usize> = Vec::new();
            let mut cursor = inner.normal.lru;
            let shortfall = inner.cur_blocks + needed - inner.max_blocks;
            while let Some(slot) = cursor {
                let block = inner.slots[slot].as_ref().unwrap();
                cursor = block.next;
                if block.busy {
                    continue;
                }
                if block.locked() {
                    fatal("normal list contains a locked block");
                }
                victims.push(slot);
                if victims.len() >= shortfall {
                    break;
                }
            }

            if victims.is_empty() {
                retries += 1;
                if retries >= max_retries {
                    fatal("cannot find eviction victims; all blocks are locked");
                }
                MutexGuard::unlocked(inner, || std::thread::sleep(VICTIM_RETRY_DELAY));
                continue;
            }

            let mut batch: Vec<FlushEnt> = Vec::new();
            for &slot in &victims {
                inner.slots[slot].as_mut().unwrap().busy = true;
                if let Some(ent) = self.take_flush_ent(inner, slot) {
                    batch.push(ent);
                }
            }
            if !batch.is_empty() {
                if let Err(err) = self.run_flush(inner, batch) {
                    for slot in victims {
                        inner.slots[slot].as_mut().unwrap().busy = false;
                    }
                    return Err(err);
                }
            }
            for slot in victims {
                inner.slots[slot].as_mut().unwrap().busy = false;
                inner.remove_block(slot);
            }
        }
        Ok(())
    }

    // Allocates up to `count` blocks starting at `bnum`, reads them from
    // the device in one vectored transfer, and returns their slots still
    // marked busy and detached from the lists. Answers `None` when another
    // thread cached the first block while room was being made; the caller
    // restarts its lookup.
    fn fill_from_device(
        &self,
        inner: &mut MutexGuard<'_, CacheInner>,
        dev: DeviceId,
        bnum: u64,
        count: usize,
        bsize: usize,
        file: &Arc<File>,
    ) -> FsResult<Option<Vec<usize>>> {
        self.make_room(inner, count)?;
        // Making room may have dropped the lock; the plan only covers
        // blocks that are still absent.
        let mut count = count;
        for i in 0..count {
            if inner.hash.lookup(dev, bnum + i as u64).is_some() {
                count = i;
                break;
            }
        }
        if count == 0 {
            return Ok(None);
        }
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let slot = inner.insert_block(dev, bnum + i as u64, bsize);
            inner.slots[slot].as_mut().unwrap().busy = true;
            slots.push(slot);
        }

        let datas: Vec<Arc<Mutex<Box<[u8]>>>> = slots
            .iter()
            .map(|&slot| inner.slots[slot].as_ref().unwrap().data.clone())
            .collect();

        let result = MutexGuard::unlocked(inner, || {
            let mut guards: Vec<MutexGuard<'_, Box<[u8]>>> =
                datas.iter().map(|data| data.lock()).collect();
            let mut iov: SmallVec<[IoSliceMut<'_>; NUM_FLUSH_BLOCKS]> = guards
                .iter_mut()
                .map(|guard| IoSliceMut::new(&mut guard[..]))
                .collect();
            self.stats.reads.fetch_add(1, Ordering::Relaxed);
            match nix::sys::uio::preadv(file, &mut iov, (bnum * bsize as u64) as i64) {
                Ok(n) if n == count * bsize => Ok(()),
                Ok(n) => {
                    error!("short device read: wanted {} got {}", count * bsize, n);
                    Err(FsError::Cache(libc::EIO))
                }
                Err(errno) => Err(FsError::Cache(errno as i32)),
            }
        });

        if let Err(err) = result {
            // Purge everything we allocated; a failed read must not leave
            // stale blocks behind.
            for slot in slots {
                inner.remove_block(slot);
            }
            return Err(err);
        }
        Ok(Some(slots))
    }

    // Takes the flushable state out of a block, leaving it busy. Answers
    // None when the block has nothing to write.
    fn take_flush_ent(&self, inner: &mut MutexGuard<'_, CacheInner>, slot: usize) -> Option<FlushEnt> {
        let file = {
            let block = inner.slots[slot].as_ref().unwrap();
            if !block.needs_flush() {
                return None;
            }
            if block.clone.is_none() && block.locked() {
                return None;
            }
            inner.devices.get(&block.dev.0)?.file.clone()
        };
        let block = inner.slots[slot].as_mut().unwrap();
        block.busy = true;
        Some(FlushEnt {
            slot,
            dev: block.dev,
            bnum: block.bnum,
            bsize: block.bsize,
            file,
            data: block.data.clone(),
            clone: block.clone.take(),
            commit: block.commit.take(),
            dirty: block.dirty,
            locked: block.locked(),
        })
    }

    // Flushes a batch with the cache lock dropped, then restores per-block
    // state. On a write failure every unwritten block keeps its dirty and
    // clone state so the next flush retries.
    fn run_flush(&self, inner: &mut MutexGuard<'_, CacheInner>, mut ents: Vec<FlushEnt>) -> FsResult<()> {
        let result = MutexGuard::unlocked(inner, || self.flush_ents(&mut ents));
        for ent in ents {
            let block = inner.slots[ent.slot].as_mut().unwrap();
            block.busy = false;
            block.clone = ent.clone;
            block.commit = ent.commit;
            block.dirty = ent.dirty;
        }
        result
    }

    // Writes the batch sorted by (device, block), coalescing contiguous
    // runs into single vectored writes. Each block is written at most once
    // per call: the clone wins, and live bytes that are also dirty stay
    // dirty for the next flush.
    fn flush_ents(&self, ents: &mut [FlushEnt]) -> FsResult<()> {
        ents.sort_by_key(|ent| (ent.dev.0, ent.bnum));

        let mut i = 0;
        while i < ents.len() {
            if !ents[i].pending_write() {
                i += 1;
                continue;
            }
            let bsize = ents[i].bsize;
            let start = ents[i].bnum;
            let mut j = i + 1;
            while j < ents.len()
                && j - i < NUM_FLUSH_BLOCKS
                && ents[j].dev == ents[i].dev
                && ents[j].bnum == start + (j - i) as u64
                && ents[j].pending_write()
            {
                j += 1;
            }

            let run = &ents[i..j];
            let mut guards: Vec<Option<MutexGuard<'_, Box<[u8]>>>> = Vec::with_capacity(run.len());
            for ent in run {
                if ent.clone.is_none() {
                    guards.push(Some(ent.data.lock()));
                } else {
                    guards.push(None);
                }
            }
            let mut iov: SmallVec<[IoSlice<'_>; NUM_FLUSH_BLOCKS]> = SmallVec::new();
            for (k, ent) in run.iter().enumerate() {
                let bytes: &[u8] = match &ent.clone {
                    Some(clone) => clone,
                    None => guards[k].as_ref().unwrap(),
                };
                iov.push(IoSlice::new(bytes));
            }

            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            let wanted = run.len() * bsize;
            match nix::sys::uio::pwritev(&ents[i].file, &iov, (start * bsize as u64) as i64) {
                Ok(n) if n == wanted => {}
                Ok(n) => {
                    error!(
                        "flush: short write at {}:{} ({} of {} bytes)",
                        ents[i].dev.0, start, n, wanted
                    );
                    return Err(FsError::Cache(libc::EIO));
                }
                Err(errno) => {
                    error!("flush: write failed at {}:{} ({})", ents[i].dev.0, start, errno);
                    return Err(FsError::Cache(errno as i32));
                }
            }
            drop(iov);
            drop(guards);

            for ent in &mut ents[i..j] {
                if let Some(commit) = ent.commit.take() {
                    (commit.func)(commit.journaled, 1, commit.arg);
                }
                if ent.clone.take().is_none() {
                    ent.dirty = false;
                }
            }
            i = j;
        }
        Ok(())
    }

    fn read_phys(&self, file: &File, offset: u64, buffer: &mut [u8]) -> FsResult<()> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let mut done = 0;
        while done < buffer.len() {
            let len = CHUNK.min(buffer.len() - done);
            file.read_exact_at(&mut buffer[done..done + len], offset + done as u64)?;
            done += len;
        }
        Ok(())
    }

    fn write_phys(&self, file: &File, offset: u64, buffer: &[u8]) -> FsResult<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut done = 0;
        while done < buffer.len() {
            let len = CHUNK.min(buffer.len() - done);
            file.write_all_at(&buffer[done..done + len], offset + done as u64)?;
            done += len;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BlockCache")
            .field("cur_blocks", &inner.cur_blocks)
            .field("max_blocks", &inner.max_blocks)
            .field("devices", &inner.devices.len())
            .finish()
    }
}

enum Lookup {
    Hit(usize),
    Miss,
    Busy,
}

impl CacheInner {
    // One device transfer never plans more blocks than a flush batch or
    // half the cache, whichever is smaller.
    fn plan_limit(&self) -> u64 {
        (self.max_blocks / 2).clamp(1, NUM_FLUSH_BLOCKS) as u64
    }

    fn insert_block(&mut self, dev: DeviceId, bnum: u64, bsize: usize) -> usize {
        let block = Block {
            dev,
            bnum,
            bsize,
            data: Arc::new(Mutex::new(vec![0u8; bsize].into_boxed_slice())),
            clone: None,
            commit: None,
            lock_count: 0,
            dirty: false,
            busy: false,
            prev: None,
            next: None,
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(block);
                slot
            }
            None => {
                self.slots.push(Some(block));
                self.slots.len() - 1
            }
        };
        self.hash.insert(dev, bnum, slot);
        self.cur_blocks += 1;
        slot
    }

    // Unlinks a block from whichever list holds it and drops it entirely.
    fn remove_block(&mut self, slot: usize) {
        self.detach(slot);
        let block = self.slots[slot].take().unwrap();
        if self.hash.remove(block.dev, block.bnum) != Some(slot) {
            fatal("hash table entry does not match the block being removed");
        }
        self.free_slots.push(slot);
        self.cur_blocks -= 1;
    }

    fn list_for(&mut self, locked: bool) -> &mut ListHead {
        if locked {
            &mut self.locked
        } else {
            &mut self.normal
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next, locked) = {
            let block = self.slots[slot].as_ref().unwrap();
            (block.prev, block.next, block.locked())
        };
        if let Some(prev) = prev {
            self.slots[prev].as_mut().unwrap().next = next;
        }
        if let Some(next) = next {
            self.slots[next].as_mut().unwrap().prev = prev;
        }
        let list = self.list_for(locked);
        if list.lru == Some(slot) {
            list.lru = next;
        }
        if list.mru == Some(slot) {
            list.mru = prev;
        }
        let block = self.slots[slot].as_mut().unwrap();
        block.prev = None;
        block.next = None;
    }

    fn push_mru(&mut self, slot: usize, locked: bool) {
        let old_mru = {
            let list = self.list_for(locked);
            let old = list.mru;
            list.mru = Some(slot);
            if list.lru.is_none() {
                list.lru = Some(slot);
            }
            old
        };
        if let Some(old) = old_mru {
            self.slots[old].as_mut().unwrap().next = Some(slot);
        }
        let block = self.slots[slot].as_mut().unwrap();
        block.prev = old_mru;
        block.next = None;
    }
}

// ----- process-wide instance -----

static GLOBAL_CACHE: OnceLock<Mutex<Option<Arc<BlockCache>>>> = OnceLock::new();

fn global_slot() -> &'static Mutex<Option<Arc<BlockCache>>> {
    GLOBAL_CACHE.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide cache instance.
pub fn init_global(max_blocks: usize) -> FsResult<()> {
    let mut slot = global_slot().lock();
    if slot.is_some() {
        return Err(FsError::BadRequest);
    }
    *slot = Some(Arc::new(BlockCache::new(max_blocks)));
    Ok(())
}

/// The process-wide cache, if initialized.
pub fn global() -> Option<Arc<BlockCache>> {
    global_slot().lock().clone()
}

/// Flushes, evicts and uninstalls the process-wide cache.
pub fn shutdown_global() {
    let cache = global_slot().lock().take();
    if let Some(cache) = cache {
        if let Err(err) = cache.shutdown() {
            error!("block cache shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn make_device(cache: &BlockCache, blocks: u64, bsize: usize) -> (DeviceId, File) {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; (blocks as usize) * bsize]).unwrap();
        let check = file.try_clone().unwrap();
        let dev = cache.init_device(file, blocks, bsize).unwrap();
        (dev, check)
    }

    fn read_backing(file: &File, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset).unwrap();
        buf
    }

    impl BlockCache {
        // Walks both lists and cross-checks them against the hash table:
        // every cached block is on exactly one list, and it is on the
        // locked list iff its lock count is positive.
        fn check_consistency(&self) {
            let inner = self.inner.lock();
            let mut seen = std::collections::HashSet::new();
            let mut cursor = inner.normal.lru;
            let mut last = None;
            while let Some(slot) = cursor {
                let block = inner.slots[slot].as_ref().unwrap();
                assert_eq!(block.lock_count, 0, "normal list holds a locked block");
                assert!(!block.busy, "busy block at a quiescent point");
                assert!(seen.insert(slot), "block on the normal list twice");
                assert_eq!(inner.hash.lookup(block.dev, block.bnum), Some(slot));
                last = cursor;
                cursor = block.next;
            }
            assert_eq!(inner.normal.mru, last);
            cursor = inner.locked.lru;
            last = None;
            while let Some(slot) = cursor {
                let block = inner.slots[slot].as_ref().unwrap();
                assert!(block.lock_count > 0, "locked list holds an unlocked block");
                assert!(seen.insert(slot), "block on both lists");
                assert_eq!(inner.hash.lookup(block.dev, block.bnum), Some(slot));
                last = cursor;
                cursor = block.next;
            }
            assert_eq!(inner.locked.mru, last);
            assert_eq!(seen.len(), inner.cur_blocks);
            assert_eq!(seen.len(), inner.hash.elements);
        }

        fn normal_mru(&self) -> Option<(u64, u64)> {
            let inner = self.inner.lock();
            inner
                .normal
                .mru
                .map(|slot| {
                    let block = inner.slots[slot].as_ref().unwrap();
                    (block.dev.0, block.bnum)
                })
        }
    }

    #[test]
    fn read_your_writes() {
        let cache = BlockCache::new(8);
        let (dev, _check) = make_device(&cache, 64, 512);
        let pattern = vec![0x5a_u8; 512];
        cache.cached_write(dev, 7, &pattern, 1, 512).unwrap();
        // Evict block 7 by filling the cache with other blocks.
        let mut scratch = vec![0u8; 512];
        for bnum in 8..24 {
            cache.cached_read(dev, bnum, &mut scratch, 1, 512).unwrap();
        }
        cache.cached_read(dev, 7, &mut scratch, 1, 512).unwrap();
        assert_eq!(scratch, pattern);
        cache.check_consistency();
    }

    #[test]
    fn flush_on_eviction_and_reread() {
        // Scenario: a released dirty block is flushed to the device when it
        // becomes an eviction victim, and a later get() reads it back.
        let cache = BlockCache::new(4);
        let (dev, check) = make_device(&cache, 16, 512);

        let block = cache.get_empty(dev, 0, 512).unwrap();
        block.lock().fill(0xaa);
        drop(block);
        cache.release(dev, 0);

        let mut pinned = Vec::new();
        for bnum in 1..4 {
            pinned.push(cache.get_empty(dev, bnum, 512).unwrap());
        }
        // Cache is full; block 0 is the only unlocked victim.
        let _extra = cache.get_empty(dev, 5, 512).unwrap();
        assert_eq!(read_backing(&check, 0, 512), vec![0xaa_u8; 512]);

        for bnum in (1..4).rev() {
            cache.release(dev, bnum);
        }
        cache.release(dev, 5);

        // Block 0 was evicted; this comes back from the device.
        let reread = cache.get(dev, 0, 512).unwrap();
        assert_eq!(&reread.lock()[..], &[0xaa_u8; 512][..]);
        drop(reread);
        cache.release(dev, 0);
        cache.check_consistency();
    }

    #[test]
    fn journal_commit_fires_exactly_once() {
        let cache = BlockCache::new(8);
        let (dev, check) = make_device(&cache, 64, 512);

        let block = cache.get_empty(dev, 10, 512).unwrap();
        block.lock().fill(b'A');
        drop(block);

        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let func: CommitFn = {
            let fired = fired.clone();
            let seen = seen.clone();
            Arc::new(move |bnum, count, arg| {
                fired.fetch_add(1, Ordering::SeqCst);
                seen.lock().push((bnum, count, arg));
            })
        };
        cache.set_block_info(dev, &[10], func, 0x1234).unwrap();

        // The cached bytes are still the committed ones.
        let peek = cache.get(dev, 10, 512).unwrap();
        assert_eq!(&peek.lock()[..], &[b'A'; 512][..]);
        drop(peek);
        cache.release(dev, 10);

        // Overwrite the live buffer after the commit.
        cache.cached_write(dev, 10, &[b'B'; 512], 1, 512).unwrap();

        // First flush writes the clone and fires the callback.
        cache.flush_device(dev, false).unwrap();
        assert_eq!(read_backing(&check, 10 * 512, 512), vec![b'A'; 512]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock()[..], [(10, 1, 0x1234)]);

        // Second flush writes the live bytes and does not re-fire.
        cache.flush_device(dev, false).unwrap();
        assert_eq!(read_backing(&check, 10 * 512, 512), vec![b'B'; 512]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cache.check_consistency();
    }

    #[test]
    fn released_block_moves_to_mru() {
        let cache = BlockCache::new(8);
        let (dev, _check) = make_device(&cache, 64, 512);
        let mut scratch = vec![0u8; 512];
        cache.cached_read(dev, 1, &mut scratch, 1, 512).unwrap();
        cache.cached_read(dev, 2, &mut scratch, 1, 512).unwrap();

        let block = cache.get(dev, 1, 512).unwrap();
        drop(block);
        cache.release(dev, 1);
        assert_eq!(cache.normal_mru(), Some((dev.0, 1)));
        cache.check_consistency();
    }

    #[test]
    fn contiguous_flush_coalesces_into_one_write() {
        let cache = BlockCache::new(128);
        let (dev, check) = make_device(&cache, 256, 512);
        for bnum in 0..NUM_FLUSH_BLOCKS as u64 {
            cache
                .cached_write(dev, bnum, &[bnum as u8; 512], 1, 512)
                .unwrap();
        }
        let writes_before = cache.io_stats().writes.load(Ordering::SeqCst);
        cache.flush_blocks(dev, 0, NUM_FLUSH_BLOCKS as u64).unwrap();
        assert_eq!(cache.io_stats().writes.load(Ordering::SeqCst) - writes_before, 1);
        for bnum in 0..NUM_FLUSH_BLOCKS as u64 {
            assert_eq!(read_backing(&check, bnum * 512, 512), vec![bnum as u8; 512]);
        }
        cache.check_consistency();
    }

    #[test]
    fn access_past_device_end_fails() {
        let cache = BlockCache::new(8);
        let (dev, _check) = make_device(&cache, 4, 512);
        let mut scratch = vec![0u8; 512];
        assert!(matches!(
            cache.cached_read(dev, 4, &mut scratch, 1, 512),
            Err(FsError::Cache(_))
        ));
        assert!(cache.get(dev, 17, 512).is_err());
    }

    #[test]
    fn large_transfer_bypasses_cache_but_stays_coherent() {
        let bsize = 512;
        let cache = BlockCache::new(16);
        let (dev, check) = make_device(&cache, 1024, bsize);

        // Put a fresher copy of block 3 into the cache only.
        cache.cached_write(dev, 3, &[0x77; 512], 1, bsize).unwrap();

        // 128 blocks = 64 KiB: direct read, but block 3 must come from the
        // cache.
        let mut buf = vec![0u8; 128 * bsize];
        cache.cached_read(dev, 0, &mut buf, 128, bsize).unwrap();
        assert_eq!(&buf[3 * bsize..4 * bsize], &[0x77; 512][..]);

        // Direct write updates the cached copy too.
        let data = vec![0x11_u8; 128 * bsize];
        cache.cached_write(dev, 0, &data, 128, bsize).unwrap();
        assert_eq!(read_backing(&check, 0, 128 * bsize), data);
        let block = cache.get(dev, 3, bsize).unwrap();
        assert_eq!(&block.lock()[..], &[0x11; 512][..]);
        drop(block);
        cache.release(dev, 3);
        cache.check_consistency();
    }

    #[test]
    fn remove_device_blocks_flushes_when_allowed() {
        let cache = BlockCache::new(16);
        let (dev, check) = make_device(&cache, 16, 512);
        cache.cached_write(dev, 2, &[0xcd; 512], 1, 512).unwrap();
        cache.remove_cached_device_blocks(dev, true).unwrap();
        assert_eq!(read_backing(&check, 2 * 512, 512), vec![0xcd_u8; 512]);
        // The device registration is gone with its blocks.
        let mut scratch = vec![0u8; 512];
        assert!(cache.cached_read(dev, 2, &mut scratch, 1, 512).is_err());
    }

    #[test]
    fn concurrent_get_release_keeps_invariants() {
        let cache = Arc::new(BlockCache::new(128));
        let (dev, _check) = make_device(&cache, 1024, 512);

        const THREADS: usize = 6;
        const ITERATIONS: usize = 100_000 / THREADS;
        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let cache = cache.clone();
                scope.spawn(move || {
                    // A cheap deterministic generator; seeds differ per
                    // thread.
                    let mut state = (t as u64 + 1) * 0x9e37_79b9_7f4a_7c15;
                    for _ in 0..ITERATIONS {
                        state = state
                            .wrapping_mul(6364136223846793005)
                            .wrapping_add(1442695040888963407);
                        let bnum = (state >> 33) % 1024;
                        let block = cache.get(dev, bnum, 512).unwrap();
                        drop(block);
                        cache.release(dev, bnum);
                    }
                });
            }
        });
        cache.check_consistency();
    }

    #[test]
    fn shutdown_flushes_everything() {
        let cache = BlockCache::new(8);
        let (dev, check) = make_device(&cache, 8, 512);
        let block = cache.get_empty(dev, 1, 512).unwrap();
        block.lock().fill(0xee);
        drop(block);
        let func: CommitFn = Arc::new(|_, _, _| {});
        cache.set_block_info(dev, &[1], func, 0).unwrap();
        cache.cached_write(dev, 1, &[0xef; 512], 1, 512).unwrap();
        cache.shutdown().unwrap();
        // Both the clone and the later live bytes reached the device.
        assert_eq!(read_backing(&check, 512, 512), vec![0xef_u8; 512]);
    }
}
