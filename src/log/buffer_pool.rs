#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::log::page::LogPage;
use crate::log::volume::ActiveVolume;
use crate::stats::LogStats;
use crate::types::{LogError, Result};

/// Logical id reserved for the log header; never cached in the pool.
pub const LOG_HEADER_PAGE_ID: i64 = -9;

/// Dirty-victim flush attempts before the pool grows instead.
const MAX_DIRTY_RETRIES: usize = 2;

/// How `fix` obtains page contents on a miss.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FixMode {
    /// Format an empty page; nothing is read from disk.
    New,
    /// Load the page from the active volume and validate it.
    Existing,
}

struct Buffer {
    page_id: Option<i64>,
    pin_count: u32,
    dirty: bool,
    recently_used: bool,
    flushing: bool,
    page: Arc<RwLock<LogPage>>,
}

impl Buffer {
    fn new(page_size: usize) -> Self {
        Self {
            page_id: None,
            pin_count: 0,
            dirty: false,
            recently_used: false,
            flushing: false,
            page: Arc::new(RwLock::new(LogPage::new(-1, page_size))),
        }
    }
}

/// A pinned buffer. Release it with [`BufferPool::unfix`].
#[derive(Debug)]
pub struct BufferHandle {
    index: usize,
    page_id: i64,
    page: Arc<RwLock<LogPage>>,
}

impl BufferHandle {
    /// Logical page held by the buffer.
    pub fn page_id(&self) -> i64 {
        self.page_id
    }

    /// Shared access to the page image.
    pub fn read(&self) -> RwLockReadGuard<'_, LogPage> {
        self.page.read()
    }

    /// Write access; the caller marks the page dirty with [`BufferPool::set_dirty`].
    pub fn write(&self) -> RwLockWriteGuard<'_, LogPage> {
        self.page.write()
    }

    /// Unpinned reference to the same buffer, used by the flush list.
    pub fn as_ref(&self) -> BufferRef {
        BufferRef {
            index: self.index,
            page_id: self.page_id,
            page: Arc::clone(&self.page),
        }
    }
}

/// Reference to a buffer that does not hold a pin.
///
/// Dirty buffers are never reclaimed, so a reference taken while the page
/// is dirty stays valid until the page is marked clean.
#[derive(Clone, Debug)]
pub struct BufferRef {
    index: usize,
    page_id: i64,
    page: Arc<RwLock<LogPage>>,
}

impl BufferRef {
    /// Logical page the reference was taken for.
    pub fn page_id(&self) -> i64 {
        self.page_id
    }

    /// Shared access to the page image.
    pub fn read(&self) -> RwLockReadGuard<'_, LogPage> {
        self.page.read()
    }
}

enum Victim {
    Free(usize),
    Clean(usize),
    OnlyDirty,
    None,
}

struct PoolInner {
    buffers: Vec<Buffer>,
    index: HashMap<i64, usize>,
    clock_hand: usize,
}

impl PoolInner {
    /// Two-pass clock: the first visit clears the reference bit, the second reclaims.
    fn select_victim(&mut self) -> Victim {
        let len = self.buffers.len();
        let mut saw_dirty = false;
        for _ in 0..len * 2 {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % len;
            let buffer = &mut self.buffers[idx];
            if buffer.page_id.is_none() {
                return Victim::Free(idx);
            }
            if buffer.pin_count > 0 || buffer.flushing {
                continue;
            }
            if buffer.recently_used {
                buffer.recently_used = false;
                continue;
            }
            if buffer.dirty {
                saw_dirty = true;
                continue;
            }
            return Victim::Clean(idx);
        }
        if saw_dirty {
            Victim::OnlyDirty
        } else {
            Victim::None
        }
    }

    fn owns(&self, buf: &BufferRef) -> bool {
        self.buffers
            .get(buf.index)
            .is_some_and(|b| b.page_id == Some(buf.page_id))
    }
}

/// Fixed-capacity cache of log pages with clock replacement.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    volume: Arc<ActiveVolume>,
    page_size: usize,
    growth_percent: usize,
    max_buffers: usize,
    stats: Arc<LogStats>,
}

impl BufferPool {
    /// Creates a pool of `initial` buffers that may grow to `max_buffers`.
    pub fn new(
        volume: Arc<ActiveVolume>,
        initial: usize,
        growth_percent: usize,
        max_buffers: usize,
        stats: Arc<LogStats>,
    ) -> Result<Self> {
        if initial < 2 {
            return Err(LogError::Invalid("buffer pool needs at least two buffers"));
        }
        let page_size = volume.page_size();
        let buffers = (0..initial).map(|_| Buffer::new(page_size)).collect();
        Ok(Self {
            inner: Mutex::new(PoolInner {
                buffers,
                index: HashMap::with_capacity(initial),
                clock_hand: 0,
            }),
            volume,
            page_size,
            growth_percent: growth_percent.max(1),
            max_buffers: max_buffers.max(initial),
            stats,
        })
    }

    /// Buffers currently allocated.
    pub fn capacity(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// Whether `page_id` is cached.
    pub fn is_resident(&self, page_id: i64) -> bool {
        self.inner.lock().index.contains_key(&page_id)
    }

    /// Whether `page_id` is cached and dirty.
    pub fn is_dirty(&self, page_id: i64) -> bool {
        let inner = self.inner.lock();
        inner
            .index
            .get(&page_id)
            .is_some_and(|&idx| inner.buffers[idx].dirty)
    }

    /// Number of dirty buffers.
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().buffers.iter().filter(|b| b.dirty).count()
    }

    /// Pins `page_id`, failing with `OutOfBuffers` when a dirty victim cannot be flushed.
    pub fn fix(&self, page_id: i64, mode: FixMode) -> Result<BufferHandle> {
        self.fix_with(page_id, mode, &mut || Ok(()))
    }

    /// Pins `page_id`; `on_dirty` must flush every pending dirty page when called.
    pub fn fix_with(
        &self,
        page_id: i64,
        mode: FixMode,
        on_dirty: &mut dyn FnMut() -> Result<()>,
    ) -> Result<BufferHandle> {
        if page_id == LOG_HEADER_PAGE_ID {
            return Err(LogError::Invalid("log header page is not cached"));
        }
        if page_id < 0 {
            return Err(LogError::InvalidOwned(format!("invalid log page id {page_id}")));
        }
        let mut dirty_retries = 0usize;
        loop {
            let mut inner = self.inner.lock();
            if let Some(&idx) = inner.index.get(&page_id) {
                let buffer = &mut inner.buffers[idx];
                buffer.pin_count += 1;
                buffer.recently_used = true;
                return Ok(BufferHandle {
                    index: idx,
                    page_id,
                    page: Arc::clone(&buffer.page),
                });
            }
            let idx = match inner.select_victim() {
                Victim::Free(idx) => idx,
                Victim::Clean(idx) => {
                    LogStats::bump(&self.stats.evictions);
                    idx
                }
                Victim::OnlyDirty if dirty_retries < MAX_DIRTY_RETRIES => {
                    drop(inner);
                    dirty_retries += 1;
                    LogStats::bump(&self.stats.dirty_victim_flushes);
                    debug!(page_id, attempt = dirty_retries, "log.buffer_pool.dirty_victim_flush");
                    on_dirty()?;
                    continue;
                }
                Victim::OnlyDirty | Victim::None => {
                    self.grow(&mut inner)?;
                    continue;
                }
            };
            let page = {
                let buffer = &mut inner.buffers[idx];
                let old = buffer.page_id.replace(page_id);
                buffer.pin_count = 1;
                buffer.recently_used = true;
                buffer.dirty = false;
                if let Some(old) = old {
                    trace!(old, new = page_id, "log.buffer_pool.evict");
                    inner.index.remove(&old);
                }
                Arc::clone(&inner.buffers[idx].page)
            };
            inner.index.insert(page_id, idx);
            let mut guard = page.write();
            drop(inner);
            match mode {
                FixMode::New => guard.reset(page_id),
                FixMode::Existing => match self.volume.read_page(page_id) {
                    Ok(loaded) => *guard = loaded,
                    Err(err) => {
                        drop(guard);
                        self.release_failed(idx, page_id);
                        return Err(err);
                    }
                },
            }
            drop(guard);
            return Ok(BufferHandle {
                index: idx,
                page_id,
                page,
            });
        }
    }

    fn release_failed(&self, idx: usize, page_id: i64) {
        let mut inner = self.inner.lock();
        if inner.buffers[idx].page_id == Some(page_id) {
            let buffer = &mut inner.buffers[idx];
            buffer.page_id = None;
            buffer.pin_count = 0;
            buffer.dirty = false;
            inner.index.remove(&page_id);
        }
    }

    fn grow(&self, inner: &mut PoolInner) -> Result<()> {
        let len = inner.buffers.len();
        if len >= self.max_buffers {
            return Err(LogError::OutOfBuffers { capacity: len });
        }
        let step = (len * self.growth_percent / 100).max(1);
        let target = (len + step).min(self.max_buffers);
        inner
            .buffers
            .try_reserve(target - len)
            .map_err(|_| LogError::OutOfBuffers { capacity: len })?;
        for _ in len..target {
            inner.buffers.push(Buffer::new(self.page_size));
        }
        LogStats::bump(&self.stats.pool_growths);
        debug!(from = len, to = target, "log.buffer_pool.grow");
        Ok(())
    }

    /// Drops one pin; the buffer becomes reclaimable once no pins remain.
    pub fn unfix(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.buffers.get_mut(handle.index) {
            if buffer.page_id == Some(handle.page_id) && buffer.pin_count > 0 {
                buffer.pin_count -= 1;
            }
        }
    }

    /// Marks the pinned page dirty so it is never reclaimed before it is written.
    pub fn set_dirty(&self, handle: &BufferHandle) {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.buffers.get_mut(handle.index) {
            if buffer.page_id == Some(handle.page_id) {
                buffer.dirty = true;
            }
        }
    }

    /// Writes a single page to its slot and clears its dirty flag. Does not sync.
    pub fn flush(&self, handle: &BufferHandle) -> Result<()> {
        let image = {
            let page = handle.read();
            let mut copy = page.clone();
            copy.seal();
            copy
        };
        self.volume
            .write_pages(handle.page_id, &[image.as_bytes()])?;
        LogStats::bump(&self.stats.pages_written);
        self.mark_clean(&[handle.as_ref()]);
        Ok(())
    }

    /// Sets or clears the in-flight flag that keeps pages out of eviction during a write.
    pub fn mark_flushing(&self, bufs: &[BufferRef], flushing: bool) {
        let mut inner = self.inner.lock();
        for buf in bufs {
            if inner.owns(buf) {
                inner.buffers[buf.index].flushing = flushing;
            }
        }
    }

    /// Clears the dirty flag on buffers still holding the referenced page.
    pub fn mark_clean(&self, bufs: &[BufferRef]) {
        let mut inner = self.inner.lock();
        for buf in bufs {
            if inner.owns(buf) {
                inner.buffers[buf.index].dirty = false;
            }
        }
    }
}
