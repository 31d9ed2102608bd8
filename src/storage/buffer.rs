pub mod lru;
pub mod replacer;

use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageId, INVALID_PAGE_NO};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A buffer pool frame and the page currently resident in it.
///
/// Frame metadata (identity, pin count, dirty bit) is mutated only while
/// the pool latch is held. Page contents belong to pin holders through
/// the data lock; drop the data guard before calling back into the pool.
pub struct Page {
    id: RwLock<Option<PageId>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Page {
    fn new() -> Self {
        Self {
            id: RwLock::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Caches a bounded number of pages in fixed frames, enforcing pin/unpin
/// reference counting and writing dirty pages back on eviction.
pub struct BufferPoolManager {
    pages: Vec<Arc<Page>>,
    latch: Mutex<PoolState>,
    replacer: Mutex<Box<dyn Replacer>>,
    disk: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, replacer: Box<dyn Replacer>) -> Self {
        assert!(pool_size > 0);
        Self {
            pages: (0..pool_size).map(|_| Arc::new(Page::new())).collect(),
            latch: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).collect(),
            }),
            replacer: Mutex::new(replacer),
            disk,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pages.len()
    }

    /// Fetch a page, pinning it. The pin must be released with exactly one
    /// `unpin_page`. Fails with `PoolExhausted` when every frame is pinned,
    /// leaving the pool unchanged.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<Arc<Page>> {
        let mut state = self.latch.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let page = &self.pages[frame_id];
            page.pin_count.fetch_add(1, Ordering::SeqCst);
            self.replacer.lock().pin(frame_id);
            return Ok(Arc::clone(page));
        }

        let frame_id = self
            .find_victim(&mut state)
            .ok_or(StorageError::PoolExhausted)?;
        self.update_page(&mut state, frame_id, Some(page_id))?;
        let page = &self.pages[frame_id];
        self.disk
            .read_page(page_id.file_id, page_id.page_no, &mut page.data_mut()[..])?;
        self.replacer.lock().pin(frame_id);
        page.pin_count.store(1, Ordering::SeqCst);
        Ok(Arc::clone(page))
    }

    /// Allocate a fresh page on `file_id` and pin it. The page buffer is
    /// zeroed; the caller initializes it and unpins dirty.
    pub fn new_page(&self, file_id: FileId) -> StorageResult<(PageId, Arc<Page>)> {
        let mut state = self.latch.lock();
        let frame_id = self
            .find_victim(&mut state)
            .ok_or(StorageError::PoolExhausted)?;
        let page_no = match self.disk.allocate_page(file_id) {
            Ok(page_no) => page_no,
            Err(err) => {
                // hand the untouched frame back as an eviction candidate
                self.replacer.lock().unpin(frame_id);
                return Err(err);
            }
        };
        let page_id = PageId::new(file_id, page_no);
        self.update_page(&mut state, frame_id, Some(page_id))?;
        let page = &self.pages[frame_id];
        self.replacer.lock().pin(frame_id);
        page.pin_count.store(1, Ordering::SeqCst);
        Ok((page_id, Arc::clone(page)))
    }

    /// Release one pin. Returns false if the page is not resident or its
    /// pin count is already zero. Once dirty, a page stays dirty until it
    /// is flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.latch.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };
        let page = &self.pages[frame_id];
        if page.pin_count.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let remaining = page.pin_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if is_dirty {
            page.is_dirty.store(true, Ordering::SeqCst);
        }
        if remaining == 0 {
            self.replacer.lock().unpin(frame_id);
        }
        true
    }

    /// Write a resident page to disk and clear its dirty bit. Pin state is
    /// untouched. Returns false if the page id is invalid or not resident.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let state = self.latch.lock();
        if page_id.page_no == INVALID_PAGE_NO {
            return Ok(false);
        }
        match state.page_table.get(&page_id) {
            Some(&frame_id) => {
                let page = &self.pages[frame_id];
                self.disk
                    .write_page(page_id.file_id, page_id.page_no, &page.data()[..])?;
                page.is_dirty.store(false, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop a page from the pool, returning its frame to the free list.
    /// Vacuously true if the page is not resident; false if it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.latch.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };
        if self.pages[frame_id].pin_count.load(Ordering::SeqCst) != 0 {
            return Ok(false);
        }
        self.disk.deallocate_page(page_id.page_no);
        self.update_page(&mut state, frame_id, None)?;
        state.free_list.push_back(frame_id);
        Ok(true)
    }

    /// Write every resident page of `file_id` back and clear the dirty
    /// bits. Used when a file is closed.
    pub fn flush_all_pages(&self, file_id: FileId) -> StorageResult<()> {
        let _state = self.latch.lock();
        for page in &self.pages {
            let id = *page.id.read();
            if let Some(page_id) = id {
                if page_id.file_id == file_id {
                    self.disk
                        .write_page(page_id.file_id, page_id.page_no, &page.data()[..])?;
                    page.is_dirty.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    /// Pick a frame to receive a page: never-occupied frames first, then
    /// the replacer's victim. Caller holds the pool latch.
    fn find_victim(&self, state: &mut PoolState) -> Option<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Some(frame_id);
        }
        self.replacer.lock().victim()
    }

    /// Re-point a frame at `new_id`: write back the old contents if dirty,
    /// fix the page table on both sides, and zero the buffer. Caller holds
    /// the pool latch.
    fn update_page(
        &self,
        state: &mut PoolState,
        frame_id: FrameId,
        new_id: Option<PageId>,
    ) -> StorageResult<()> {
        let page = &self.pages[frame_id];
        let old_id = *page.id.read();
        if let Some(old) = old_id {
            if page.is_dirty.load(Ordering::SeqCst) {
                self.disk
                    .write_page(old.file_id, old.page_no, &page.data()[..])?;
                page.is_dirty.store(false, Ordering::SeqCst);
            }
            state.page_table.remove(&old);
        }
        *page.id.write() = new_id;
        page.data_mut().fill(0);
        if let Some(new) = new_id {
            state.page_table.insert(new, frame_id);
        }
        Ok(())
    }
}
