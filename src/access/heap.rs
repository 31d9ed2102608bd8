use crate::access::record::{Record, Rid};
use crate::storage::buffer::{BufferPoolManager, Page};
use crate::storage::disk::DiskManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::heap_page::{HeapPage, HeapPageLayout};
use crate::storage::page::{FileId, PageId, INVALID_PAGE_NO};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// File header stored at page 0 of every heap file; records live on
/// pages `[1, num_pages)`. `first_free_page_no` heads the intrusive list
/// of not-yet-full pages threaded through the page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapFileHeader {
    pub record_size: u32,
    pub num_records_per_page: u32,
    pub bitmap_size: u32,
    pub num_pages: u32,
    pub first_free_page_no: u32,
}

impl HeapFileHeader {
    pub const SIZE: usize = 20;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.record_size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.num_records_per_page.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.bitmap_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.num_pages.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.first_free_page_no.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let read = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Self {
            record_size: read(0),
            num_records_per_page: read(4),
            bitmap_size: read(8),
            num_pages: read(12),
            first_free_page_no: read(16),
        }
    }

    fn layout(&self) -> HeapPageLayout {
        HeapPageLayout {
            record_size: self.record_size as usize,
            num_records_per_page: self.num_records_per_page as usize,
            bitmap_size: self.bitmap_size as usize,
        }
    }
}

/// A pinned heap page together with its identity.
struct HeapPageHandle {
    page_id: PageId,
    page: Arc<Page>,
}

/// Handle over one heap file of fixed-width records.
pub struct HeapFile {
    buffer_pool: Arc<BufferPoolManager>,
    disk: Arc<DiskManager>,
    file_id: FileId,
    header: Mutex<HeapFileHeader>,
}

impl HeapFile {
    /// Create an empty heap file for records of `record_size` bytes and
    /// write its header page.
    pub fn create(disk: &DiskManager, path: &Path, record_size: usize) -> StorageResult<()> {
        let layout = HeapPageLayout::for_record_size(record_size);
        let header = HeapFileHeader {
            record_size: record_size as u32,
            num_records_per_page: layout.num_records_per_page as u32,
            bitmap_size: layout.bitmap_size as u32,
            num_pages: 1,
            first_free_page_no: INVALID_PAGE_NO,
        };
        disk.create_file(path)?;
        let file_id = disk.open_file(path)?;
        disk.write_page(file_id, 0, &header.to_bytes())?;
        disk.close_file(file_id)?;
        Ok(())
    }

    pub fn open(
        disk: Arc<DiskManager>,
        buffer_pool: Arc<BufferPoolManager>,
        path: &Path,
    ) -> StorageResult<Self> {
        let file_id = disk.open_file(path)?;
        let mut bytes = [0u8; HeapFileHeader::SIZE];
        disk.read_page(file_id, 0, &mut bytes)?;
        let header = HeapFileHeader::from_bytes(&bytes);
        disk.set_page_counter(file_id, header.num_pages)?;
        Ok(Self {
            buffer_pool,
            disk,
            file_id,
            header: Mutex::new(header),
        })
    }

    /// Persist the header, flush the file's pages and close the fd.
    pub fn close(self) -> StorageResult<()> {
        let header = *self.header.lock();
        self.disk.write_page(self.file_id, 0, &header.to_bytes())?;
        self.buffer_pool.flush_all_pages(self.file_id)?;
        self.disk.close_file(self.file_id)?;
        Ok(())
    }

    /// Remove a closed heap file from disk.
    pub fn destroy(disk: &DiskManager, path: &Path) -> StorageResult<()> {
        disk.destroy_file(path)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn header(&self) -> HeapFileHeader {
        *self.header.lock()
    }

    pub fn is_record(&self, rid: Rid) -> StorageResult<bool> {
        let header = *self.header.lock();
        let handle = self.fetch_page_handle(&header, rid.page_no)?;
        let set = {
            let mut data = handle.page.data_mut();
            let page = HeapPage::from_data(&mut **data, header.layout());
            rid.slot_no < header.num_records_per_page && page.slot_is_set(rid.slot_no as usize)
        };
        self.buffer_pool.unpin_page(handle.page_id, false);
        Ok(set)
    }

    /// Copy the record at `rid` out of its page.
    pub fn get_record(&self, rid: Rid) -> StorageResult<Record> {
        let header = *self.header.lock();
        let handle = self.fetch_page_handle(&header, rid.page_no)?;
        let result = {
            let mut data = handle.page.data_mut();
            let page = HeapPage::from_data(&mut **data, header.layout());
            if rid.slot_no >= header.num_records_per_page
                || !page.slot_is_set(rid.slot_no as usize)
            {
                Err(StorageError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                })
            } else {
                Ok(page.slot(rid.slot_no as usize).to_vec())
            }
        };
        self.buffer_pool.unpin_page(handle.page_id, false);
        Ok(Record { rid, data: result? })
    }

    /// Insert a record into the first not-yet-full page, allocating a
    /// fresh page when the free list is empty.
    pub fn insert_record(&self, buf: &[u8]) -> StorageResult<Rid> {
        let mut header = self.header.lock();
        assert_eq!(buf.len(), header.record_size as usize);
        let handle = self.create_page_handle(&mut header)?;
        let slot_no = {
            let mut data = handle.page.data_mut();
            let mut page = HeapPage::from_data(&mut **data, header.layout());
            let slot_no = page
                .first_free_slot()
                .expect("page on the free list has a free slot");
            page.set_slot(slot_no);
            page.write_slot(slot_no, buf);
            let num_records = page.num_records() + 1;
            page.set_num_records(num_records);
            if num_records == header.num_records_per_page {
                // page filled up: drop it from the free list head
                header.first_free_page_no = page.next_free_page_no();
            }
            slot_no
        };
        self.buffer_pool.unpin_page(handle.page_id, true);
        Ok(Rid::new(handle.page_id.page_no, slot_no as u32))
    }

    /// Install a record at a caller-chosen rid, growing the file as
    /// needed. Recovery path: prior slot state is not checked.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let mut header = self.header.lock();
        assert_eq!(buf.len(), header.record_size as usize);
        while rid.page_no >= header.num_pages {
            let handle = self.create_new_page_handle(&mut header)?;
            self.buffer_pool.unpin_page(handle.page_id, true);
        }
        let handle = self.fetch_page_handle(&header, rid.page_no)?;
        {
            let mut data = handle.page.data_mut();
            let mut page = HeapPage::from_data(&mut **data, header.layout());
            page.set_slot(rid.slot_no as usize);
            page.write_slot(rid.slot_no as usize, buf);
            let num_records = page.num_records() + 1;
            page.set_num_records(num_records);
            if num_records == header.num_records_per_page {
                header.first_free_page_no = page.next_free_page_no();
            }
        }
        self.buffer_pool.unpin_page(handle.page_id, true);
        Ok(())
    }

    pub fn delete_record(&self, rid: Rid) -> StorageResult<()> {
        let mut header = self.header.lock();
        let handle = self.fetch_page_handle(&header, rid.page_no)?;
        let result = {
            let mut data = handle.page.data_mut();
            let mut page = HeapPage::from_data(&mut **data, header.layout());
            if rid.slot_no >= header.num_records_per_page
                || !page.slot_is_set(rid.slot_no as usize)
            {
                Err(StorageError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                })
            } else {
                page.clear_slot(rid.slot_no as usize);
                let num_records = page.num_records() - 1;
                page.set_num_records(num_records);
                if num_records == header.num_records_per_page - 1 {
                    // full -> not full: prepend to the free list
                    page.set_next_free_page_no(header.first_free_page_no);
                    header.first_free_page_no = rid.page_no;
                }
                Ok(())
            }
        };
        self.buffer_pool.unpin_page(handle.page_id, result.is_ok());
        result
    }

    pub fn update_record(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let header = *self.header.lock();
        assert_eq!(buf.len(), header.record_size as usize);
        let handle = self.fetch_page_handle(&header, rid.page_no)?;
        let result = {
            let mut data = handle.page.data_mut();
            let mut page = HeapPage::from_data(&mut **data, header.layout());
            if rid.slot_no >= header.num_records_per_page
                || !page.slot_is_set(rid.slot_no as usize)
            {
                Err(StorageError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                })
            } else {
                page.write_slot(rid.slot_no as usize, buf);
                Ok(())
            }
        };
        self.buffer_pool.unpin_page(handle.page_id, result.is_ok());
        result
    }

    /// Run `f` over a pinned record page. Used by the sequential scan.
    pub(crate) fn with_page<R>(
        &self,
        page_no: u32,
        f: impl FnOnce(&HeapPage<'_>) -> R,
    ) -> StorageResult<R> {
        let header = *self.header.lock();
        let handle = self.fetch_page_handle(&header, page_no)?;
        let out = {
            let mut data = handle.page.data_mut();
            let page = HeapPage::from_data(&mut **data, header.layout());
            f(&page)
        };
        self.buffer_pool.unpin_page(handle.page_id, false);
        Ok(out)
    }

    /// Pin the record page `page_no`; the caller unpins.
    fn fetch_page_handle(
        &self,
        header: &HeapFileHeader,
        page_no: u32,
    ) -> StorageResult<HeapPageHandle> {
        if page_no == 0 || page_no >= header.num_pages {
            return Err(StorageError::PageNotExist { page_no });
        }
        let page_id = PageId::new(self.file_id, page_no);
        let page = self.buffer_pool.fetch_page(page_id)?;
        Ok(HeapPageHandle { page_id, page })
    }

    /// Allocate and initialize a fresh record page; it becomes the head
    /// of the free list. The caller unpins.
    fn create_new_page_handle(
        &self,
        header: &mut HeapFileHeader,
    ) -> StorageResult<HeapPageHandle> {
        let (page_id, page) = self.buffer_pool.new_page(self.file_id)?;
        {
            let mut data = page.data_mut();
            HeapPage::new(&mut **data, header.layout());
        }
        header.first_free_page_no = page_id.page_no;
        header.num_pages += 1;
        Ok(HeapPageHandle { page_id, page })
    }

    /// The head of the free list, or a fresh page if there is none. The
    /// caller unpins.
    fn create_page_handle(&self, header: &mut HeapFileHeader) -> StorageResult<HeapPageHandle> {
        let first_free = header.first_free_page_no;
        if first_free != INVALID_PAGE_NO {
            self.fetch_page_handle(header, first_free)
        } else {
            self.create_new_page_handle(header)
        }
    }
}
