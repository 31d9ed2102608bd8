//! Sequential scan over the live records of a heap file.

use crate::access::heap::HeapFile;
use crate::access::record::Rid;
use crate::storage::error::StorageResult;
use crate::storage::page::INVALID_PAGE_NO;

/// Cursor over every set slot of a heap file, in (page_no, slot_no)
/// order. Each step re-fetches the page it inspects; no snapshot
/// semantics are promised against concurrent modifications.
pub struct HeapScan<'a> {
    file: &'a HeapFile,
    rid: Rid,
}

impl<'a> HeapScan<'a> {
    /// Position the cursor on the first record, or at the end if the
    /// file holds none.
    pub fn new(file: &'a HeapFile) -> StorageResult<Self> {
        let mut scan = Self {
            file,
            rid: Rid::new(INVALID_PAGE_NO, 0),
        };
        let header = file.header();
        let mut page_no = 1;
        while page_no < header.num_pages {
            if let Some(slot_no) = file.with_page(page_no, |page| page.first_used_slot())? {
                scan.rid = Rid::new(page_no, slot_no as u32);
                break;
            }
            page_no += 1;
        }
        Ok(scan)
    }

    /// Advance to the next record, crossing page boundaries as needed.
    pub fn next(&mut self) -> StorageResult<()> {
        if self.is_end() {
            return Ok(());
        }
        let header = self.file.header();
        let mut page_no = self.rid.page_no;
        let mut after = Some(self.rid.slot_no as usize);
        while page_no < header.num_pages {
            let found = self.file.with_page(page_no, |page| match after {
                Some(curr) => page.next_used_slot(curr),
                None => page.first_used_slot(),
            })?;
            if let Some(slot_no) = found {
                self.rid = Rid::new(page_no, slot_no as u32);
                return Ok(());
            }
            page_no += 1;
            after = None;
        }
        self.rid = Rid::new(INVALID_PAGE_NO, 0);
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no == INVALID_PAGE_NO
    }

    /// The cursor position. Only meaningful while `is_end()` is false.
    pub fn rid(&self) -> Rid {
        self.rid
    }
}
