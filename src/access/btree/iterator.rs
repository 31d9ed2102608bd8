//! Range iteration over the leaf chain.

use crate::access::btree::BTreeIndex;
use crate::access::record::Rid;
use crate::storage::error::StorageResult;
use crate::storage::page::INVALID_PAGE_NO;

/// Position of one entry inside the leaf chain: a slot within a leaf
/// page. Distinct from `Rid`, which names a heap record; an `Iid` names
/// the index slot whose rid points at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: u32,
    pub slot_no: u32,
}

impl Iid {
    pub fn new(page_no: u32, slot_no: u32) -> Self {
        Self { page_no, slot_no }
    }
}

/// Cursor over `[begin, end)` index positions, advancing slot by slot
/// and following the leaf chain across page boundaries.
pub struct BTreeScan<'a> {
    index: &'a BTreeIndex,
    iid: Iid,
    end: Iid,
}

impl<'a> BTreeScan<'a> {
    pub fn new(index: &'a BTreeIndex, begin: Iid, end: Iid) -> Self {
        Self {
            index,
            iid: begin,
            end,
        }
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end || self.iid.page_no == INVALID_PAGE_NO
    }

    /// Step to the next entry.
    pub fn next(&mut self) -> StorageResult<()> {
        if self.is_end() {
            return Ok(());
        }
        let node = self.index.fetch_node(self.iid.page_no)?;
        self.iid.slot_no += 1;
        if self.iid.slot_no as usize >= node.num_key()
            && self.iid.page_no != self.end.page_no
            && node.next_leaf() != INVALID_PAGE_NO
        {
            self.iid = Iid::new(node.next_leaf(), 0);
        }
        self.index.unpin_node(&node, false);
        Ok(())
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    /// The heap rid stored at the cursor position.
    pub fn rid(&self) -> StorageResult<Rid> {
        self.index.get_rid(self.iid)
    }
}
